//! Request pipeline
//!
//! Orchestrates one request end to end: client validation → admission →
//! URL/token resolution → cache lookup → upstream fetch → classification →
//! manifest rewriting → cache store → response, with the observability
//! pipeline dispatched on every terminal outcome. Stage ordering is
//! strict: each stage runs only after the previous one succeeded.
//!
//! All shared state lives behind injected handles (fast store, fetcher);
//! the pipeline itself holds no locks and keeps no per-request state
//! beyond the `RequestContext` it owns.

use bytes::Bytes;
use http::header::HeaderMap;
use std::sync::Arc;
use std::time::Instant;

use crate::auth::TokenService;
use crate::cache::{CachedResponse, ResponseCache};
use crate::classify::{classify, MediaKind};
use crate::config::Config;
use crate::error::GatewayError;
use crate::observability::{ObservabilityPipeline, RequestOutcome};
use crate::rate_limit::AdmissionController;
use crate::resolver::{ResolvedUrl, UrlResolver};
use crate::rewrite::rewrite_manifest;
use crate::store::FastStore;
use crate::upstream::{Body, UpstreamFetch, UpstreamRequest};

/// HTTP status reported for requests the client abandoned mid-flight
const STATUS_CLIENT_CLOSED: u16 = 499;

/// Lifetime of tokens minted for proactive renewal
const RENEWED_TOKEN_TTL_SECS: u64 = 3600;

/// Per-request context, created at entry and consumed by `handle`
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_ip: String,
    pub method: String,
    pub url_param: Option<String>,
    pub key_param: Option<String>,
    pub token: Option<String>,
    pub headers: HeaderMap,
    pub range: Option<String>,
    pub body: Option<Bytes>,
    pub received_at: Instant,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, client_ip: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            method: method.into(),
            url_param: None,
            key_param: None,
            token: None,
            headers: HeaderMap::new(),
            range: None,
            body: None,
            received_at: Instant::now(),
        }
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// URL recorded in the audit trail when resolution never produced one.
    /// Short-key requests are attributed by their key.
    fn audit_url(&self) -> String {
        match (&self.url_param, &self.key_param) {
            (Some(url), _) => url.clone(),
            (None, Some(key)) => format!("key:{}", key),
            (None, None) => String::new(),
        }
    }
}

/// Response handed back to the transport layer
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn cors_headers() -> Vec<(String, String)> {
    vec![
        ("access-control-allow-origin".to_string(), "*".to_string()),
        (
            "access-control-allow-methods".to_string(),
            "GET, POST, PUT, DELETE, OPTIONS".to_string(),
        ),
        ("access-control-allow-headers".to_string(), "*".to_string()),
        (
            "cross-origin-resource-policy".to_string(),
            "cross-origin".to_string(),
        ),
    ]
}

fn error_response(err: &GatewayError, max_requests: u64) -> GatewayResponse {
    let mut headers = cors_headers();
    headers.push(("content-type".to_string(), "text/plain".to_string()));

    if let GatewayError::Admission { retry_after, .. } = err {
        let reset_at = chrono::Utc::now().timestamp() as u64 + retry_after;
        headers.push(("retry-after".to_string(), retry_after.to_string()));
        headers.push(("x-ratelimit-limit".to_string(), max_requests.to_string()));
        headers.push(("x-ratelimit-remaining".to_string(), "0".to_string()));
        headers.push(("x-ratelimit-reset".to_string(), reset_at.to_string()));
    }

    GatewayResponse {
        status: err.status_code(),
        headers,
        body: Bytes::from(err.to_string()),
    }
}

/// The gateway core: all collaborators injected at construction
pub struct Gateway {
    config: Arc<Config>,
    admission: AdmissionController,
    resolver: UrlResolver,
    tokens: TokenService,
    fetcher: Arc<dyn UpstreamFetch>,
    cache: ResponseCache,
    observability: ObservabilityPipeline,
}

impl Gateway {
    pub fn new(config: Config, store: Arc<dyn FastStore>, fetcher: Arc<dyn UpstreamFetch>) -> Self {
        let config = Arc::new(config);
        Self {
            admission: AdmissionController::new(Arc::clone(&store), config.rate_limit.clone()),
            resolver: UrlResolver::new(Arc::clone(&store), config.resolver.clone()),
            tokens: TokenService::new(
                config.auth.secret_key.clone(),
                config.auth.renew_margin_secs,
            ),
            cache: ResponseCache::new(Arc::clone(&store), config.cache.clone()),
            observability: ObservabilityPipeline::new(store, config.observability.clone()),
            fetcher,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn resolver(&self) -> &UrlResolver {
        &self.resolver
    }

    pub fn observability(&self) -> &ObservabilityPipeline {
        &self.observability
    }

    /// Check a `Authorization: Bearer ...` value against the admin token.
    /// Admin surfaces are closed when no admin token is configured.
    pub fn admin_authorized(&self, authorization: Option<&str>) -> bool {
        match (&self.config.auth.admin_token, authorization) {
            (Some(expected), Some(header)) => {
                header.strip_prefix("Bearer ") == Some(expected.as_str())
            }
            _ => false,
        }
    }

    /// Handle one proxy request. Never returns an error: every failure is
    /// mapped to an HTTP response, and every terminal outcome (including
    /// failures) is dispatched to the observability pipeline.
    pub async fn handle(&self, ctx: RequestContext) -> GatewayResponse {
        // If the client disconnects, the transport drops this future and
        // the in-flight upstream fetch with it. The guard still records
        // the truncated outcome from its Drop impl.
        let mut abort_guard = AbortGuard::new(&self.observability, &ctx);

        let response = self.run(&ctx).await;
        abort_guard.disarm();

        match response {
            Ok(response) => {
                tracing::info!(
                    client_ip = %ctx.client_ip,
                    method = %ctx.method,
                    status = response.status,
                    duration_ms = ctx.received_at.elapsed().as_millis() as u64,
                    "Request completed"
                );
                response
            }
            Err(err) => {
                let status = err.status_code();
                if status >= 500 {
                    tracing::error!(client_ip = %ctx.client_ip, error = %err, "Request failed");
                } else {
                    tracing::debug!(client_ip = %ctx.client_ip, error = %err, "Request rejected");
                }

                self.record(&ctx, ctx.audit_url(), status, 0, MediaKind::Other, false, false);
                error_response(&err, self.admission.max_requests())
            }
        }
    }

    async fn run(&self, ctx: &RequestContext) -> Result<GatewayResponse, GatewayError> {
        // Stage 1: client identity. An unidentifiable client is a hard
        // validation failure, not a silently admitted one.
        if ctx.client_ip.trim().is_empty() {
            return Err(GatewayError::Validation(
                "client identifier missing".to_string(),
            ));
        }

        // Stage 2: admission
        let admission = self.admission.admit(&ctx.client_ip).await;
        if !admission.allowed {
            return Err(GatewayError::Admission {
                reason: "request quota exceeded".to_string(),
                retry_after: admission
                    .reset_at
                    .saturating_sub(chrono::Utc::now().timestamp() as u64)
                    .max(1),
            });
        }

        // Stage 3: URL resolution (raw parameter or short key)
        let resolved = match (&ctx.url_param, &ctx.key_param) {
            (Some(raw), _) => self.resolver.resolve(Some(raw))?,
            (None, Some(key)) => self.resolver.resolve_key(key).await?,
            (None, None) => self.resolver.resolve(None)?,
        };

        // Stage 4: access token. A valid token close to expiry gets a
        // replacement in the response so players never play into a 403.
        let renew_advised = self.check_token(ctx, &resolved)?;

        let url = resolved.url.as_str().to_string();

        // Stage 5: cache lookup; a hit skips the fetch and rewrite stages.
        // Ranged requests bypass the cache entirely: entries hold full
        // bodies, and a 206 slice must never be stored or replayed.
        let cached = if ctx.range.is_none() {
            self.cache.get(&url).await
        } else {
            None
        };
        let mut response = if let Some(hit) = cached {
            self.serve_cached(ctx, &resolved, hit).await?
        } else {
            self.fetch_and_forward(ctx, &resolved, &url).await?
        };

        if renew_advised {
            response.headers.push((
                "x-renewed-token".to_string(),
                self.tokens.issue(&url, RENEWED_TOKEN_TTL_SECS),
            ));
        }

        Ok(response)
    }

    async fn fetch_and_forward(
        &self,
        ctx: &RequestContext,
        resolved: &ResolvedUrl,
        url: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        // Stage 6: upstream fetch
        let request = UpstreamRequest {
            url: resolved.url.clone(),
            method: ctx.method.clone(),
            headers: ctx.headers.clone(),
            range: ctx.range.clone(),
            body: ctx.body.clone(),
        };
        let upstream = self
            .fetcher
            .fetch(request)
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        // Stage 7: rewrite manifests so sub-resources keep flowing through
        // the gateway
        let kind = upstream.kind;
        let body = match upstream.body {
            Body::Text(text) if kind.is_rewritable() && (200..300).contains(&upstream.status) => {
                Body::Text(rewrite_manifest(
                    &text,
                    &resolved.url,
                    &self.config.server.public_url,
                ))
            }
            other => other,
        };

        // Stage 8: cache store (post-rewrite, so hits replay as-is).
        // Never store what a ranged request fetched.
        if ctx.range.is_none() {
            let entry = CachedResponse {
                status: upstream.status,
                content_type: upstream.content_type.clone(),
                kind,
                headers: upstream.headers.clone(),
                body: (&body).into(),
                stored_at: chrono::Utc::now().timestamp(),
            };
            self.cache.put(url, &entry).await;
        }

        // Stage 9: bandwidth quota on the bytes actually served
        let bytes = body.len() as u64;
        let bandwidth = self.admission.track_bandwidth(&ctx.client_ip, bytes).await;
        if !bandwidth.allowed {
            return Err(GatewayError::Admission {
                reason: "bandwidth quota exceeded".to_string(),
                retry_after: self.admission.window_reset_in_secs(),
            });
        }

        self.record(
            ctx,
            url.to_string(),
            upstream.status,
            bytes,
            kind,
            resolved.sanitized_differs,
            false,
        );

        Ok(self.build_response(
            upstream.status,
            upstream.content_type.as_deref(),
            kind,
            &upstream.headers,
            body.into_bytes(),
        ))
    }

    /// Validate the request's token against the resolved URL. Returns
    /// whether the (valid) token is close enough to expiry to warrant a
    /// proactive replacement.
    fn check_token(
        &self,
        ctx: &RequestContext,
        resolved: &ResolvedUrl,
    ) -> Result<bool, GatewayError> {
        match &ctx.token {
            Some(token) => {
                if !self.tokens.verify(token, resolved.url.as_str()) {
                    return Err(GatewayError::Forbidden(
                        "invalid or expired access token".to_string(),
                    ));
                }
                Ok(self.tokens.should_renew(token))
            }
            None if self.config.auth.require_token => Err(GatewayError::Forbidden(
                "access token required".to_string(),
            )),
            None => Ok(false),
        }
    }

    async fn serve_cached(
        &self,
        ctx: &RequestContext,
        resolved: &ResolvedUrl,
        hit: CachedResponse,
    ) -> Result<GatewayResponse, GatewayError> {
        let bytes = hit.body.len() as u64;
        let bandwidth = self.admission.track_bandwidth(&ctx.client_ip, bytes).await;
        if !bandwidth.allowed {
            return Err(GatewayError::Admission {
                reason: "bandwidth quota exceeded".to_string(),
                retry_after: self.admission.window_reset_in_secs(),
            });
        }

        self.record(
            ctx,
            resolved.url.as_str().to_string(),
            hit.status,
            bytes,
            hit.kind,
            resolved.sanitized_differs,
            true,
        );

        let body: Body = hit.body.into();
        Ok(self.build_response(
            hit.status,
            hit.content_type.as_deref(),
            hit.kind,
            &hit.headers,
            body.into_bytes(),
        ))
    }

    fn build_response(
        &self,
        status: u16,
        content_type: Option<&str>,
        kind: MediaKind,
        passthrough: &[(String, String)],
        body: Bytes,
    ) -> GatewayResponse {
        let mut headers = cors_headers();
        headers.push((
            "content-type".to_string(),
            content_type
                .unwrap_or_else(|| kind.fallback_content_type())
                .to_string(),
        ));
        headers.push(("cache-control".to_string(), kind.cache_control().to_string()));
        headers.extend(passthrough.iter().cloned());

        GatewayResponse {
            status,
            headers,
            body,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        ctx: &RequestContext,
        url: String,
        status: u16,
        bytes: u64,
        kind: MediaKind,
        sanitized: bool,
        served_from_cache: bool,
    ) {
        let _ = self.observability.dispatch(RequestOutcome {
            client_ip: ctx.client_ip.clone(),
            url,
            status,
            bytes,
            duration_ms: ctx.received_at.elapsed().as_millis() as u64,
            kind,
            sanitized_url: sanitized,
            served_from_cache,
            edge_cacheable: kind.edge_cacheable(),
            user_agent: ctx.header("user-agent"),
            referer: ctx.header("referer"),
        });
    }
}

/// Records an aborted outcome if the request future is dropped before a
/// terminal outcome was produced (client disconnect mid-stream).
struct AbortGuard {
    observability: ObservabilityPipeline,
    received_at: Instant,
    outcome: Option<RequestOutcome>,
}

impl AbortGuard {
    fn new(observability: &ObservabilityPipeline, ctx: &RequestContext) -> Self {
        let url = ctx.audit_url();
        Self {
            observability: observability.clone(),
            received_at: ctx.received_at,
            outcome: Some(RequestOutcome {
                client_ip: ctx.client_ip.clone(),
                url: url.clone(),
                status: STATUS_CLIENT_CLOSED,
                bytes: 0,
                duration_ms: 0,
                kind: classify(&url, None),
                sanitized_url: false,
                served_from_cache: false,
                edge_cacheable: false,
                user_agent: None,
                referer: None,
            }),
        }
    }

    fn disarm(&mut self) {
        self.outcome = None;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if let Some(mut outcome) = self.outcome.take() {
            outcome.duration_ms = self.received_at.elapsed().as_millis() as u64;
            let _ = self.observability.dispatch(outcome);
        }
    }
}
