//! HTTP transport
//!
//! Accept loop and request adaptation: hyper requests become
//! `RequestContext`s for the pipeline, `GatewayResponse`s become hyper
//! responses. Routing is deliberately small:
//!
//! - `GET|POST|PUT|DELETE /proxy?url=...` (or `?key=...`) — the core path
//! - `OPTIONS *` — CORS preflight
//! - `GET /healthz` — liveness
//! - `GET /token`, `GET /stats`, `GET /logs` — admin surfaces, guarded by
//!   the configured bearer token

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::observability::LogFilter;
use crate::pipeline::{Gateway, GatewayResponse, RequestContext};

/// Run the accept loop until ctrl-c
pub async fn run(
    gateway: Arc<Gateway>,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "Gateway listening");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                return Ok(());
            }
        };

        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let gateway = Arc::clone(&gateway);
                async move { Ok::<_, Infallible>(handle_request(gateway, peer, req).await) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(error = %e, "Connection closed with error");
            }
        });
    }
}

async fn handle_request(
    gateway: Arc<Gateway>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == http::Method::OPTIONS {
        return preflight_response();
    }

    let params = query_params(req.uri().query());

    match (method.as_str(), path.as_str()) {
        ("GET", "/healthz") => plain(StatusCode::OK, "ok"),
        ("GET" | "POST" | "PUT" | "DELETE", "/proxy") => {
            proxy(gateway, peer, req, params).await
        }
        ("GET", "/token") => issue_token(gateway, &req, &params),
        ("GET", "/stats") => stats(gateway, &req, &params).await,
        ("GET", "/logs") => logs(gateway, &req, &params).await,
        (_, "/proxy") => plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        _ => plain(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn proxy(
    gateway: Arc<Gateway>,
    peer: SocketAddr,
    req: Request<Incoming>,
    mut params: HashMap<String, String>,
) -> Response<Full<Bytes>> {
    let mut ctx = RequestContext::new(req.method().as_str(), client_ip(req.headers(), peer));
    ctx.url_param = params.remove("url");
    ctx.key_param = params.remove("key");
    ctx.token = params.remove("token");
    ctx.range = req
        .headers()
        .get(http::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ctx.headers = req.headers().clone();

    if matches!(req.method(), &http::Method::POST | &http::Method::PUT) {
        match req.into_body().collect().await {
            Ok(collected) => ctx.body = Some(collected.to_bytes()),
            Err(e) => {
                return plain(
                    StatusCode::BAD_REQUEST,
                    &format!("failed to read request body: {}", e),
                )
            }
        }
    }

    to_hyper(gateway.handle(ctx).await)
}

fn issue_token(
    gateway: Arc<Gateway>,
    req: &Request<Incoming>,
    params: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    if !gateway.admin_authorized(bearer(req)) {
        return plain(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    let Some(url) = params.get("url") else {
        return plain(StatusCode::BAD_REQUEST, "missing 'url' parameter");
    };
    if let Err(e) = gateway.resolver().resolve(Some(url)) {
        return plain(StatusCode::BAD_REQUEST, &e.to_string());
    }

    let ttl = params
        .get("ttl")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(3600);
    let token = gateway.tokens().issue(url, ttl);

    json(
        StatusCode::OK,
        &serde_json::json!({ "token": token, "expires_in": ttl }),
    )
}

async fn stats(
    gateway: Arc<Gateway>,
    req: &Request<Incoming>,
    params: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    if !gateway.admin_authorized(bearer(req)) {
        return plain(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    let days = params
        .get("days")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(1);

    let (aggregate, rolling) = tokio::join!(
        gateway.observability().aggregate_stats(days),
        gateway.observability().rolling_snapshot(),
    );

    match (aggregate, rolling) {
        (Ok(aggregate), Ok(rolling)) => json(
            StatusCode::OK,
            &serde_json::json!({ "aggregate": aggregate, "rolling": rolling }),
        ),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Stats query failed");
            plain(StatusCode::SERVICE_UNAVAILABLE, "stats unavailable")
        }
    }
}

async fn logs(
    gateway: Arc<Gateway>,
    req: &Request<Incoming>,
    params: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    if !gateway.admin_authorized(bearer(req)) {
        return plain(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    let filter = LogFilter {
        status: params.get("status").and_then(|v| v.parse().ok()),
        client_ip: params.get("ip").cloned(),
    };
    let page = params
        .get("page")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let page_size = params
        .get("page_size")
        .and_then(|v| v.parse().ok())
        .unwrap_or(50);

    match gateway.observability().query_logs(&filter, page, page_size).await {
        Ok(page) => json(StatusCode::OK, &page),
        Err(e) => {
            tracing::warn!(error = %e, "Log query failed");
            plain(StatusCode::SERVICE_UNAVAILABLE, "logs unavailable")
        }
    }
}

/// First hop of `x-forwarded-for`, falling back to the socket peer
fn client_ip(headers: &http::HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

fn query_params(query: Option<&str>) -> HashMap<String, String> {
    let Some(query) = query else {
        return HashMap::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn bearer<'a>(req: &'a Request<Incoming>) -> Option<&'a str> {
    req.headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("access-control-allow-origin", "*")
        .header(
            "access-control-allow-methods",
            "GET, POST, PUT, DELETE, OPTIONS",
        )
        .header("access-control-allow-headers", "*")
        .header("access-control-max-age", "86400")
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn plain(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .header("access-control-allow-origin", "*")
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn json<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("access-control-allow-origin", "*")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// Convert a pipeline response into a hyper response, dropping any header
/// that does not survive HTTP header validation
fn to_hyper(response: GatewayResponse) -> Response<Full<Bytes>> {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));

    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    builder
        .body(Full::new(response.body))
        .unwrap_or_else(|_| {
            let mut fallback = Response::new(Full::new(Bytes::from_static(b"internal error")));
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> http::HeaderMap {
        let mut map = http::HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                name.parse::<http::header::HeaderName>().unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    fn peer() -> SocketAddr {
        "192.0.2.7:50000".parse().unwrap()
    }

    #[test]
    fn test_client_ip_prefers_first_forwarded_hop() {
        let h = headers(&[("x-forwarded-for", "203.0.113.9, 10.0.0.1")]);
        assert_eq!(client_ip(&h, peer()), "203.0.113.9");
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        assert_eq!(client_ip(&http::HeaderMap::new(), peer()), "192.0.2.7");

        let empty = headers(&[("x-forwarded-for", "")]);
        assert_eq!(client_ip(&empty, peer()), "192.0.2.7");
    }

    #[test]
    fn test_query_params_percent_decodes() {
        let params = query_params(Some(
            "url=https%3A%2F%2Fo.example%2Fa%2Fmaster.m3u8&token=abc",
        ));
        assert_eq!(
            params.get("url").map(String::as_str),
            Some("https://o.example/a/master.m3u8")
        );
        assert_eq!(params.get("token").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_query_params_empty_query() {
        assert!(query_params(None).is_empty());
        assert!(query_params(Some("")).is_empty());
    }
}
