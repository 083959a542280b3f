//! Upstream fetching
//!
//! Issues the outbound request to the origin with a filtered header set, a
//! bounded timeout, and verbatim Range pass-through. The response body is
//! decoded once, into `Body::Text` for rewritable/textual kinds and
//! `Body::Binary` otherwise, so nothing downstream re-inspects bytes.
//!
//! A non-2xx upstream status is not an error here: the gateway passes it
//! through unchanged (including 206 Partial Content). Only transport-level
//! failures (connect, timeout) surface as `UpstreamError`.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::fmt;
use url::Url;

use crate::classify::{classify, MediaKind};
use crate::config::UpstreamConfig;

/// Headers never forwarded to the origin: origin-identifying headers the
/// gateway replaces, plus hop-by-hop headers that belong to each
/// connection. `accept-encoding` is stripped because the gateway must see
/// plaintext manifest bodies to rewrite them.
const STRIPPED_HEADERS: &[&str] = &[
    "host",
    "origin",
    "referer",
    "connection",
    "content-length",
    "accept-encoding",
    "transfer-encoding",
    "keep-alive",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Upstream response headers forwarded back to the client when present.
/// `content-type` travels as its own field; `content-length` is recomputed
/// because rewriting changes the body size.
const PASSTHROUGH_HEADERS: &[&str] = &[
    "content-range",
    "accept-ranges",
    "etag",
    "last-modified",
    "content-disposition",
];

/// Response body, decoded exactly once
#[derive(Debug, Clone)]
pub enum Body {
    Text(String),
    Binary(Bytes),
}

impl Body {
    pub fn len(&self) -> usize {
        match self {
            Body::Text(s) => s.len(),
            Body::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Body::Text(s) => Bytes::from(s),
            Body::Binary(b) => b,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: Url,
    pub method: String,
    pub headers: HeaderMap,
    /// Forwarded verbatim so players can seek into partial content
    pub range: Option<String>,
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub kind: MediaKind,
    /// Pass-through subset of upstream headers, already filtered
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

/// Transport-level fetch failure (no upstream status to pass through)
#[derive(Debug, Clone)]
pub enum UpstreamError {
    Timeout,
    Network(String),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::Timeout => write!(f, "Upstream request timed out"),
            UpstreamError::Network(msg) => write!(f, "Upstream network error: {}", msg),
        }
    }
}

impl std::error::Error for UpstreamError {}

#[async_trait]
pub trait UpstreamFetch: Send + Sync {
    async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}

/// Build the outbound header set: inbound headers minus the stripped list,
/// with `User-Agent` defaulted and `Referer` pointed at the target itself
/// when absent (some origins reject referer-less media requests).
pub fn build_outbound_headers(
    inbound: &HeaderMap,
    target: &Url,
    default_user_agent: &str,
) -> HeaderMap {
    let mut outbound = HeaderMap::new();

    for (name, value) in inbound {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }

    if !outbound.contains_key(http::header::USER_AGENT) {
        if let Ok(value) = HeaderValue::from_str(default_user_agent) {
            outbound.insert(http::header::USER_AGENT, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(target.as_str()) {
        outbound.insert(http::header::REFERER, value);
    }

    outbound
}

/// reqwest-backed fetcher
pub struct HttpFetcher {
    client: reqwest::Client,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
        })
    }

    fn map_error(e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl UpstreamFetch for HttpFetcher {
    async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| UpstreamError::Network(format!("invalid method '{}'", request.method)))?;

        let mut headers = build_outbound_headers(&request.headers, &request.url, &self.user_agent);
        if let Some(range) = &request.range {
            if let Ok(value) = HeaderValue::from_str(range) {
                headers.insert(http::header::RANGE, value);
            }
        }

        let mut builder = self
            .client
            .request(method, request.url.as_str())
            .headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(Self::map_error)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let passthrough = PASSTHROUGH_HEADERS
            .iter()
            .filter_map(|name| {
                let raw = response.headers().get(*name)?;
                let value = raw.to_str().ok()?;
                Some((name.to_string(), value.to_string()))
            })
            .collect();

        let kind = classify(request.url.as_str(), content_type.as_deref());

        let body = if kind.is_text() {
            Body::Text(response.text().await.map_err(Self::map_error)?)
        } else {
            Body::Binary(response.bytes().await.map_err(Self::map_error)?)
        };

        Ok(UpstreamResponse {
            status,
            content_type,
            kind,
            headers: passthrough,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn target() -> Url {
        Url::parse("https://cdn.example/a/master.m3u8").unwrap()
    }

    #[test]
    fn test_origin_identifying_headers_are_stripped() {
        let headers = inbound(&[
            ("host", "gw.example"),
            ("origin", "https://player.example"),
            ("referer", "https://player.example/watch"),
            ("connection", "keep-alive"),
            ("content-length", "42"),
            ("x-custom", "kept"),
        ]);

        let out = build_outbound_headers(&headers, &target(), "torii/test");

        assert!(!out.contains_key("host"));
        assert!(!out.contains_key("origin"));
        assert!(!out.contains_key("connection"));
        assert!(!out.contains_key("content-length"));
        assert_eq!(out.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn test_referer_is_replaced_with_target_url() {
        let headers = inbound(&[("referer", "https://player.example/watch")]);
        let out = build_outbound_headers(&headers, &target(), "torii/test");
        assert_eq!(out.get("referer").unwrap(), target().as_str());
    }

    #[test]
    fn test_user_agent_defaulted_only_when_absent() {
        let out = build_outbound_headers(&HeaderMap::new(), &target(), "torii/test");
        assert_eq!(out.get("user-agent").unwrap(), "torii/test");

        let headers = inbound(&[("user-agent", "ExoPlayer/2.18")]);
        let out = build_outbound_headers(&headers, &target(), "torii/test");
        assert_eq!(out.get("user-agent").unwrap(), "ExoPlayer/2.18");
    }

    #[test]
    fn test_accept_encoding_is_stripped_for_rewritability() {
        let headers = inbound(&[("accept-encoding", "gzip, br")]);
        let out = build_outbound_headers(&headers, &target(), "torii/test");
        assert!(!out.contains_key("accept-encoding"));
    }

    #[test]
    fn test_authorization_and_range_survive_the_filter() {
        let headers = inbound(&[("authorization", "Bearer t"), ("range", "bytes=0-1023")]);
        let out = build_outbound_headers(&headers, &target(), "torii/test");
        assert_eq!(out.get("authorization").unwrap(), "Bearer t");
        assert_eq!(out.get("range").unwrap(), "bytes=0-1023");
    }

    #[test]
    fn test_body_length_and_conversion() {
        let text = Body::Text("abc".to_string());
        assert_eq!(text.len(), 3);
        assert!(!text.is_empty());
        assert_eq!(text.into_bytes(), Bytes::from_static(b"abc"));

        let binary = Body::Binary(Bytes::from_static(b"\x00\x01"));
        assert_eq!(binary.len(), 2);
        assert_eq!(binary.into_bytes(), Bytes::from_static(b"\x00\x01"));
    }
}
