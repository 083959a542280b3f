//! URL resolution and validation
//!
//! Turns the inbound `url` (or `key`) parameter into a vetted absolute
//! upstream URL. Two failure classes are kept distinct: a malformed URL is
//! a validation error (400), an unknown or expired short key is a
//! not-found (404).

use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::ResolverConfig;
use crate::error::GatewayError;
use crate::store::FastStore;

/// Extensions admitted in restrictive mode: manifest, segment, caption,
/// container and image formats a media player actually requests
const ALLOWED_EXTENSIONS: &[&str] = &[
    "m3u8", "m3u", "mpd", "ts", "m4s", "mp4", "m4a", "m4v", "webm", "mp3", "aac", "ogg", "wav",
    "flac", "key", "vtt", "srt", "json", "jpg", "jpeg", "png", "webp", "gif", "svg", "avif",
];

/// A validated upstream target
#[derive(Debug, Clone)]
pub struct ResolvedUrl {
    pub url: Url,
    /// Whether stripping the query string changes the URL. Audit-only; the
    /// fetched URL is always the full one.
    pub sanitized_differs: bool,
}

pub struct UrlResolver {
    store: Arc<dyn FastStore>,
    config: ResolverConfig,
}

impl UrlResolver {
    pub fn new(store: Arc<dyn FastStore>, config: ResolverConfig) -> Self {
        Self { store, config }
    }

    /// Validate a raw `url` parameter into a fetchable upstream URL
    pub fn resolve(&self, raw: Option<&str>) -> Result<ResolvedUrl, GatewayError> {
        let raw = raw
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::Validation("missing 'url' parameter".to_string()))?;

        let url = Url::parse(raw)
            .map_err(|e| GatewayError::Validation(format!("invalid url '{}': {}", raw, e)))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(GatewayError::Validation(format!(
                    "unsupported scheme '{}', only http(s) is proxied",
                    other
                )))
            }
        }

        if url.host_str().is_none() {
            return Err(GatewayError::Validation(
                "url has no host".to_string(),
            ));
        }

        if self.config.restrict_extensions {
            if let Some(ext) = path_extension(url.path()) {
                if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
                    return Err(GatewayError::Forbidden(format!(
                        "extension '.{}' is not an allowed media type",
                        ext
                    )));
                }
            }
            // Extension-less paths stay admitted: many origins serve
            // manifests from bare routes
        }

        let sanitized_differs = url.query().is_some();

        Ok(ResolvedUrl {
            url,
            sanitized_differs,
        })
    }

    /// Resolve an opaque short key to its registered URL via the store
    pub async fn resolve_key(&self, key: &str) -> Result<ResolvedUrl, GatewayError> {
        if key.is_empty() {
            return Err(GatewayError::Validation("missing 'key' parameter".to_string()));
        }

        let stored = self
            .store
            .get_bytes(&format!("short:{}", key))
            .await
            .map_err(|e| GatewayError::Internal(format!("short-key lookup failed: {}", e)))?;

        let Some(raw) = stored else {
            return Err(GatewayError::NotFound(format!(
                "short key '{}' is unknown or expired",
                key
            )));
        };

        let raw = String::from_utf8(raw)
            .map_err(|_| GatewayError::Internal("stored short-key mapping is not UTF-8".to_string()))?;

        self.resolve(Some(&raw))
    }

    /// Register a short key → URL mapping (operator/dashboard side)
    pub async fn register_key(
        &self,
        key: &str,
        url: &str,
        ttl: Duration,
    ) -> Result<(), GatewayError> {
        // Validate before storing so resolution can't later hand out junk
        self.resolve(Some(url))?;

        self.store
            .set_bytes(&format!("short:{}", key), url.as_bytes(), ttl)
            .await
            .map_err(|e| GatewayError::Internal(format!("short-key registration failed: {}", e)))
    }
}

fn path_extension(path: &str) -> Option<String> {
    let last_segment = path.rsplit('/').next()?;
    let (_, ext) = last_segment.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn resolver(restrict: bool) -> UrlResolver {
        UrlResolver::new(
            Arc::new(MemoryStore::new()),
            ResolverConfig {
                restrict_extensions: restrict,
            },
        )
    }

    #[test]
    fn test_valid_absolute_http_urls_resolve() {
        let r = resolver(false);
        for url in [
            "http://o.example/a.m3u8",
            "https://o.example/path/master.m3u8",
            "https://o.example:8443/seg.ts?tok=1",
        ] {
            assert!(r.resolve(Some(url)).is_ok(), "{} should resolve", url);
        }
    }

    #[test]
    fn test_missing_parameter_is_validation_error() {
        let r = resolver(false);
        for raw in [None, Some("")] {
            let err = r.resolve(raw).unwrap_err();
            assert_eq!(err.status_code(), 400);
        }
    }

    #[test]
    fn test_non_absolute_and_non_http_inputs_are_invalid() {
        let r = resolver(false);
        for raw in ["/relative/path.m3u8", "ftp://o.example/a.m3u8", "not a url", "file:///etc/passwd"] {
            let err = r.resolve(Some(raw)).unwrap_err();
            assert_eq!(err.status_code(), 400, "{} should be rejected", raw);
        }
    }

    #[test]
    fn test_sanitized_flag_set_only_when_query_present() {
        let r = resolver(false);
        assert!(r.resolve(Some("https://o.example/a.m3u8?sig=x")).unwrap().sanitized_differs);
        assert!(!r.resolve(Some("https://o.example/a.m3u8")).unwrap().sanitized_differs);
    }

    #[test]
    fn test_restrictive_mode_rejects_unknown_extensions() {
        let r = resolver(true);
        let err = r.resolve(Some("https://o.example/page.html")).unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn test_restrictive_mode_admits_media_and_bare_paths() {
        let r = resolver(true);
        assert!(r.resolve(Some("https://o.example/a/master.m3u8")).is_ok());
        assert!(r.resolve(Some("https://o.example/a/seg.ts")).is_ok());
        assert!(r.resolve(Some("https://o.example/live/stream")).is_ok());
    }

    #[tokio::test]
    async fn test_short_key_roundtrip() {
        let r = resolver(false);
        r.register_key("abc123", "https://o.example/master.m3u8", Duration::from_secs(60))
            .await
            .unwrap();

        let resolved = r.resolve_key("abc123").await.unwrap();
        assert_eq!(resolved.url.as_str(), "https://o.example/master.m3u8");
    }

    #[tokio::test]
    async fn test_unknown_short_key_is_not_found_not_validation() {
        let r = resolver(false);
        let err = r.resolve_key("nope").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_registering_invalid_url_fails() {
        let r = resolver(false);
        let result = r
            .register_key("bad", "not-a-url", Duration::from_secs(60))
            .await;
        assert!(result.is_err());
    }
}
