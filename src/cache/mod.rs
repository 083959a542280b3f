//! Response cache
//!
//! Keyed by the full upstream URL (query string included, since queries
//! select upstream variants). Entries are MessagePack-encoded and live in
//! the fast store under a kind-dependent TTL, so the store itself enforces
//! the freshness invariant: an expired entry is simply absent.
//!
//! Only manifest-family and caption responses are cached. Segments are
//! large, already CDN-cacheable upstream, and would dominate store memory.
//! Cached manifests are stored post-rewrite, so a hit skips both the
//! fetcher and the rewriter.
//!
//! All failures degrade: a store or decode error on read is a miss, a
//! write error is logged and dropped.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::classify::MediaKind;
use crate::config::ResponseCacheConfig;
use crate::store::FastStore;
use crate::upstream::Body;

/// Cached body, mirroring `upstream::Body` in a serializable shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CachedBody {
    Text(String),
    Binary(Vec<u8>),
}

impl CachedBody {
    pub fn len(&self) -> usize {
        match self {
            CachedBody::Text(s) => s.len(),
            CachedBody::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&Body> for CachedBody {
    fn from(body: &Body) -> Self {
        match body {
            Body::Text(s) => CachedBody::Text(s.clone()),
            Body::Binary(b) => CachedBody::Binary(b.to_vec()),
        }
    }
}

impl From<CachedBody> for Body {
    fn from(body: CachedBody) -> Self {
        match body {
            CachedBody::Text(s) => Body::Text(s),
            CachedBody::Binary(b) => Body::Binary(b.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub kind: MediaKind,
    /// Pass-through headers captured at fetch time
    pub headers: Vec<(String, String)>,
    pub body: CachedBody,
    /// Unix timestamp of insertion, for diagnostics
    pub stored_at: i64,
}

pub struct ResponseCache {
    store: Arc<dyn FastStore>,
    config: ResponseCacheConfig,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn FastStore>, config: ResponseCacheConfig) -> Self {
        Self { store, config }
    }

    fn key(url: &str) -> String {
        format!("cache:{}", url)
    }

    /// TTL for a cacheable kind, `None` when the kind is never cached
    fn ttl_for(&self, kind: MediaKind) -> Option<Duration> {
        match kind {
            MediaKind::Manifest | MediaKind::ContainerManifest => {
                Some(Duration::from_secs(self.config.manifest_ttl_secs))
            }
            MediaKind::Caption => Some(Duration::from_secs(self.config.caption_ttl_secs)),
            _ => None,
        }
    }

    pub async fn get(&self, url: &str) -> Option<CachedResponse> {
        if !self.config.enabled {
            return None;
        }

        let raw = match self.store.get_bytes(&Self::key(url)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(url, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        match rmp_serde::from_slice(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(url, error = %e, "Cache entry undecodable, treating as miss");
                None
            }
        }
    }

    /// Store a response if its kind is cacheable. Best-effort: failures
    /// are logged, never propagated.
    pub async fn put(&self, url: &str, response: &CachedResponse) {
        if !self.config.enabled {
            return;
        }

        let Some(ttl) = self.ttl_for(response.kind) else {
            return;
        };

        // Only full 200 bodies are replayable; a 206 slice or an error
        // body would be served to every later full request
        if response.status != 200 {
            return;
        }

        let encoded = match rmp_serde::to_vec(response) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(url, error = %e, "Cache entry encoding failed");
                return;
            }
        };

        if let Err(e) = self.store.set_bytes(&Self::key(url), &encoded, ttl).await {
            tracing::warn!(url, error = %e, "Cache write failed");
        }
    }
}
