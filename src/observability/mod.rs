//! Observability pipeline
//!
//! Records every terminal request outcome twice, off the response path:
//! - a durable `LogRecord` appended to a bounded store list (audit trail,
//!   consumed by the dashboard backend)
//! - rolling counters with short, per-increment-refreshed expiries that
//!   approximate trailing-window rates, plus per-day aggregate hashes for
//!   historical stats
//!
//! `dispatch` spawns a detached task; the response is already on the wire
//! and never waits for either sink. Sink failures are WARN-logged and
//! swallowed — logging is a side channel, not a reason to fail a request.

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::classify::MediaKind;
use crate::config::ObservabilityConfig;
use crate::store::{FastStore, StoreError};

const LOG_LIST_KEY: &str = "logs";
const STATS_HASH_PREFIX: &str = "stats";
const METRIC_PREFIX: &str = "metrics";

/// Terminal outcome of one request, assembled by the pipeline
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub client_ip: String,
    pub url: String,
    pub status: u16,
    pub bytes: u64,
    pub duration_ms: u64,
    pub kind: MediaKind,
    pub sanitized_url: bool,
    pub served_from_cache: bool,
    pub edge_cacheable: bool,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
}

impl RequestOutcome {
    fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// Durable audit row. Append-only; pruned externally by age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub url: String,
    pub status: u16,
    pub bytes: u64,
    pub duration_ms: u64,
    pub media_kind: MediaKind,
    pub sanitized_url: bool,
    pub served_from_cache: bool,
    pub edge_cacheable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
}

impl LogRecord {
    fn from_outcome(outcome: &RequestOutcome) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            client_ip: outcome.client_ip.clone(),
            url: outcome.url.clone(),
            status: outcome.status,
            bytes: outcome.bytes,
            duration_ms: outcome.duration_ms,
            media_kind: outcome.kind,
            sanitized_url: outcome.sanitized_url,
            served_from_cache: outcome.served_from_cache,
            edge_cacheable: outcome.edge_cacheable,
            user_agent: outcome.user_agent.clone(),
            referer: outcome.referer.clone(),
        }
    }
}

/// Snapshot of the rolling counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollingSnapshot {
    pub total: i64,
    pub success: i64,
    pub error: i64,
    pub outgoing: i64,
    pub cache_hit: i64,
    pub bytes: i64,
    pub duration_ms_sum: i64,
    pub duration_count: i64,
}

/// Filter for the paginated log query
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub status: Option<u16>,
    pub client_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub records: Vec<LogRecord>,
    /// Total entries in the store list (pre-filter)
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateStats {
    pub total_requests: u64,
    pub total_bytes: u64,
    pub bytes_formatted: String,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Percentage of successful requests, 0-100
    pub success_rate: u64,
    pub avg_duration_ms: f64,
}

#[derive(Clone)]
pub struct ObservabilityPipeline {
    store: Arc<dyn FastStore>,
    config: ObservabilityConfig,
}

impl ObservabilityPipeline {
    pub fn new(store: Arc<dyn FastStore>, config: ObservabilityConfig) -> Self {
        Self { store, config }
    }

    /// Fire-and-forget recording. The returned handle exists for tests;
    /// the request path drops it without awaiting.
    pub fn dispatch(&self, outcome: RequestOutcome) -> tokio::task::JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.record(outcome).await;
        })
    }

    /// Record one outcome into all sinks. The durable append and the
    /// counter updates have no data dependency and run concurrently.
    pub async fn record(&self, outcome: RequestOutcome) {
        let record = LogRecord::from_outcome(&outcome);

        let (log_result, rolling_result, daily_result) = tokio::join!(
            self.append_log(&record),
            self.bump_rolling(&outcome),
            self.bump_daily(&outcome),
        );

        if let Err(e) = log_result {
            tracing::warn!(error = %e, "Durable log append failed");
        }
        if let Err(e) = rolling_result {
            tracing::warn!(error = %e, "Rolling metrics update failed");
        }
        if let Err(e) = daily_result {
            tracing::warn!(error = %e, "Daily stats update failed");
        }
    }

    async fn append_log(&self, record: &LogRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)
            .map_err(|e| StoreError::Unavailable(format!("log serialization: {}", e)))?;
        self.store
            .push_trim(LOG_LIST_KEY, &json, self.config.max_log_entries)
            .await
    }

    async fn bump_rolling(&self, outcome: &RequestOutcome) -> Result<(), StoreError> {
        let ttl = Duration::from_secs(self.config.metrics_window_secs);

        let mut bumps: Vec<(String, i64)> = vec![
            (format!("{}:total", METRIC_PREFIX), 1),
            (format!("{}:bytes", METRIC_PREFIX), outcome.bytes as i64),
            (
                format!("{}:duration_ms_sum", METRIC_PREFIX),
                outcome.duration_ms as i64,
            ),
            (format!("{}:duration_count", METRIC_PREFIX), 1),
        ];

        if outcome.is_success() {
            bumps.push((format!("{}:success", METRIC_PREFIX), 1));
        } else {
            bumps.push((format!("{}:error", METRIC_PREFIX), 1));
        }

        if outcome.served_from_cache {
            bumps.push((format!("{}:cache_hit", METRIC_PREFIX), 1));
        } else {
            bumps.push((format!("{}:outgoing", METRIC_PREFIX), 1));
        }

        let increments = bumps
            .iter()
            .map(|(key, amount)| self.store.incr_rolling(key, *amount, ttl));
        try_join_all(increments).await?;
        Ok(())
    }

    async fn bump_daily(&self, outcome: &RequestOutcome) -> Result<(), StoreError> {
        let day = Utc::now().format("%Y-%m-%d");
        let key = format!("{}:{}", STATS_HASH_PREFIX, day);
        let ttl = Duration::from_secs(self.config.daily_stats_ttl_days * 24 * 60 * 60);
        let success_field = if outcome.is_success() {
            "successful_requests"
        } else {
            "failed_requests"
        };

        let increments = vec![
            self.store.hash_incr(&key, "total_requests", 1, ttl),
            self.store
                .hash_incr(&key, "total_bytes", outcome.bytes as i64, ttl),
            self.store.hash_incr(&key, success_field, 1, ttl),
            self.store
                .hash_incr(&key, "total_duration_ms", outcome.duration_ms as i64, ttl),
        ];

        try_join_all(increments).await?;
        Ok(())
    }

    /// Paginated, filterable log query for the dashboard backend.
    /// Filters apply after the page fetch, so `total` is pre-filter.
    pub async fn query_logs(
        &self,
        filter: &LogFilter,
        page: usize,
        page_size: usize,
    ) -> Result<LogPage, StoreError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 1000);

        let start = ((page - 1) * page_size) as isize;
        let stop = start + page_size as isize - 1;

        let (raw_entries, total) = tokio::join!(
            self.store.list_range(LOG_LIST_KEY, start, stop),
            self.store.list_len(LOG_LIST_KEY),
        );

        let records = raw_entries?
            .iter()
            .filter_map(|raw| serde_json::from_str::<LogRecord>(raw).ok())
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| {
                filter
                    .client_ip
                    .as_deref()
                    .map_or(true, |ip| r.client_ip == ip)
            })
            .collect();

        Ok(LogPage {
            records,
            total: total?,
            page,
            page_size,
        })
    }

    /// Aggregate the last `days` per-day stat hashes
    pub async fn aggregate_stats(&self, days: u32) -> Result<AggregateStats, StoreError> {
        let mut total_requests = 0u64;
        let mut total_bytes = 0u64;
        let mut successful_requests = 0u64;
        let mut failed_requests = 0u64;
        let mut total_duration_ms = 0u64;

        let now = Utc::now();
        for offset in 0..days.max(1) {
            let day = (now - chrono::Duration::days(offset as i64)).format("%Y-%m-%d");
            let key = format!("{}:{}", STATS_HASH_PREFIX, day);
            let fields = self.store.hash_get_all(&key).await?;

            let field = |name: &str| -> u64 {
                fields
                    .get(name)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0)
            };

            total_requests += field("total_requests");
            total_bytes += field("total_bytes");
            successful_requests += field("successful_requests");
            failed_requests += field("failed_requests");
            total_duration_ms += field("total_duration_ms");
        }

        let success_rate = if total_requests > 0 {
            successful_requests * 100 / total_requests
        } else {
            0
        };
        let avg_duration_ms = if total_requests > 0 {
            total_duration_ms as f64 / total_requests as f64
        } else {
            0.0
        };

        Ok(AggregateStats {
            total_requests,
            total_bytes,
            bytes_formatted: format_bytes(total_bytes),
            successful_requests,
            failed_requests,
            success_rate,
            avg_duration_ms,
        })
    }

    /// Current rolling counter values
    pub async fn rolling_snapshot(&self) -> Result<RollingSnapshot, StoreError> {
        let read = |name: &str| {
            let key = format!("{}:{}", METRIC_PREFIX, name);
            let store = Arc::clone(&self.store);
            async move { store.get_counter(&key).await.map(|v| v.unwrap_or(0)) }
        };

        let (total, success, error, outgoing, cache_hit, bytes, duration_ms_sum, duration_count) = tokio::join!(
            read("total"),
            read("success"),
            read("error"),
            read("outgoing"),
            read("cache_hit"),
            read("bytes"),
            read("duration_ms_sum"),
            read("duration_count"),
        );

        Ok(RollingSnapshot {
            total: total?,
            success: success?,
            error: error?,
            outgoing: outgoing?,
            cache_hit: cache_hit?,
            bytes: bytes?,
            duration_ms_sum: duration_ms_sum?,
            duration_count: duration_count?,
        })
    }
}

/// Human-readable byte count for the stats surface
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let exponent = (bytes as f64).log2() as usize / 10;
    let exponent = exponent.min(UNITS.len() - 1);
    let value = bytes as f64 / 1024f64.powi(exponent as i32);

    if exponent == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[exponent])
    }
}
