// Configuration module

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cache: ResponseCacheConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public base URL of the proxy endpoint, used when rewriting manifest
    /// URIs (e.g. "https://gw.example.com/proxy")
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            public_url: default_public_url(),
        }
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_public_url() -> String {
    "http://localhost:8080/proxy".to_string()
}

/// Fast store backend selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, suitable for single-node deployments and tests
    #[default]
    Memory,
    /// Redis-backed store, shared across gateway instances
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Per-operation timeout for store round trips; expired operations
    /// fail open (admission) or count as a miss (cache)
    #[serde(default = "default_store_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            operation_timeout_ms: default_store_timeout_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Secret used to sign access tokens. Set via ${TORII_SECRET_KEY} in
    /// the config file rather than a literal.
    pub secret_key: String,
    /// Tokens within this margin of expiry are flagged for renewal
    #[serde(default = "default_renew_margin_secs")]
    pub renew_margin_secs: u64,
    /// Bearer token guarding the token-issuance and stats endpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
    /// When true, every proxy request must carry a valid access token
    #[serde(default)]
    pub require_token: bool,
}

fn default_renew_margin_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum requests per client per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    /// Fixed window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Maximum response bytes per client per window
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    /// Responses smaller than this are not counted against the bandwidth
    /// quota (avoids counter round trips for tiny assets)
    #[serde(default = "default_min_tracked_bytes")]
    pub min_tracked_bytes: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            max_bytes: default_max_bytes(),
            min_tracked_bytes: default_min_tracked_bytes(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_requests() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_bytes() -> u64 {
    500 * 1024 * 1024 // 500MB
}

fn default_min_tracked_bytes() -> u64 {
    64 * 1024 // 64KB
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_manifest_ttl_secs")]
    pub manifest_ttl_secs: u64,
    #[serde(default = "default_caption_ttl_secs")]
    pub caption_ttl_secs: u64,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            manifest_ttl_secs: default_manifest_ttl_secs(),
            caption_ttl_secs: default_caption_ttl_secs(),
        }
    }
}

fn default_manifest_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_caption_ttl_secs() -> u64 {
    600 // 10 minutes
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Hard timeout for the whole upstream fetch
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    /// User-Agent sent when the inbound request carries none
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("torii/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResolverConfig {
    /// When true, reject URLs whose path carries an extension outside the
    /// media allow-list
    #[serde(default)]
    pub restrict_extensions: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Maximum durable log entries retained in the store list
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
    /// Expiry for rolling counters, refreshed on every increment
    #[serde(default = "default_metrics_window_secs")]
    pub metrics_window_secs: u64,
    /// Retention for per-day aggregate hashes
    #[serde(default = "default_daily_stats_ttl_days")]
    pub daily_stats_ttl_days: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            max_log_entries: default_max_log_entries(),
            metrics_window_secs: default_metrics_window_secs(),
            daily_stats_ttl_days: default_daily_stats_ttl_days(),
        }
    }
}

fn default_max_log_entries() -> usize {
    10_000
}

fn default_metrics_window_secs() -> u64 {
    300
}

fn default_daily_stats_ttl_days() -> u64 {
    30
}

impl Config {
    /// Parse YAML with `${VAR}` environment variable expansion.
    ///
    /// All referenced variables must be set; a missing variable is a
    /// configuration error, not an empty substitution.
    pub fn from_yaml_with_env(yaml: &str) -> Result<Self, String> {
        let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
            .map_err(|e| format!("Internal regex error: {}", e))?;

        // Check all referenced variables exist before substituting
        for caps in re.captures_iter(yaml) {
            let var_name = &caps[1];
            if std::env::var(var_name).is_err() {
                return Err(format!(
                    "Environment variable '{}' referenced in config is not set",
                    var_name
                ));
            }
        }

        let substituted = re.replace_all(yaml, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap() // Safe because we checked above
        });

        let config: Config =
            serde_yaml::from_str(&substituted).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        Self::from_yaml_with_env(&yaml)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.auth.secret_key.is_empty() {
            return Err("auth.secret_key cannot be empty".to_string());
        }

        if self.server.public_url.is_empty() {
            return Err("server.public_url cannot be empty".to_string());
        }

        if !self.server.public_url.starts_with("http://")
            && !self.server.public_url.starts_with("https://")
        {
            return Err(format!(
                "server.public_url '{}' must be an absolute http(s) URL",
                self.server.public_url
            ));
        }

        if self.rate_limit.window_secs == 0 {
            return Err("rate_limit.window_secs must be > 0".to_string());
        }

        if self.rate_limit.max_requests == 0 {
            return Err("rate_limit.max_requests must be > 0".to_string());
        }

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_empty() {
            return Err("store.redis_url cannot be empty when backend is redis".to_string());
        }

        if self.observability.max_log_entries == 0 {
            return Err("observability.max_log_entries must be > 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
auth:
  secret_key: test-secret
"#
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config = Config::from_yaml_with_env(minimal_yaml()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.cache.manifest_ttl_secs, 300);
        assert_eq!(config.upstream.timeout_secs, 30);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(!config.resolver.restrict_extensions);
    }

    #[test]
    fn test_empty_secret_key_is_rejected() {
        let yaml = r#"
auth:
  secret_key: ""
"#;
        let result = Config::from_yaml_with_env(yaml);
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("secret_key"));
    }

    #[test]
    fn test_env_var_expansion_substitutes_value() {
        std::env::set_var("TORII_TEST_SECRET", "from-env");
        let yaml = r#"
auth:
  secret_key: ${TORII_TEST_SECRET}
"#;
        let config = Config::from_yaml_with_env(yaml).unwrap();
        assert_eq!(config.auth.secret_key, "from-env");
    }

    #[test]
    fn test_missing_env_var_is_an_error() {
        let yaml = r#"
auth:
  secret_key: ${TORII_DEFINITELY_NOT_SET}
"#;
        let result = Config::from_yaml_with_env(yaml);
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("TORII_DEFINITELY_NOT_SET"));
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let yaml = r#"
auth:
  secret_key: s
store:
  backend: redis
  redis_url: ""
"#;
        assert!(Config::from_yaml_with_env(yaml).is_err());
    }

    #[test]
    fn test_relative_public_url_is_rejected() {
        let yaml = r#"
auth:
  secret_key: s
server:
  public_url: "/proxy"
"#;
        assert!(Config::from_yaml_with_env(yaml).is_err());
    }

    #[test]
    fn test_config_loads_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "auth:\n  secret_key: file-secret\nserver:\n  port: 9090\n"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.auth.secret_key, "file-secret");
        assert_eq!(config.server.port, 9090);
    }
}
