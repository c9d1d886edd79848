// Configuration module for ctxls
// Reads from environment variables with sensible defaults

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Aggregate result-cache capacity in bytes (CTXLS_CACHE_CAPACITY_BYTES)
    pub cache_capacity_bytes: usize,

    /// Result-cache entry lifetime in seconds (CTXLS_CACHE_TTL_SECS)
    pub cache_ttl_secs: u64,

    /// Per-request backend deadline in seconds (CTXLS_REQUEST_TIMEOUT_SECS)
    pub request_timeout_secs: u64,

    /// Backend spawn + handshake deadline in seconds (CTXLS_START_TIMEOUT_SECS)
    pub start_timeout_secs: u64,

    /// Default token budget for context payloads (CTXLS_MAX_TOKENS)
    pub max_tokens: usize,

    /// Workspace root override (CTXLS_WORKSPACE_ROOT); CLI flag wins,
    /// then this, then the process working directory.
    pub workspace_root: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_capacity_bytes: 10_000_000,
            cache_ttl_secs: 300,
            request_timeout_secs: 30,
            start_timeout_secs: 10,
            max_tokens: 4_000,
            workspace_root: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(val) = env::var("CTXLS_CACHE_CAPACITY_BYTES") {
            if let Ok(parsed) = val.parse() {
                config.cache_capacity_bytes = parsed;
            } else {
                eprintln!(
                    "ctxls: Warning: Invalid CTXLS_CACHE_CAPACITY_BYTES value: {}, using default: {}",
                    val, config.cache_capacity_bytes
                );
            }
        }

        if let Ok(val) = env::var("CTXLS_CACHE_TTL_SECS") {
            if let Ok(parsed) = val.parse() {
                config.cache_ttl_secs = parsed;
            } else {
                eprintln!(
                    "ctxls: Warning: Invalid CTXLS_CACHE_TTL_SECS value: {}, using default: {}",
                    val, config.cache_ttl_secs
                );
            }
        }

        if let Ok(val) = env::var("CTXLS_REQUEST_TIMEOUT_SECS") {
            if let Ok(parsed) = val.parse() {
                config.request_timeout_secs = parsed;
            } else {
                eprintln!(
                    "ctxls: Warning: Invalid CTXLS_REQUEST_TIMEOUT_SECS value: {}, using default: {}",
                    val, config.request_timeout_secs
                );
            }
        }

        if let Ok(val) = env::var("CTXLS_START_TIMEOUT_SECS") {
            if let Ok(parsed) = val.parse() {
                config.start_timeout_secs = parsed;
            } else {
                eprintln!(
                    "ctxls: Warning: Invalid CTXLS_START_TIMEOUT_SECS value: {}, using default: {}",
                    val, config.start_timeout_secs
                );
            }
        }

        if let Ok(val) = env::var("CTXLS_MAX_TOKENS") {
            if let Ok(parsed) = val.parse() {
                config.max_tokens = parsed;
            } else {
                eprintln!(
                    "ctxls: Warning: Invalid CTXLS_MAX_TOKENS value: {}, using default: {}",
                    val, config.max_tokens
                );
            }
        }

        if let Ok(val) = env::var("CTXLS_WORKSPACE_ROOT") {
            if !val.trim().is_empty() {
                config.workspace_root = Some(PathBuf::from(val));
            }
        }

        config
    }

    /// Get the global configuration instance
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::from_env)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}
