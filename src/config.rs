//! Runtime configuration.
//!
//! Environment variables supply the base URL and session directory; the
//! cache root is a fixed subdirectory under the project tree. Component
//! tunables live in plain structs with defaults so tests can build them
//! inline.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable carrying the automation base URL.
pub const ENV_BASE_URL: &str = "SELECTOR_MEMORY_BASE_URL";
/// Environment variable carrying the session directory.
pub const ENV_SESSION_DIR: &str = "SELECTOR_MEMORY_SESSION_DIR";

/// Fixed cache subdirectory under the project tree.
pub const CACHE_DIR_NAME: &str = ".selector-memory/cache";

/// Top-level configuration assembled at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Base URL for the environment under automation, if configured
    pub base_url: Option<String>,
    /// Directory holding session artifacts (breaker state file lives here)
    pub session_dir: PathBuf,
    /// Directory holding the cache database
    pub cache_dir: PathBuf,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub validator: ValidatorConfig,
}

impl MemoryConfig {
    /// Build configuration from the process environment.
    pub fn from_env() -> Self {
        let base_url = env::var(ENV_BASE_URL).ok().filter(|s| !s.is_empty());
        let session_dir = env::var(ENV_SESSION_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".selector-memory/session"));
        let cache_dir = PathBuf::from(CACHE_DIR_NAME);

        Self {
            base_url,
            session_dir,
            cache_dir,
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            validator: ValidatorConfig::default(),
        }
    }

    /// Configuration rooted at a caller-supplied directory, for tests and
    /// embedded use.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            base_url: None,
            session_dir: root.join("session"),
            cache_dir: root.join("cache"),
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            validator: ValidatorConfig::default(),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.cache_dir.join("selector-memory.db")
    }

    pub fn breaker_state_path(&self) -> PathBuf {
        self.session_dir.join("circuit-breaker.json")
    }
}

/// Tunables for the bidirectional cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for learned input mappings
    pub selector_ttl: Duration,
    /// Default TTL for snapshot entries
    pub snapshot_ttl: Duration,
    /// Upper bound of stored variations per (selector, url)
    pub max_variations_per_selector: usize,
    /// Interval between cleanup passes
    pub cleanup_interval: Duration,
    /// Candidate cap for the reverse lookup tier
    pub reverse_candidates: usize,
    /// Candidate cap for the fuzzy lookup tier
    pub fuzzy_candidates: usize,
    /// Recency window for fuzzy candidates
    pub fuzzy_recency: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            selector_ttl: Duration::from_secs(7 * 24 * 3600),
            snapshot_ttl: Duration::from_secs(3600),
            max_variations_per_selector: 10,
            cleanup_interval: Duration::from_secs(300),
            reverse_candidates: 10,
            fuzzy_candidates: 20,
            fuzzy_recency: Duration::from_secs(3600),
        }
    }
}

/// Circuit breaker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Windowed failure rate at which the breaker trips
    pub failure_threshold: f64,
    /// Operation timeout
    pub timeout: Duration,
    /// Sliding window length for the failure rate
    pub monitoring_window: Duration,
    /// Consecutive tripping failures that force an open
    pub max_consecutive_failures: u32,
    pub initial_backoff_delay: Duration,
    pub max_backoff_delay: Duration,
    pub backoff_multiplier: f64,
    /// Admissions allowed in one half-open episode
    pub half_open_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            timeout: Duration::from_millis(30_000),
            monitoring_window: Duration::from_millis(60_000),
            max_consecutive_failures: 5,
            initial_backoff_delay: Duration::from_millis(1_000),
            max_backoff_delay: Duration::from_millis(60_000),
            backoff_multiplier: 2.0,
            half_open_threshold: 3,
        }
    }
}

/// Protocol validator tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Bounded recovery attempts for locally recoverable shapes
    pub max_recovery_attempts: u32,
    /// Maximum accepted string length after sanitization
    pub max_string_length: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            max_string_length: 4096,
        }
    }
}
