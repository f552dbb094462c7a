//! Unified error types and failure classification.
//!
//! Errors that cross the tool boundary carry a structured payload so a
//! dispatcher can render suggestions and retry hints. Failures recorded by
//! the circuit breaker are classified by substring rules into a fixed set
//! of kinds with retriability and trip behavior.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Classified failure kinds observed at the executor boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Browser process crashed or the CDP connection dropped
    BrowserCrash,
    /// Network or request timeout
    NetworkTimeout,
    /// Element could not be located or is not visible
    ElementNotFound,
    /// Memory or heap exhaustion
    MemoryExhaustion,
    /// Connection refused or reset by peer
    ConnectionRefused,
    /// Input failed validation or was malformed
    Validation,
    /// Anything we could not classify
    Unknown,
}

impl ErrorKind {
    /// Classify an error message using fixed, case-insensitive substring rules.
    pub fn classify(message: &str) -> Self {
        let msg = message.to_lowercase();

        if msg.contains("browser crash")
            || msg.contains("browser has crashed")
            || msg.contains("disconnect")
        {
            ErrorKind::BrowserCrash
        } else if msg.contains("element not found")
            || msg.contains("not visible")
            || msg.contains("no element")
        {
            ErrorKind::ElementNotFound
        } else if msg.contains("out of memory")
            || msg.contains("memory")
            || msg.contains("heap")
        {
            ErrorKind::MemoryExhaustion
        } else if msg.contains("connection refused") || msg.contains("connection reset") {
            ErrorKind::ConnectionRefused
        } else if msg.contains("network") || msg.contains("timeout") {
            ErrorKind::NetworkTimeout
        } else if msg.contains("validation") || msg.contains("malformed") || msg.contains("invalid")
        {
            ErrorKind::Validation
        } else {
            ErrorKind::Unknown
        }
    }

    /// Whether a retry of the failed operation can reasonably succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            ErrorKind::BrowserCrash => true,
            ErrorKind::NetworkTimeout => true,
            ErrorKind::ElementNotFound => true,
            ErrorKind::MemoryExhaustion => false,
            ErrorKind::ConnectionRefused => true,
            ErrorKind::Validation => false,
            ErrorKind::Unknown => true,
        }
    }

    /// Whether this failure counts toward tripping the circuit breaker.
    ///
    /// Element-not-found is a page-state problem, not an infrastructure
    /// problem, so it never trips the breaker.
    pub fn should_trip(&self) -> bool {
        match self {
            ErrorKind::BrowserCrash => true,
            ErrorKind::NetworkTimeout => true,
            ErrorKind::ElementNotFound => false,
            ErrorKind::MemoryExhaustion => true,
            ErrorKind::ConnectionRefused => true,
            ErrorKind::Validation => false,
            ErrorKind::Unknown => true,
        }
    }

    pub fn suggestions(&self) -> Vec<String> {
        match self {
            ErrorKind::BrowserCrash => vec![
                "Restart the browser session".to_string(),
                "Check available system resources".to_string(),
            ],
            ErrorKind::NetworkTimeout => vec![
                "Retry with a longer timeout".to_string(),
                "Verify the target host is reachable".to_string(),
            ],
            ErrorKind::ElementNotFound => vec![
                "Wait for the page to finish loading".to_string(),
                "Invalidate the cached selector and re-resolve".to_string(),
            ],
            ErrorKind::MemoryExhaustion => vec![
                "Reduce concurrent sessions".to_string(),
                "Clear snapshot cache entries".to_string(),
            ],
            ErrorKind::ConnectionRefused => vec![
                "Verify the browser endpoint is running".to_string(),
                "Check the configured base URL".to_string(),
            ],
            ErrorKind::Validation => {
                vec!["Fix the request parameters and resend".to_string()]
            }
            ErrorKind::Unknown => vec!["Inspect logs for details".to_string()],
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::BrowserCrash => "browser_crash",
            ErrorKind::NetworkTimeout => "network_timeout",
            ErrorKind::ElementNotFound => "element_not_found",
            ErrorKind::MemoryExhaustion => "memory_exhaustion",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::Validation => "validation",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error at {path}: {cause}")]
    Sqlite { path: PathBuf, cause: String },

    #[error("database not writable at {path}: {cause}")]
    NotWritable { path: PathBuf, cause: String },

    #[error("snapshot payload could not be decoded: {0}")]
    SnapshotDecode(String),

    #[error("background task failed: {0}")]
    TaskJoin(String),
}

/// Errors surfaced by public operations of this crate.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("circuit breaker is open for {tool}, retry after {next_retry_time}")]
    CircuitOpen {
        tool: String,
        next_retry_time: DateTime<Utc>,
    },

    #[error("circuit breaker half-open capacity exhausted for {tool}")]
    HalfOpenExhausted { tool: String },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("tool {tool} failed: {message}")]
    Execution {
        tool: String,
        message: String,
        kind: ErrorKind,
    },

    #[error("scenario not found: {0}")]
    ScenarioNotFound(String),

    #[error("operation requires confirmation: {0}")]
    ConfirmationRequired(String),

    #[error("operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },
}

impl MemoryError {
    /// Classified kind for breaker accounting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::Validation { .. } => ErrorKind::Validation,
            MemoryError::Execution { kind, .. } => *kind,
            MemoryError::Timeout { .. } => ErrorKind::NetworkTimeout,
            MemoryError::Store(_) => ErrorKind::Unknown,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Structured error payload visible at the tool boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryError {
    pub error: String,
    pub suggestions: Vec<String>,
    #[serde(rename = "fallbackAvailable")]
    pub fallback_available: bool,
    #[serde(rename = "canRetry")]
    pub can_retry: bool,
    #[serde(rename = "degradationLevel", skip_serializing_if = "Option::is_none")]
    pub degradation_level: Option<String>,
    #[serde(rename = "estimatedRecovery", skip_serializing_if = "Option::is_none")]
    pub estimated_recovery: Option<String>,
}

impl BoundaryError {
    /// Build the wire payload for an internal error.
    pub fn from_error(err: &MemoryError, degradation_level: Option<String>) -> Self {
        let kind = err.kind();
        let estimated_recovery = match err {
            MemoryError::CircuitOpen { next_retry_time, .. } => {
                let remaining = (*next_retry_time - Utc::now()).num_seconds().max(0);
                Some(format!("~{}s", remaining))
            }
            _ => None,
        };

        Self {
            error: err.to_string(),
            suggestions: kind.suggestions(),
            fallback_available: matches!(kind, ErrorKind::ElementNotFound),
            can_retry: kind.is_retriable(),
            degradation_level,
            estimated_recovery,
        }
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
