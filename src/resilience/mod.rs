//! Resilience infrastructure: circuit breaker, graceful degradation, and
//! coordinated recovery.

pub mod circuit_breaker;
pub mod degradation;
pub mod recovery;

pub use circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker, ToolStats};
pub use degradation::{DegradationLevel, DegradationManager};
pub use recovery::{RecoveryCoordinator, RecoveryReport, RecoveryStep};
