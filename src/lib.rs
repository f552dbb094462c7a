//! Self-learning selector cache with resilience infrastructure.
//!
//! Sits between a natural-language intent layer and a browser-automation
//! executor: remembers which locator satisfied which phrasing, adapts
//! across paraphrases, typos, DOM changes, and environment moves, and
//! guards the executor boundary with a circuit breaker and graceful
//! degradation.

pub mod cache;
pub mod config;
pub mod context;
pub mod dom;
pub mod error;
pub mod normalizer;
pub mod protocol;
pub mod resilience;
pub mod scenario;
pub mod telemetry;
pub mod tools;

// Re-export the types most callers need
pub use cache::{BidirectionalCache, CacheBackend, CacheHit, LookupSource, SqliteStore};
pub use config::MemoryConfig;
pub use context::SystemContext;
pub use error::{BoundaryError, ErrorKind, MemoryError, Result};
pub use normalizer::{NormalizedIntent, SmartNormalizer};
pub use resilience::{BreakerState, CircuitBreaker, DegradationLevel, DegradationManager};
pub use scenario::{NewScenario, Scenario, ScenarioStore, Step, StepAction};
