//! Coordinated recovery across the breaker, the storage pool, and the
//! degradation level.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::circuit_breaker::CircuitBreaker;
use super::degradation::{DegradationLevel, DegradationManager};
use crate::cache::SqliteStore;

/// One recovery step's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub name: String,
    pub attempted: bool,
    pub succeeded: bool,
    pub detail: String,
}

/// Outcome of one coordinated recovery attempt. Steps are optional and
/// report partial success individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub steps: Vec<RecoveryStep>,
    pub level_after: String,
    pub any_success: bool,
}

/// Runs the fixed recovery sequence: breaker probe, storage health check,
/// then a single-step level promotion on any component success.
pub struct RecoveryCoordinator {
    breaker: Arc<CircuitBreaker>,
    store: Arc<SqliteStore>,
    degradation: Arc<DegradationManager>,
}

impl RecoveryCoordinator {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        store: Arc<SqliteStore>,
        degradation: Arc<DegradationManager>,
    ) -> Self {
        Self {
            breaker,
            store,
            degradation,
        }
    }

    pub async fn attempt_recovery(&self) -> RecoveryReport {
        let mut steps = Vec::new();

        // (a) breaker half-open probe
        let probe_admitted = self.breaker.probe();
        steps.push(RecoveryStep {
            name: "breaker_probe".to_string(),
            attempted: true,
            succeeded: probe_admitted,
            detail: if probe_admitted {
                "breaker admits calls".to_string()
            } else {
                "breaker still backing off".to_string()
            },
        });

        // (b) storage health check
        let storage_ok = self
            .store
            .query(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .await
            .is_ok();
        steps.push(RecoveryStep {
            name: "storage_health".to_string(),
            attempted: true,
            succeeded: storage_ok,
            detail: if storage_ok {
                "database reachable".to_string()
            } else {
                "database check failed".to_string()
            },
        });

        // (c) promote one level on any component success; recovery never
        // downgrades
        let any_success = steps.iter().any(|s| s.succeeded);
        let level_after = if any_success && self.degradation.current() != DegradationLevel::Full {
            let level = self.degradation.recover_one_step();
            steps.push(RecoveryStep {
                name: "level_promotion".to_string(),
                attempted: true,
                succeeded: true,
                detail: format!("capability level now {}", level.name()),
            });
            level
        } else {
            self.degradation.current()
        };

        if any_success {
            info!(level = level_after.name(), "coordinated recovery made progress");
        }

        RecoveryReport {
            steps,
            level_after: level_after.name().to_string(),
            any_success,
        }
    }
}
