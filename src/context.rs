//! Process-wide wiring.
//!
//! Components are built bottom-up (normalizer, store, cache, scenarios,
//! breaker, degradation, validator, registry) and torn down top-down.
//! There are no globals; handlers receive the context explicitly.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::cache::{BidirectionalCache, SqliteStore};
use crate::config::MemoryConfig;
use crate::error::{BoundaryError, MemoryError, Result};
use crate::normalizer::SmartNormalizer;
use crate::protocol::{ProtocolValidator, ToolContext};
use crate::resilience::{CircuitBreaker, DegradationManager, RecoveryCoordinator, RecoveryReport};
use crate::scenario::ScenarioStore;
use crate::telemetry::{ComponentHealth, HealthReport};
use crate::tools::ToolRegistry;

/// Everything a handler needs, created once at startup.
pub struct SystemContext {
    /// Unique id for this process's session, attached to log output
    pub session_id: Uuid,
    pub config: MemoryConfig,
    pub normalizer: Arc<SmartNormalizer>,
    pub store: Arc<SqliteStore>,
    pub cache: Arc<BidirectionalCache>,
    pub scenarios: Arc<ScenarioStore>,
    pub breaker: Arc<CircuitBreaker>,
    pub degradation: Arc<DegradationManager>,
    pub validator: Arc<ProtocolValidator>,
    pub registry: Arc<ToolRegistry>,
}

impl SystemContext {
    /// Build the full system against the configured database file. An
    /// unwritable database is fatal and surfaces here.
    pub async fn initialize(config: MemoryConfig) -> Result<Arc<Self>> {
        let store = Arc::new(SqliteStore::open(&config.database_path())?);
        Self::assemble(config, store).await
    }

    /// In-memory variant for tests and the benchmark harness.
    pub async fn initialize_in_memory(config: MemoryConfig) -> Result<Arc<Self>> {
        let store = Arc::new(SqliteStore::open_in_memory()?);
        Self::assemble(config, store).await
    }

    async fn assemble(config: MemoryConfig, store: Arc<SqliteStore>) -> Result<Arc<Self>> {
        let migration = store.migrate_legacy().await?;
        if migration.legacy_table_found {
            info!(
                selectors = migration.selectors_migrated,
                snapshots = migration.snapshots_migrated,
                "legacy cache table migrated"
            );
        }

        let normalizer = Arc::new(SmartNormalizer::new());
        let cache = Arc::new(BidirectionalCache::new(
            store.clone(),
            normalizer.clone(),
            config.cache.clone(),
        ));
        let scenarios = Arc::new(ScenarioStore::new(
            store.clone(),
            normalizer.clone(),
            cache.clone(),
        ));
        let breaker = Arc::new(CircuitBreaker::with_state_file(
            config.breaker.clone(),
            Some(config.breaker_state_path()),
        ));
        let degradation = Arc::new(DegradationManager::new());
        let validator = Arc::new(ProtocolValidator::new(config.validator.clone()));
        let registry = Arc::new(ToolRegistry::new(degradation.clone()));

        cache.start_cleanup();
        registry.load_staged().await;

        let session_id = Uuid::new_v4();
        info!(%session_id, "selector memory initialized");

        Ok(Arc::new(Self {
            session_id,
            config,
            normalizer,
            store,
            cache,
            scenarios,
            breaker,
            degradation,
            validator,
            registry,
        }))
    }

    /// The guarded execution path: circuit breaker, then the
    /// degradation-aware gate, then protocol validation around the actual
    /// operation. The breaker sits outermost so an open circuit rejects
    /// immediately, before any gating or validation work runs. The error
    /// payload returned here is the wire-visible shape.
    pub async fn execute_tool<T, F, Fut>(
        &self,
        tool_name: &str,
        params: Value,
        operation: F,
    ) -> std::result::Result<T, BoundaryError>
    where
        F: FnOnce(ToolContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // the breaker's state feeds the degradation level on the next
        // health-check pass; rejections here stay circuit-shaped
        self.breaker
            .execute(tool_name, || async {
                let level = self.degradation.current();
                if !level.permits(tool_name) {
                    return Err(MemoryError::Validation {
                        message: format!(
                            "tool {} is unavailable at {}; workarounds: {}",
                            tool_name,
                            level.name(),
                            level.workarounds().join("; ")
                        ),
                    });
                }

                let definition = self.registry.get(tool_name).await.ok_or_else(|| {
                    MemoryError::Validation {
                        message: format!("unknown tool: {}", tool_name),
                    }
                })?;

                let context = self.validator.validate(
                    tool_name,
                    &definition.schema,
                    params,
                    None,
                    None,
                )?;

                operation(context).await
            })
            .await
            .map_err(|err| {
                BoundaryError::from_error(&err, Some(self.degradation.current().name().to_string()))
            })
    }

    /// One health-check pass: storage reachability feeds the degradation
    /// evaluation alongside the breaker state.
    pub async fn run_health_check(&self) -> HealthReport {
        let storage_ok = self
            .store
            .query(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .await
            .is_ok();
        self.degradation.evaluate(self.breaker.state(), storage_ok);
        self.health_report(storage_ok).await
    }

    async fn health_report(&self, storage_ok: bool) -> HealthReport {
        let cache_stats = self.cache.stats().await.ok();
        let cache_detail = cache_stats
            .as_ref()
            .map(|s| {
                format!(
                    "{} selectors, {} mappings, hit rate {:.2}",
                    s.selector_records,
                    s.input_mappings,
                    s.counters.hit_rate()
                )
            })
            .unwrap_or_else(|| "stats unavailable".to_string());

        let validator_metrics = self.validator.metrics();
        let validator_score = if validator_metrics.total_messages == 0 {
            1.0
        } else {
            validator_metrics.valid_messages as f64 / validator_metrics.total_messages as f64
        };

        HealthReport::aggregate(vec![
            ComponentHealth::new(
                "storage",
                if storage_ok { 1.0 } else { 0.0 },
                if storage_ok { "reachable" } else { "unreachable" },
            ),
            ComponentHealth::new("cache", if cache_stats.is_some() { 1.0 } else { 0.3 }, cache_detail),
            ComponentHealth::new(
                "circuit_breaker",
                self.breaker.health_score(),
                format!("state {}", self.breaker.state()),
            ),
            ComponentHealth::new(
                "degradation",
                self.degradation.health_score(),
                self.degradation.current().name(),
            ),
            ComponentHealth::new(
                "validator",
                validator_score,
                format!(
                    "{}/{} valid",
                    validator_metrics.valid_messages, validator_metrics.total_messages
                ),
            ),
        ])
    }

    pub fn recovery_coordinator(&self) -> RecoveryCoordinator {
        RecoveryCoordinator::new(
            self.breaker.clone(),
            self.store.clone(),
            self.degradation.clone(),
        )
    }

    pub async fn attempt_recovery(&self) -> RecoveryReport {
        self.recovery_coordinator().attempt_recovery().await
    }

    /// Tear down top-down. The cache stops its cleanup task; everything
    /// else is dropped with the context.
    pub async fn shutdown(&self) {
        self.cache.close().await;
        info!("selector memory shut down");
    }
}
