//! Telemetry: lookup counters, health reports, and a small in-process
//! benchmark harness.
//!
//! Counters are plain atomics updated on the hot path and never persisted.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Hit/miss/learning counters for the bidirectional cache.
#[derive(Debug, Default)]
pub struct CacheTelemetry {
    pub exact_hits: AtomicU64,
    pub normalized_hits: AtomicU64,
    pub reverse_hits: AtomicU64,
    pub fuzzy_hits: AtomicU64,
    pub misses: AtomicU64,
    pub learned_mappings: AtomicU64,
    pub invalidations: AtomicU64,
    pub snapshot_hits: AtomicU64,
    pub snapshot_misses: AtomicU64,
}

impl CacheTelemetry {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            exact_hits: self.exact_hits.load(Ordering::Relaxed),
            normalized_hits: self.normalized_hits.load(Ordering::Relaxed),
            reverse_hits: self.reverse_hits.load(Ordering::Relaxed),
            fuzzy_hits: self.fuzzy_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            learned_mappings: self.learned_mappings.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            snapshot_hits: self.snapshot_hits.load(Ordering::Relaxed),
            snapshot_misses: self.snapshot_misses.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub exact_hits: u64,
    pub normalized_hits: u64,
    pub reverse_hits: u64,
    pub fuzzy_hits: u64,
    pub misses: u64,
    pub learned_mappings: u64,
    pub invalidations: u64,
    pub snapshot_hits: u64,
    pub snapshot_misses: u64,
}

impl TelemetrySnapshot {
    pub fn total_hits(&self) -> u64 {
        self.exact_hits + self.normalized_hits + self.reverse_hits + self.fuzzy_hits
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.total_hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            self.total_hits() as f64 / total as f64
        }
    }
}

/// Health classification shared by the report and the degradation logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// One component's contribution to the health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub score: f64,
    pub status: HealthStatus,
    pub detail: String,
}

impl ComponentHealth {
    pub fn new(component: &str, score: f64, detail: impl Into<String>) -> Self {
        let score = score.clamp(0.0, 1.0);
        let status = if score >= 0.9 {
            HealthStatus::Healthy
        } else if score >= 0.6 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        };
        Self {
            component: component.to_string(),
            score,
            status,
            detail: detail.into(),
        }
    }
}

/// Aggregated health across components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_score: f64,
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn aggregate(components: Vec<ComponentHealth>) -> Self {
        let overall_score = if components.is_empty() {
            1.0
        } else {
            components.iter().map(|c| c.score).sum::<f64>() / components.len() as f64
        };
        let status = if overall_score >= 0.9 {
            HealthStatus::Healthy
        } else if overall_score >= 0.6 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        };
        Self {
            overall_score,
            status,
            components,
        }
    }
}

/// Result of one benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub name: String,
    pub iterations: u64,
    pub total_ms: u64,
    pub avg_micros: f64,
}

/// Measure a synchronous operation over `iterations` runs.
pub fn benchmark<F: FnMut()>(name: &str, iterations: u64, mut op: F) -> BenchmarkReport {
    let start = Instant::now();
    for _ in 0..iterations {
        op();
    }
    let elapsed = start.elapsed();
    BenchmarkReport {
        name: name.to_string(),
        iterations,
        total_ms: elapsed.as_millis() as u64,
        avg_micros: if iterations == 0 {
            0.0
        } else {
            elapsed.as_micros() as f64 / iterations as f64
        },
    }
}
