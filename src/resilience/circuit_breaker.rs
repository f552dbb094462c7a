//! Circuit breaker with sliding-window failure tracking, exponential
//! backoff, and durable state.
//!
//! State transitions are synchronous and totally ordered per instance; the
//! state file write happens off the hot path. Only failures whose
//! classification says `should_trip` enter the window and the consecutive
//! counter, so page-state noise (element not found) never opens the
//! circuit.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::error::{ErrorKind, MemoryError, Result};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        };
        write!(f, "{}", name)
    }
}

/// Per-tool call accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolStats {
    pub calls: u64,
    pub successes: u64,
    pub retriable_failures: u64,
    pub non_retriable_failures: u64,
    pub total_duration_ms: u64,
    pub consecutive_failures: u32,
    pub trips: u64,
}

impl ToolStats {
    pub fn failures(&self) -> u64 {
        self.retriable_failures + self.non_retriable_failures
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.calls as f64
        }
    }
}

/// Snapshot of breaker state for telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub backoff_delay_ms: u64,
    pub trip_count: u64,
    pub window_failures: usize,
    pub window_successes: usize,
    pub tools: HashMap<String, ToolStats>,
}

/// The durable subset of breaker state. The sliding window is deliberately
/// not persisted: stale failures must not dominate recovery after restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedState {
    state: BreakerState,
    #[serde(rename = "consecutiveFailures")]
    consecutive_failures: u32,
    #[serde(rename = "lastFailureTime")]
    last_failure_time: Option<i64>,
    #[serde(rename = "lastStateChange")]
    last_state_change: i64,
    #[serde(rename = "backoffDelay")]
    backoff_delay_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct WindowRecord {
    timestamp_ms: i64,
    success: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_time: Option<i64>,
    last_state_change: i64,
    backoff_delay_ms: u64,
    half_open_calls: u32,
    trip_count: u64,
    window: VecDeque<WindowRecord>,
    tools: HashMap<String, ToolStats>,
}

/// Circuit breaker guarding the executor boundary.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    state_path: Option<PathBuf>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_state_file(config, None)
    }

    /// Build a breaker, restoring the durable fields from `state_path` if
    /// it holds a readable snapshot. Corruption falls back to defaults.
    pub fn with_state_file(config: BreakerConfig, state_path: Option<PathBuf>) -> Self {
        let restored = state_path.as_deref().and_then(|path| {
            match std::fs::read_to_string(path) {
                Ok(contents) => match serde_json::from_str::<PersistedState>(&contents) {
                    Ok(state) => Some(state),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e,
                              "breaker state file corrupt, starting from defaults");
                        None
                    }
                },
                Err(_) => None,
            }
        });

        let inner = match restored {
            Some(persisted) => {
                info!(state = %persisted.state, "breaker state restored");
                BreakerInner {
                    state: persisted.state,
                    consecutive_failures: persisted.consecutive_failures,
                    last_failure_time: persisted.last_failure_time,
                    last_state_change: persisted.last_state_change,
                    backoff_delay_ms: persisted.backoff_delay_ms,
                    half_open_calls: 0,
                    trip_count: 0,
                    window: VecDeque::new(),
                    tools: HashMap::new(),
                }
            }
            None => BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_time: None,
                last_state_change: now_ms(),
                backoff_delay_ms: config.initial_backoff_delay.as_millis() as u64,
                half_open_calls: 0,
                trip_count: 0,
                window: VecDeque::new(),
                tools: HashMap::new(),
            },
        };

        Self {
            config,
            inner: Mutex::new(inner),
            state_path,
        }
    }

    /// Run one tool invocation through the breaker. Admission is decided on
    /// a snapshot taken at entry; the operation runs under the configured
    /// timeout and a deadline overrun records as a network-timeout failure.
    pub async fn execute<T, F, Fut>(&self, tool: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit(tool)?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.timeout, operation()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(value)) => {
                self.record_success(tool, duration_ms);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure(tool, err.kind(), duration_ms);
                Err(err)
            }
            Err(_) => {
                let err = MemoryError::Timeout {
                    operation: tool.to_string(),
                    timeout_ms: self.config.timeout.as_millis() as u64,
                };
                self.record_failure(tool, ErrorKind::NetworkTimeout, duration_ms);
                Err(err)
            }
        }
    }

    /// Admission decision, taken on a consistent snapshot of
    /// (state, backoff, half-open budget).
    fn admit(&self, tool: &str) -> Result<()> {
        let mut inner = self.lock();
        let now = now_ms();

        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let next_retry = inner.last_state_change + inner.backoff_delay_ms as i64;
                if now >= next_retry {
                    self.transition(&mut inner, BreakerState::HalfOpen, now);
                    inner.half_open_calls = 1;
                    debug!(tool, "breaker half-open probe admitted");
                    Ok(())
                } else {
                    Err(MemoryError::CircuitOpen {
                        tool: tool.to_string(),
                        next_retry_time: ms_to_datetime(next_retry),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_threshold {
                    inner.half_open_calls += 1;
                    Ok(())
                } else {
                    Err(MemoryError::HalfOpenExhausted {
                        tool: tool.to_string(),
                    })
                }
            }
        }
    }

    fn record_success(&self, tool: &str, duration_ms: u64) {
        let mut inner = self.lock();
        let now = now_ms();

        inner.window.push_back(WindowRecord {
            timestamp_ms: now,
            success: true,
        });
        self.prune_window(&mut inner, now);

        let stats = inner.tools.entry(tool.to_string()).or_default();
        stats.calls += 1;
        stats.successes += 1;
        stats.total_duration_ms += duration_ms;
        stats.consecutive_failures = 0;

        inner.consecutive_failures = 0;

        if inner.state == BreakerState::HalfOpen {
            info!(tool, "half-open probe succeeded, closing breaker");
            inner.backoff_delay_ms = self.config.initial_backoff_delay.as_millis() as u64;
            self.transition(&mut inner, BreakerState::Closed, now);
            self.persist(&inner);
        }
    }

    fn record_failure(&self, tool: &str, kind: ErrorKind, duration_ms: u64) {
        let mut inner = self.lock();
        let now = now_ms();

        let stats = inner.tools.entry(tool.to_string()).or_default();
        stats.calls += 1;
        stats.total_duration_ms += duration_ms;
        if kind.is_retriable() {
            stats.retriable_failures += 1;
        } else {
            stats.non_retriable_failures += 1;
        }
        stats.consecutive_failures += 1;

        if !kind.should_trip() {
            debug!(tool, kind = %kind, "failure recorded, not trip-relevant");
            return;
        }

        inner.window.push_back(WindowRecord {
            timestamp_ms: now,
            success: false,
        });
        self.prune_window(&mut inner, now);
        inner.consecutive_failures += 1;
        inner.last_failure_time = Some(now);

        match inner.state {
            BreakerState::HalfOpen => {
                warn!(tool, "half-open probe failed, reopening breaker");
                self.bump_backoff(&mut inner);
                self.transition(&mut inner, BreakerState::Open, now);
                self.persist(&inner);
            }
            BreakerState::Closed => {
                if self.should_trip(&inner, now) {
                    warn!(
                        tool,
                        consecutive = inner.consecutive_failures,
                        "failure threshold reached, opening breaker"
                    );
                    self.bump_backoff(&mut inner);
                    inner.trip_count += 1;
                    if let Some(tool_stats) = inner.tools.get_mut(tool) {
                        tool_stats.trips += 1;
                    }
                    self.transition(&mut inner, BreakerState::Open, now);
                    self.persist(&inner);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn should_trip(&self, inner: &BreakerInner, now: i64) -> bool {
        if inner.consecutive_failures >= self.config.max_consecutive_failures {
            return true;
        }
        let window_start = now - self.config.monitoring_window.as_millis() as i64;
        let mut failures = 0usize;
        let mut successes = 0usize;
        for record in &inner.window {
            if record.timestamp_ms < window_start {
                continue;
            }
            if record.success {
                successes += 1;
            } else {
                failures += 1;
            }
        }
        let total = failures + successes;
        total >= 1 && failures as f64 / total as f64 >= self.config.failure_threshold
    }

    fn bump_backoff(&self, inner: &mut BreakerInner) {
        let max = self.config.max_backoff_delay.as_millis() as u64;
        let bumped = (inner.backoff_delay_ms as f64 * self.config.backoff_multiplier) as u64;
        inner.backoff_delay_ms = bumped.min(max);
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState, now: i64) {
        if inner.state != to {
            debug!(from = %inner.state, to = %to, "breaker state change");
        }
        inner.state = to;
        inner.last_state_change = now;
        if to != BreakerState::HalfOpen {
            inner.half_open_calls = 0;
        }
    }

    fn prune_window(&self, inner: &mut BreakerInner, now: i64) {
        let cutoff = now - self.config.monitoring_window.as_millis() as i64;
        while inner
            .window
            .front()
            .is_some_and(|r| r.timestamp_ms < cutoff)
        {
            inner.window.pop_front();
        }
    }

    /// Probe an open breaker: transitions to half-open once the backoff
    /// deadline has passed. Returns true when calls may be admitted.
    pub fn probe(&self) -> bool {
        let mut inner = self.lock();
        let now = now_ms();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let next_retry = inner.last_state_change + inner.backoff_delay_ms as i64;
                if now >= next_retry {
                    self.transition(&mut inner, BreakerState::HalfOpen, now);
                    self.persist(&inner);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Manual reset: closed state, empty windows, initial backoff.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let now = now_ms();
        inner.window.clear();
        inner.consecutive_failures = 0;
        inner.half_open_calls = 0;
        inner.backoff_delay_ms = self.config.initial_backoff_delay.as_millis() as u64;
        self.transition(&mut inner, BreakerState::Closed, now);
        self.persist(&inner);
        info!("breaker manually reset");
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Earliest time at which an open breaker admits a probe.
    pub fn next_retry_time(&self) -> Option<DateTime<Utc>> {
        let inner = self.lock();
        match inner.state {
            BreakerState::Open => Some(ms_to_datetime(
                inner.last_state_change + inner.backoff_delay_ms as i64,
            )),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        let now = now_ms();
        self.prune_window(&mut inner, now);
        let window_failures = inner.window.iter().filter(|r| !r.success).count();
        let window_successes = inner.window.len() - window_failures;
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            backoff_delay_ms: inner.backoff_delay_ms,
            trip_count: inner.trip_count,
            window_failures,
            window_successes,
            tools: inner.tools.clone(),
        }
    }

    /// Health contribution used by degradation and reports.
    pub fn health_score(&self) -> f64 {
        match self.state() {
            BreakerState::Closed => 1.0,
            BreakerState::HalfOpen => 0.6,
            BreakerState::Open => 0.2,
        }
    }

    fn persist(&self, inner: &BreakerInner) {
        let Some(path) = self.state_path.clone() else {
            return;
        };
        let snapshot = PersistedState {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_time: inner.last_failure_time,
            last_state_change: inner.last_state_change,
            backoff_delay_ms: inner.backoff_delay_ms,
        };
        // State-file I/O stays off the hot path; a lost write only costs
        // one restart's worth of backoff context.
        tokio::spawn(async move {
            let contents = match serde_json::to_vec_pretty(&snapshot) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "breaker state not serializable");
                    return;
                }
            };
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            if let Err(e) = tokio::fs::write(&path, contents).await {
                warn!(path = %path.display(), error = %e, "breaker state write failed");
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            initial_backoff_delay: Duration::from_millis(50),
            max_backoff_delay: Duration::from_millis(400),
            timeout: Duration::from_millis(2_000),
            ..BreakerConfig::default()
        }
    }

    fn crash() -> MemoryError {
        MemoryError::Execution {
            tool: "browser_click".to_string(),
            message: "browser crash detected".to_string(),
            kind: ErrorKind::BrowserCrash,
        }
    }

    async fn fail_n(breaker: &CircuitBreaker, tool: &str, n: usize) {
        for _ in 0..n {
            let _ = breaker
                .execute::<(), _, _>(tool, || async { Err(crash()) })
                .await;
        }
    }

    async fn succeed_n(breaker: &CircuitBreaker, tool: &str, n: usize) {
        for _ in 0..n {
            breaker.execute(tool, || async { Ok(()) }).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_consecutive_failures_open_the_breaker() {
        let breaker = CircuitBreaker::new(fast_config());
        // prior successes keep the windowed rate below threshold, so only
        // the consecutive-failure condition can trip
        succeed_n(&breaker, "browser_click", 10).await;
        fail_n(&breaker, "browser_click", 4).await;
        assert_eq!(breaker.state(), BreakerState::Closed);

        fail_n(&breaker, "browser_click", 1).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        let rejected: Result<()> = breaker
            .execute("browser_click", || async { Ok(()) })
            .await;
        match rejected {
            Err(MemoryError::CircuitOpen { next_retry_time, .. }) => {
                let min_retry = Utc::now()
                    + chrono::Duration::milliseconds(
                        fast_config().initial_backoff_delay.as_millis() as i64 - 10,
                    );
                assert!(next_retry_time >= min_retry);
            }
            other => panic!("expected CircuitOpen, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_single_failure_in_empty_window_trips_on_rate() {
        // 1 failure / 1 call meets the 0.5 rate with at least one call in
        // the window
        let breaker = CircuitBreaker::new(fast_config());
        fail_n(&breaker, "tool", 1).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_half_open_success_closes_and_resets_backoff() {
        let breaker = CircuitBreaker::new(fast_config());
        fail_n(&breaker, "tool", 5).await;
        assert_eq!(breaker.state(), BreakerState::Open);
        let backoff_when_open = breaker.snapshot().backoff_delay_ms;
        assert!(backoff_when_open >= 100); // bumped at least once

        tokio::time::sleep(Duration::from_millis(backoff_when_open + 20)).await;

        let result = breaker.execute("tool", || async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().backoff_delay_ms, 50);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_and_multiplies_backoff() {
        let breaker = CircuitBreaker::new(fast_config());
        fail_n(&breaker, "tool", 5).await;
        let first_backoff = breaker.snapshot().backoff_delay_ms;

        tokio::time::sleep(Duration::from_millis(first_backoff + 20)).await;
        let _ = breaker
            .execute::<(), _, _>("tool", || async { Err(crash()) })
            .await;

        assert_eq!(breaker.state(), BreakerState::Open);
        let second_backoff = breaker.snapshot().backoff_delay_ms;
        assert_eq!(second_backoff, (first_backoff * 2).min(400));
    }

    #[tokio::test]
    async fn test_element_not_found_never_trips() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..20 {
            let _ = breaker
                .execute::<(), _, _>("tool", || async {
                    Err(MemoryError::Execution {
                        tool: "tool".to_string(),
                        message: "element not found: #x".to_string(),
                        kind: ErrorKind::ElementNotFound,
                    })
                })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.window_failures, 0);
        assert_eq!(snapshot.tools["tool"].retriable_failures, 20);
    }

    #[tokio::test]
    async fn test_windowed_failure_rate_trips() {
        let mut config = fast_config();
        config.max_consecutive_failures = 100; // force the rate condition
        let breaker = CircuitBreaker::new(config);

        breaker.execute("tool", || async { Ok(()) }).await.unwrap();
        fail_n(&breaker, "tool", 2).await;
        // 2 failures / 3 calls >= 0.5
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_half_open_admission_cap() {
        let breaker = std::sync::Arc::new(CircuitBreaker::new(fast_config()));
        fail_n(&breaker, "tool", 5).await;
        let backoff = breaker.snapshot().backoff_delay_ms;
        tokio::time::sleep(Duration::from_millis(backoff + 20)).await;

        // hold slow in-flight probes so admissions accumulate
        let mut handles = Vec::new();
        for _ in 0..5 {
            let b = breaker.clone();
            handles.push(tokio::spawn(async move {
                b.execute("tool", || async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok(())
                })
                .await
            }));
        }
        let mut admitted = 0;
        let mut exhausted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => admitted += 1,
                Err(MemoryError::HalfOpenExhausted { .. }) => exhausted += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(admitted <= 3);
        assert_eq!(admitted + exhausted, 5);
    }

    #[tokio::test]
    async fn test_timeout_records_network_failure() {
        let mut config = fast_config();
        config.timeout = Duration::from_millis(30);
        let breaker = CircuitBreaker::new(config);

        let result = breaker
            .execute::<(), _, _>("slow_tool", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(MemoryError::Timeout { .. })));
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.window_failures, 1);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let breaker = CircuitBreaker::new(fast_config());
        fail_n(&breaker, "tool", 5).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.backoff_delay_ms, 50);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.window_failures, 0);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breaker.json");

        {
            let breaker =
                CircuitBreaker::with_state_file(fast_config(), Some(path.clone()));
            succeed_n(&breaker, "tool", 10).await;
            fail_n(&breaker, "tool", 5).await;
            assert_eq!(breaker.state(), BreakerState::Open);
            // allow the spawned write to land
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let restored = CircuitBreaker::with_state_file(fast_config(), Some(path.clone()));
        assert_eq!(restored.state(), BreakerState::Open);
        let snapshot = restored.snapshot();
        assert_eq!(snapshot.consecutive_failures, 5);
        // the sliding window starts empty after restore
        assert_eq!(snapshot.window_failures, 0);
    }

    #[tokio::test]
    async fn test_corrupt_state_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breaker.json");
        std::fs::write(&path, b"{not json").unwrap();

        let breaker = CircuitBreaker::with_state_file(fast_config(), Some(path));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
