//! Level-based graceful degradation.
//!
//! Four capability envelopes, from full service down to
//! monitoring-only. Demotion is immediate when the breaker or health
//! checks deteriorate; promotion happens one step at a time and only
//! through coordinated recovery.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use tracing::{info, warn};

use super::circuit_breaker::BreakerState;

/// Capability envelope levels, ordered from full service to monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DegradationLevel {
    Full,
    Simplified,
    ReadOnly,
    Monitoring,
}

impl DegradationLevel {
    pub fn rank(&self) -> u8 {
        match self {
            DegradationLevel::Full => 1,
            DegradationLevel::Simplified => 2,
            DegradationLevel::ReadOnly => 3,
            DegradationLevel::Monitoring => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DegradationLevel::Full => "L1 Full",
            DegradationLevel::Simplified => "L2 Simplified",
            DegradationLevel::ReadOnly => "L3 Read-Only",
            DegradationLevel::Monitoring => "L4 Monitoring",
        }
    }

    fn from_rank(rank: u8) -> Self {
        match rank {
            0 | 1 => DegradationLevel::Full,
            2 => DegradationLevel::Simplified,
            3 => DegradationLevel::ReadOnly,
            _ => DegradationLevel::Monitoring,
        }
    }

    /// Tools withheld at this level. `Full` withholds nothing.
    pub fn blocked_tools(&self) -> &'static [&'static str] {
        match self {
            DegradationLevel::Full => &[],
            // drop the expensive analysis paths first
            DegradationLevel::Simplified => &["mcp_snapshot_diff", "mcp_fuzzy_learning"],
            // additionally everything that writes to the page
            DegradationLevel::ReadOnly => &[
                "mcp_snapshot_diff",
                "mcp_fuzzy_learning",
                "mcp_browser_navigate",
                "mcp_browser_click",
                "mcp_browser_type",
                "mcp_browser_hover",
                "mcp_cache_learn",
                "mcp_scenario_save",
                "mcp_scenario_adapt",
            ],
            DegradationLevel::Monitoring => &[],
        }
    }

    /// Tools that remain available when the level is allow-list based.
    pub fn allowed_tools(&self) -> Option<&'static [&'static str]> {
        match self {
            DegradationLevel::Monitoring => Some(&[
                "mcp_system_status",
                "mcp_system_health",
                "mcp_system_diagnostics",
            ]),
            _ => None,
        }
    }

    pub fn permits(&self, tool_name: &str) -> bool {
        if let Some(allowed) = self.allowed_tools() {
            return allowed.contains(&tool_name);
        }
        !self.blocked_tools().contains(&tool_name)
    }

    /// User-facing capability summary.
    pub fn capabilities(&self) -> Vec<String> {
        let caps: &[&str] = match self {
            DegradationLevel::Full => &[
                "full browser automation",
                "selector cache learning",
                "scenario management",
                "snapshot analysis",
            ],
            DegradationLevel::Simplified => &[
                "browser automation",
                "selector cache lookups and learning",
                "scenario management",
            ],
            DegradationLevel::ReadOnly => &[
                "page observation and assertions",
                "cache lookups",
                "scenario search",
            ],
            DegradationLevel::Monitoring => &["status, health, and diagnostics only"],
        };
        caps.iter().map(|c| c.to_string()).collect()
    }

    /// Suggested workarounds while the level is active.
    pub fn workarounds(&self) -> Vec<String> {
        let items: &[&str] = match self {
            DegradationLevel::Full => &[],
            DegradationLevel::Simplified => &[
                "re-run snapshot comparisons once the system recovers",
                "fuzzy matches resolve against exact tiers only",
            ],
            DegradationLevel::ReadOnly => &[
                "queue page mutations for replay after recovery",
                "use cached selectors instead of re-resolving",
            ],
            DegradationLevel::Monitoring => &[
                "wait for coordinated recovery",
                "inspect diagnostics for the failing component",
            ],
        };
        items.iter().map(|i| i.to_string()).collect()
    }
}

/// Tracks the active degradation level.
pub struct DegradationManager {
    level: RwLock<DegradationLevel>,
    consecutive_health_failures: AtomicU32,
}

impl Default for DegradationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DegradationManager {
    pub fn new() -> Self {
        Self {
            level: RwLock::new(DegradationLevel::Full),
            consecutive_health_failures: AtomicU32::new(0),
        }
    }

    pub fn current(&self) -> DegradationLevel {
        match self.level.read() {
            Ok(level) => *level,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn is_tool_allowed(&self, tool_name: &str) -> bool {
        self.current().permits(tool_name)
    }

    /// Record a health-check outcome and re-evaluate the level together
    /// with the breaker state. Returns the level now in effect.
    pub fn evaluate(&self, breaker_state: BreakerState, health_ok: bool) -> DegradationLevel {
        let health_failures = if health_ok {
            self.consecutive_health_failures.store(0, Ordering::Relaxed);
            0
        } else {
            self.consecutive_health_failures
                .fetch_add(1, Ordering::Relaxed)
                + 1
        };

        let breaker_rank = match breaker_state {
            BreakerState::Closed => 1,
            BreakerState::HalfOpen => 2,
            BreakerState::Open => 3,
        };
        let health_rank = match health_failures {
            0 => 1,
            1 => 2,
            2 => 3,
            _ => 4,
        };
        let target = DegradationLevel::from_rank(breaker_rank.max(health_rank));

        let mut level = match self.level.write() {
            Ok(level) => level,
            Err(poisoned) => poisoned.into_inner(),
        };
        // demotion only; promotion goes through recover_one_step
        if target.rank() > level.rank() {
            warn!(from = level.name(), to = target.name(), "degrading capability level");
            *level = target;
        }
        *level
    }

    /// Promote one step toward full service. Never downgrades.
    pub fn recover_one_step(&self) -> DegradationLevel {
        let mut level = match self.level.write() {
            Ok(level) => level,
            Err(poisoned) => poisoned.into_inner(),
        };
        if level.rank() > 1 {
            let promoted = DegradationLevel::from_rank(level.rank() - 1);
            info!(from = level.name(), to = promoted.name(), "recovering capability level");
            *level = promoted;
        }
        self.consecutive_health_failures.store(0, Ordering::Relaxed);
        *level
    }

    pub fn health_score(&self) -> f64 {
        match self.current() {
            DegradationLevel::Full => 1.0,
            DegradationLevel::Simplified => 0.75,
            DegradationLevel::ReadOnly => 0.5,
            DegradationLevel::Monitoring => 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_tool_gating() {
        assert!(DegradationLevel::Full.permits("mcp_snapshot_diff"));
        assert!(!DegradationLevel::Simplified.permits("mcp_snapshot_diff"));
        assert!(DegradationLevel::Simplified.permits("mcp_browser_click"));
        assert!(!DegradationLevel::ReadOnly.permits("mcp_browser_click"));
        assert!(DegradationLevel::ReadOnly.permits("mcp_cache_lookup"));
        assert!(!DegradationLevel::Monitoring.permits("mcp_cache_lookup"));
        assert!(DegradationLevel::Monitoring.permits("mcp_system_health"));
    }

    #[test]
    fn test_breaker_state_drives_demotion() {
        let manager = DegradationManager::new();
        assert_eq!(
            manager.evaluate(BreakerState::Closed, true),
            DegradationLevel::Full
        );
        assert_eq!(
            manager.evaluate(BreakerState::HalfOpen, true),
            DegradationLevel::Simplified
        );
        assert_eq!(
            manager.evaluate(BreakerState::Open, true),
            DegradationLevel::ReadOnly
        );
        // evaluate never promotes on its own
        assert_eq!(
            manager.evaluate(BreakerState::Closed, true),
            DegradationLevel::ReadOnly
        );
    }

    #[test]
    fn test_health_failures_accumulate() {
        let manager = DegradationManager::new();
        assert_eq!(
            manager.evaluate(BreakerState::Closed, false),
            DegradationLevel::Simplified
        );
        assert_eq!(
            manager.evaluate(BreakerState::Closed, false),
            DegradationLevel::ReadOnly
        );
        assert_eq!(
            manager.evaluate(BreakerState::Closed, false),
            DegradationLevel::Monitoring
        );
    }

    #[test]
    fn test_recovery_promotes_one_step_at_a_time() {
        let manager = DegradationManager::new();
        manager.evaluate(BreakerState::Closed, false);
        manager.evaluate(BreakerState::Closed, false);
        manager.evaluate(BreakerState::Closed, false);
        assert_eq!(manager.current(), DegradationLevel::Monitoring);

        assert_eq!(manager.recover_one_step(), DegradationLevel::ReadOnly);
        assert_eq!(manager.recover_one_step(), DegradationLevel::Simplified);
        assert_eq!(manager.recover_one_step(), DegradationLevel::Full);
        // already at full service; recovery never downgrades
        assert_eq!(manager.recover_one_step(), DegradationLevel::Full);
    }
}
