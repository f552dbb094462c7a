//! Tool registry with staged loading and degradation gating.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::definitions::{default_tools, LoadStage, ToolDefinition, ToolMetadata};
use crate::resilience::DegradationManager;

/// Registry of boundary tools. Enumeration respects the active
/// degradation level; registration happens in three priority stages so an
/// eager caller sees the core tools first.
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<ToolDefinition>>>>,
    degradation: Arc<DegradationManager>,
}

impl ToolRegistry {
    pub fn new(degradation: Arc<DegradationManager>) -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
            degradation,
        }
    }

    pub async fn register(&self, tool: ToolDefinition) {
        let mut tools = self.tools.write().await;
        if tools.contains_key(tool.name) {
            warn!(tool = tool.name, "tool already registered, replacing");
        }
        debug!(tool = tool.name, "registering tool");
        tools.insert(tool.name.to_string(), Arc::new(tool));
    }

    /// Register the default catalog in its three priority stages
    /// (0ms, 100ms, 200ms). Returns once the immediate stage is in place;
    /// the later stages land in the background.
    pub async fn load_staged(self: &Arc<Self>) {
        let mut by_stage: HashMap<LoadStage, Vec<ToolDefinition>> = HashMap::new();
        for tool in default_tools() {
            by_stage.entry(tool.stage).or_default().push(tool);
        }

        for tool in by_stage.remove(&LoadStage::Immediate).unwrap_or_default() {
            self.register(tool).await;
        }
        info!("core tools registered");

        for stage in [LoadStage::Extended, LoadStage::Deferred] {
            let Some(tools) = by_stage.remove(&stage) else {
                continue;
            };
            let registry = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(stage.delay_ms())).await;
                for tool in tools {
                    registry.register(tool).await;
                }
                debug!(?stage, "staged tools registered");
            });
        }
    }

    /// Register the whole catalog synchronously. Used by the CLI and by
    /// tests that need a complete registry without timing.
    pub async fn load_all(&self) {
        for tool in default_tools() {
            self.register(tool).await;
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        let tools = self.tools.read().await;
        tools.get(name).cloned()
    }

    /// Tools visible under the current degradation level.
    pub async fn list_tools(&self) -> Vec<ToolMetadata> {
        let level = self.degradation.current();
        let tools = self.tools.read().await;
        let mut listed: Vec<ToolMetadata> = tools
            .values()
            .filter(|tool| level.permits(tool.name))
            .map(|tool| tool.metadata())
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        listed
    }

    /// Whether a tool exists and is currently permitted.
    pub async fn is_available(&self, name: &str) -> bool {
        if !self.degradation.is_tool_allowed(name) {
            return false;
        }
        self.tools.read().await.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::BreakerState;

    fn registry() -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry::new(Arc::new(DegradationManager::new())))
    }

    #[tokio::test]
    async fn test_load_all_registers_catalog() {
        let registry = registry();
        registry.load_all().await;
        assert!(registry.get("mcp_browser_click").await.is_some());
        assert!(registry.get("mcp_system_health").await.is_some());
        assert!(registry.is_available("mcp_browser_click").await);
    }

    #[tokio::test]
    async fn test_staged_loading_order() {
        let registry = registry();
        registry.load_staged().await;

        // immediate stage is visible right away
        assert!(registry.get("mcp_browser_navigate").await.is_some());
        // deferred stage is not yet
        assert!(registry.get("mcp_system_diagnostics").await.is_none());

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(registry.get("mcp_system_diagnostics").await.is_some());
    }

    #[tokio::test]
    async fn test_degradation_hides_tools() {
        let degradation = Arc::new(DegradationManager::new());
        let registry = Arc::new(ToolRegistry::new(degradation.clone()));
        registry.load_all().await;

        let full_count = registry.list_tools().await.len();

        degradation.evaluate(BreakerState::Open, true); // read-only
        let reduced = registry.list_tools().await;
        assert!(reduced.len() < full_count);
        assert!(!registry.is_available("mcp_browser_click").await);
        assert!(registry.is_available("mcp_cache_lookup").await);

        degradation.evaluate(BreakerState::Open, false);
        degradation.evaluate(BreakerState::Open, false);
        degradation.evaluate(BreakerState::Open, false); // monitoring
        let monitoring = registry.list_tools().await;
        assert_eq!(monitoring.len(), 3);
    }
}
