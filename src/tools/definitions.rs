//! Tool catalog exposed at the executor boundary.
//!
//! Names carry the `mcp_` prefix so a dispatcher can prefer these tools
//! over ambient alternatives. Execution lives with the external executor;
//! this crate owns the definitions, schemas, and gating.

use serde::Serialize;
use serde_json::Value;

use crate::protocol::{ParamKind, ParamSchema, ParamSpec};

/// Tool categories for organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Navigation,
    Interaction,
    Cache,
    Scenario,
    Diagnostics,
}

/// Load stages keep eager tool enumeration cheap for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStage {
    /// Core tools, available immediately
    Immediate,
    /// Extended tools, registered after 100ms
    Extended,
    /// Diagnostics and expensive analysis, registered after 200ms
    Deferred,
}

impl LoadStage {
    pub fn delay_ms(&self) -> u64 {
        match self {
            LoadStage::Immediate => 0,
            LoadStage::Extended => 100,
            LoadStage::Deferred => 200,
        }
    }
}

/// One boundary tool: stable name, schema, description.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub category: ToolCategory,
    pub stage: LoadStage,
    pub schema: ParamSchema,
}

/// Serializable metadata for tool enumeration responses.
#[derive(Debug, Clone, Serialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: self.name.to_string(),
            description: self.description.to_string(),
            category: self.category,
            input_schema: self.schema.to_json(),
        }
    }
}

/// The full default catalog.
pub fn default_tools() -> Vec<ToolDefinition> {
    vec![
        // stage 0: the core loop
        ToolDefinition {
            name: "mcp_browser_navigate",
            description: "Navigate the browser to a URL",
            category: ToolCategory::Navigation,
            stage: LoadStage::Immediate,
            schema: ParamSchema::new(vec![
                ParamSpec::required("url", ParamKind::String),
                ParamSpec::optional("timeout", ParamKind::Integer),
            ]),
        },
        ToolDefinition {
            name: "mcp_browser_click",
            description: "Click the element matching an intent or selector",
            category: ToolCategory::Interaction,
            stage: LoadStage::Immediate,
            schema: ParamSchema::new(vec![
                ParamSpec::required("selector", ParamKind::String),
                ParamSpec::optional("timeout", ParamKind::Integer),
            ]),
        },
        ToolDefinition {
            name: "mcp_browser_type",
            description: "Type text into the element matching an intent or selector",
            category: ToolCategory::Interaction,
            stage: LoadStage::Immediate,
            schema: ParamSchema::new(vec![
                ParamSpec::required("selector", ParamKind::String),
                ParamSpec::required("text", ParamKind::String),
                ParamSpec::optional("timeout", ParamKind::Integer),
            ]),
        },
        ToolDefinition {
            name: "mcp_cache_lookup",
            description: "Resolve an intent to a cached selector for a URL",
            category: ToolCategory::Cache,
            stage: LoadStage::Immediate,
            schema: ParamSchema::new(vec![
                ParamSpec::required("input", ParamKind::String),
                ParamSpec::required("url", ParamKind::String),
            ]),
        },
        ToolDefinition {
            name: "mcp_system_status",
            description: "Current breaker state, degradation level, and counters",
            category: ToolCategory::Diagnostics,
            stage: LoadStage::Immediate,
            schema: ParamSchema::default(),
        },
        // stage 1: extended interaction and learning
        ToolDefinition {
            name: "mcp_browser_hover",
            description: "Hover over the element matching an intent or selector",
            category: ToolCategory::Interaction,
            stage: LoadStage::Extended,
            schema: ParamSchema::new(vec![ParamSpec::required("selector", ParamKind::String)]),
        },
        ToolDefinition {
            name: "mcp_browser_wait",
            description: "Wait for an element or condition",
            category: ToolCategory::Interaction,
            stage: LoadStage::Extended,
            schema: ParamSchema::new(vec![
                ParamSpec::optional("selector", ParamKind::String),
                ParamSpec::optional("timeout", ParamKind::Integer),
            ]),
        },
        ToolDefinition {
            name: "mcp_browser_assert",
            description: "Assert on page content without mutating it",
            category: ToolCategory::Interaction,
            stage: LoadStage::Extended,
            schema: ParamSchema::new(vec![
                ParamSpec::required("selector", ParamKind::String),
                ParamSpec::optional("expected", ParamKind::String),
            ]),
        },
        ToolDefinition {
            name: "mcp_browser_screenshot",
            description: "Capture a screenshot of the current page",
            category: ToolCategory::Interaction,
            stage: LoadStage::Extended,
            schema: ParamSchema::new(vec![ParamSpec::optional("path", ParamKind::String)]),
        },
        ToolDefinition {
            name: "mcp_cache_learn",
            description: "Store a resolved intent-to-selector association",
            category: ToolCategory::Cache,
            stage: LoadStage::Extended,
            schema: ParamSchema::new(vec![
                ParamSpec::required("input", ParamKind::String),
                ParamSpec::required("url", ParamKind::String),
                ParamSpec::required("selector", ParamKind::String),
            ]),
        },
        ToolDefinition {
            name: "mcp_cache_invalidate",
            description: "Invalidate a selector for a URL after an execution failure",
            category: ToolCategory::Cache,
            stage: LoadStage::Extended,
            schema: ParamSchema::new(vec![
                ParamSpec::required("selector", ParamKind::String),
                ParamSpec::required("url", ParamKind::String),
            ]),
        },
        ToolDefinition {
            name: "mcp_scenario_save",
            description: "Save a multi-step scenario to the library",
            category: ToolCategory::Scenario,
            stage: LoadStage::Extended,
            schema: ParamSchema::new(vec![
                ParamSpec::required("name", ParamKind::String),
                ParamSpec::required("steps", ParamKind::Array),
                ParamSpec::required("url", ParamKind::String),
                ParamSpec::optional("description", ParamKind::String),
                ParamSpec::optional("tags", ParamKind::Array),
                ParamSpec::optional("profile", ParamKind::String),
            ]),
        },
        ToolDefinition {
            name: "mcp_scenario_find",
            description: "Find scenarios similar to a name, URL, and tags",
            category: ToolCategory::Scenario,
            stage: LoadStage::Extended,
            schema: ParamSchema::new(vec![
                ParamSpec::required("name", ParamKind::String),
                ParamSpec::optional("description", ParamKind::String),
                ParamSpec::optional("steps_description", ParamKind::String),
                ParamSpec::optional("tags", ParamKind::Array),
                ParamSpec::optional("url", ParamKind::String),
                ParamSpec::optional("profile", ParamKind::String),
                ParamSpec::optional("limit", ParamKind::Integer),
            ]),
        },
        // stage 2: expensive analysis and diagnostics
        ToolDefinition {
            name: "mcp_snapshot_diff",
            description: "Compare DOM signatures between two snapshots",
            category: ToolCategory::Diagnostics,
            stage: LoadStage::Deferred,
            schema: ParamSchema::new(vec![
                ParamSpec::required("before", ParamKind::String),
                ParamSpec::required("after", ParamKind::String),
            ]),
        },
        ToolDefinition {
            name: "mcp_fuzzy_learning",
            description: "Cross-pollinate related phrasings for a selector",
            category: ToolCategory::Cache,
            stage: LoadStage::Deferred,
            schema: ParamSchema::new(vec![
                ParamSpec::required("selector", ParamKind::String),
                ParamSpec::required("url", ParamKind::String),
            ]),
        },
        ToolDefinition {
            name: "mcp_scenario_adapt",
            description: "Adapt a scenario for a new environment URL",
            category: ToolCategory::Scenario,
            stage: LoadStage::Deferred,
            schema: ParamSchema::new(vec![
                ParamSpec::required("name", ParamKind::String),
                ParamSpec::required("url", ParamKind::String),
                ParamSpec::optional("persist_as", ParamKind::String),
            ]),
        },
        ToolDefinition {
            name: "mcp_system_health",
            description: "Aggregated health report across components",
            category: ToolCategory::Diagnostics,
            stage: LoadStage::Deferred,
            schema: ParamSchema::default(),
        },
        ToolDefinition {
            name: "mcp_system_diagnostics",
            description: "Detailed per-tool statistics and validator metrics",
            category: ToolCategory::Diagnostics,
            stage: LoadStage::Deferred,
            schema: ParamSchema::default(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_prefixed_and_unique() {
        let tools = default_tools();
        let mut names = std::collections::HashSet::new();
        for tool in &tools {
            assert!(tool.name.starts_with("mcp_"), "unprefixed: {}", tool.name);
            assert!(names.insert(tool.name), "duplicate: {}", tool.name);
        }
    }

    #[test]
    fn test_every_stage_is_populated() {
        let tools = default_tools();
        for stage in [LoadStage::Immediate, LoadStage::Extended, LoadStage::Deferred] {
            assert!(tools.iter().any(|t| t.stage == stage));
        }
        assert_eq!(LoadStage::Immediate.delay_ms(), 0);
        assert_eq!(LoadStage::Extended.delay_ms(), 100);
        assert_eq!(LoadStage::Deferred.delay_ms(), 200);
    }

    #[test]
    fn test_metadata_carries_schema() {
        let tools = default_tools();
        let click = tools.iter().find(|t| t.name == "mcp_browser_click").unwrap();
        let metadata = click.metadata();
        assert_eq!(metadata.input_schema["required"][0], "selector");
    }
}
