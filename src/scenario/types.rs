//! Scenario, step, execution, and interaction-pattern records.

use serde::{Deserialize, Serialize};

/// Actions a scenario step can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Navigate,
    Click,
    Type,
    Wait,
    Assert,
    Screenshot,
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::Navigate => "navigate",
            StepAction::Click => "click",
            StepAction::Type => "type",
            StepAction::Wait => "wait",
            StepAction::Assert => "assert",
            StepAction::Screenshot => "screenshot",
        }
    }

    pub fn is_navigation(&self) -> bool {
        matches!(self, StepAction::Navigate)
    }

    /// Fixed fallback strategies tried when this action's selector breaks.
    pub fn adaptation_rules(&self) -> Vec<String> {
        let rules: &[&str] = match self {
            StepAction::Click => &["text", "aria-label", "role=button"],
            StepAction::Type => &["placeholder", "label", "name", "id", "form-context"],
            StepAction::Navigate => &["relative-url", "base-url-template"],
            StepAction::Wait | StepAction::Assert | StepAction::Screenshot => &[],
        };
        rules.iter().map(|r| r.to_string()).collect()
    }

    /// Signals that confirm the action took effect.
    pub fn success_indicators(&self) -> Vec<String> {
        let indicators: &[&str] = match self {
            StepAction::Click => &["dom-mutation", "navigation", "aria-pressed"],
            StepAction::Type => &["value-set", "input-event"],
            StepAction::Navigate => &["url-changed", "load-event"],
            StepAction::Wait => &["condition-met"],
            StepAction::Assert => &["assertion-passed"],
            StepAction::Screenshot => &["image-captured"],
        };
        indicators.iter().map(|i| i.to_string()).collect()
    }
}

/// One step of a multi-step scenario. Value type, owned by its scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    pub description: String,
}

/// A durable multi-step scenario with success tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<Step>,
    pub pattern_hash: String,
    pub url_pattern: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    pub success_rate: f64,
    pub total_runs: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_adapted: Option<i64>,
    pub created_at: i64,
    pub confidence: f64,
}

/// Input for saving a scenario; derived fields are computed by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewScenario {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    /// Concrete URL the scenario was recorded against
    pub url: String,
}

/// Execution outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Partial,
    Adapted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failure => "failure",
            ExecutionStatus::Partial => "partial",
            ExecutionStatus::Adapted => "adapted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(ExecutionStatus::Success),
            "failure" => Some(ExecutionStatus::Failure),
            "partial" => Some(ExecutionStatus::Partial),
            "adapted" => Some(ExecutionStatus::Adapted),
            _ => None,
        }
    }
}

/// Bookkeeping payload for one scenario run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_time_ms: u64,
    #[serde(default)]
    pub selector_adaptations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

/// A stored execution row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub scenario_id: i64,
    pub status: ExecutionStatus,
    pub execution_time_ms: u64,
    pub selector_adaptations: Option<String>,
    pub error_details: Option<String>,
    pub snapshot_id: Option<String>,
    pub confidence_score: Option<f64>,
    pub profile: Option<String>,
    pub url: String,
    pub timestamp: i64,
}

/// A learned per-action interaction pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionPattern {
    pub pattern_hash: String,
    pub interaction_type: String,
    pub element_patterns: Vec<String>,
    pub success_indicators: Vec<String>,
    pub adaptation_rules: Vec<String>,
    pub confidence: f64,
    pub success_count: i64,
    pub total_count: i64,
    pub learned_from: Option<String>,
    pub created_at: i64,
    pub last_used: i64,
}
