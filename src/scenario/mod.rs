//! Durable multi-step scenarios with success tracking and
//! cross-environment adaptation.

pub mod adapt;
pub mod store;
pub mod types;

pub use adapt::{AdaptationSuggestion, SuggestionKind};
pub use store::{AdaptedScenario, ScenarioStore, SimilarQuery, SimilarScenario};
pub use types::{
    Execution, ExecutionRecord, ExecutionStatus, InteractionPattern, NewScenario, Scenario, Step,
    StepAction,
};
