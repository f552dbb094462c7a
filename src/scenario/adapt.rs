//! Cross-environment scenario adaptation.
//!
//! Rewrites navigation targets for a new origin and flags selectors that
//! are unlikely to survive the move.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use super::types::{Step, StepAction};

lazy_static! {
    static ref NTH_CHILD_RE: Regex = Regex::new(r":nth-child\(\d+\)").unwrap();
    static ref NTH_INDEX_RE: Regex = Regex::new(r"nth=-?\d+").unwrap();
    static ref SHORT_ID_RE: Regex = Regex::new(r"#[A-Za-z0-9_]{1,3}([^\w-]|$)").unwrap();
}

/// Severity of an adaptation suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionKind {
    /// Step was rewritten for the new environment
    Rewritten,
    /// Selector likely breaks across environments
    Brittle,
    /// A cached selector exists for this step on the target URL
    CachedAlternative,
}

/// One per-step adaptation note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationSuggestion {
    pub step_index: usize,
    pub kind: SuggestionKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
}

/// Substitute the origin of every navigation target with the new URL's
/// origin. Relative targets pass through untouched.
pub fn rewrite_navigation_targets(steps: &mut [Step], new_url: &str) -> Vec<AdaptationSuggestion> {
    let Ok(new_origin) = Url::parse(new_url) else {
        return Vec::new();
    };
    let mut suggestions = Vec::new();

    for (index, step) in steps.iter_mut().enumerate() {
        if !step.action.is_navigation() {
            continue;
        }
        let Some(target) = step.target.as_ref() else {
            continue;
        };
        if let Ok(old) = Url::parse(target) {
            let mut rewritten = new_origin.clone();
            rewritten.set_path(old.path());
            rewritten.set_query(old.query());
            let rewritten = rewritten.to_string();
            if rewritten != *target {
                suggestions.push(AdaptationSuggestion {
                    step_index: index,
                    kind: SuggestionKind::Rewritten,
                    message: format!("navigation target moved to {}", rewritten),
                    replacement: Some(rewritten.clone()),
                });
                step.target = Some(rewritten);
            }
        }
    }
    suggestions
}

/// Flag selectors that tend to break on DOM mutations or environment
/// moves: positional child indexes, chain indexes, and very short IDs.
pub fn brittle_selector_suggestions(steps: &[Step]) -> Vec<AdaptationSuggestion> {
    let mut suggestions = Vec::new();
    for (index, step) in steps.iter().enumerate() {
        let Some(selector) = step.selector.as_deref() else {
            continue;
        };
        if NTH_CHILD_RE.is_match(selector) {
            suggestions.push(AdaptationSuggestion {
                step_index: index,
                kind: SuggestionKind::Brittle,
                message: format!(
                    "selector '{}' uses :nth-child, which breaks when siblings change",
                    selector
                ),
                replacement: None,
            });
        }
        if NTH_INDEX_RE.is_match(selector) {
            suggestions.push(AdaptationSuggestion {
                step_index: index,
                kind: SuggestionKind::Brittle,
                message: format!(
                    "selector '{}' pins a chain index; prefer a text or attribute anchor",
                    selector
                ),
                replacement: None,
            });
        }
        if SHORT_ID_RE.is_match(selector) {
            suggestions.push(AdaptationSuggestion {
                step_index: index,
                kind: SuggestionKind::Brittle,
                message: format!(
                    "selector '{}' relies on a very short id, often generated",
                    selector
                ),
                replacement: None,
            });
        }
        if matches!(step.action, StepAction::Click | StepAction::Type)
            && step.selector.is_none()
            && step.target.is_none()
        {
            suggestions.push(AdaptationSuggestion {
                step_index: index,
                kind: SuggestionKind::Brittle,
                message: "step has neither selector nor target".to_string(),
                replacement: None,
            });
        }
    }
    suggestions
}
