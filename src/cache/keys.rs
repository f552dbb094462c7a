//! Enhanced cache keys: portable identifiers for scenarios and snapshots
//! that survive environment moves (localhost, staging, prod) and volatile
//! URL tokens.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::dom::signature::truncated_sha256;
use crate::dom::DomSignature;
use crate::normalizer::normalize_intent;
use crate::normalizer::similarity::OperationType;
use crate::scenario::Step;

lazy_static! {
    static ref NUMERIC_SEGMENT: Regex = Regex::new(r"^\d+$").unwrap();
    static ref UUID_SEGMENT: Regex = Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$"
    )
    .unwrap();
    static ref HEX_SEGMENT: Regex = Regex::new(r"^[0-9a-fA-F]{8,}$").unwrap();
    static ref ULID_SEGMENT: Regex = Regex::new(r"^[0-9A-HJKMNP-TV-Z]{26}$").unwrap();
}

/// Maximum literal path-segment length before it is treated as a token.
const MAX_SEGMENT_LEN: usize = 24;

/// Collapse a concrete URL into a portability-friendly glob.
///
/// Local hosts become `*`; multi-label hosts keep their last two labels
/// behind a `*.` prefix. Numeric, UUID/hex/ULID-shaped, and very long path
/// segments become `*`. Query string and fragment are dropped.
pub fn extract_url_pattern(raw: &str) -> String {
    let Ok(parsed) = Url::parse(raw) else {
        return raw.split(['?', '#']).next().unwrap_or(raw).to_string();
    };

    let host_pattern = match parsed.host_str() {
        Some(host) if host == "localhost" || host == "127.0.0.1" => "*".to_string(),
        Some(host) => {
            let labels: Vec<&str> = host.split('.').collect();
            if labels.len() >= 2 {
                format!("*.{}", labels[labels.len() - 2..].join("."))
            } else {
                host.to_string()
            }
        }
        None => "*".to_string(),
    };

    let mut segments: Vec<String> = Vec::new();
    if let Some(path_segments) = parsed.path_segments() {
        for segment in path_segments.filter(|s| !s.is_empty()) {
            if NUMERIC_SEGMENT.is_match(segment)
                || UUID_SEGMENT.is_match(segment)
                || HEX_SEGMENT.is_match(segment)
                || ULID_SEGMENT.is_match(segment)
                || segment.len() >= MAX_SEGMENT_LEN
            {
                segments.push("*".to_string());
            } else {
                segments.push(segment.to_string());
            }
        }
    }

    if segments.is_empty() {
        host_pattern
    } else {
        format!("{}/{}", host_pattern, segments.join("/"))
    }
}

/// Selector families for the steps-structure hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorFamily {
    Url,
    Input,
    Button,
    Link,
    Form,
    Text,
    Attr,
    Other,
}

impl SelectorFamily {
    /// Classify a selector string with a fixed table. Navigation targets
    /// classify as `Url` regardless of shape.
    pub fn classify(selector: &str) -> Self {
        let s = selector.trim().to_lowercase();
        if s.is_empty() {
            return SelectorFamily::Other;
        }
        if s.starts_with("http://") || s.starts_with("https://") || s.contains("://") {
            SelectorFamily::Url
        } else if s.contains(":has-text(") || s.contains("text=") || s.contains(":text(") {
            SelectorFamily::Text
        } else if s.contains("input") || s.contains("textarea") || s.contains("[type=") {
            SelectorFamily::Input
        } else if s.contains("button") || s.contains("[role=button]") || s.contains("submit") {
            SelectorFamily::Button
        } else if s.starts_with("a[") || s.starts_with("a.") || s.starts_with("a#")
            || s == "a" || s.contains("href") || s.contains("link")
        {
            SelectorFamily::Link
        } else if s.contains("form") {
            SelectorFamily::Form
        } else if s.starts_with('[') || s.contains("[data-") || s.contains("[aria-") {
            SelectorFamily::Attr
        } else {
            SelectorFamily::Other
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            SelectorFamily::Url => "url",
            SelectorFamily::Input => "input",
            SelectorFamily::Button => "button",
            SelectorFamily::Link => "link",
            SelectorFamily::Form => "form",
            SelectorFamily::Text => "text",
            SelectorFamily::Attr => "attr",
            SelectorFamily::Other => "other",
        }
    }
}

/// Hash of the ordered (action, selector-family) shape of a scenario,
/// independent of concrete values.
pub fn steps_structure_hash(steps: &[Step]) -> String {
    let shape: Vec<String> = steps
        .iter()
        .map(|step| {
            let family = if step.action.is_navigation() {
                SelectorFamily::Url
            } else {
                SelectorFamily::classify(
                    step.selector
                        .as_deref()
                        .or(step.target.as_deref())
                        .unwrap_or(""),
                )
            };
            format!("{}:{}", step.action.as_str(), family.as_str())
        })
        .collect();
    truncated_sha256(&shape.join("|"), 16)
}

/// Versioned, environment-portable cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedCacheKey {
    pub test_name_normalized: String,
    pub url_pattern: String,
    pub dom_signature: String,
    pub steps_structure_hash: String,
    pub profile: Option<String>,
    pub version: u32,
}

impl EnhancedCacheKey {
    pub fn build(
        test_name: &str,
        url: &str,
        dom_signature: Option<&DomSignature>,
        steps: &[Step],
        profile: Option<&str>,
    ) -> Self {
        Self {
            test_name_normalized: normalize_intent(test_name).normalized,
            url_pattern: extract_url_pattern(url),
            dom_signature: dom_signature.map(|s| s.to_string()).unwrap_or_default(),
            steps_structure_hash: steps_structure_hash(steps),
            profile: profile.map(str::to_string),
            version: 1,
        }
    }

    /// Weighted similarity: name 0.35, url pattern 0.20, dom signature
    /// 0.25, steps structure 0.15, profile 0.05.
    pub fn similarity(&self, other: &EnhancedCacheKey) -> f64 {
        let name = name_similarity(&self.test_name_normalized, &other.test_name_normalized);
        let url = url_pattern_similarity(&self.url_pattern, &other.url_pattern);
        let dom = dom_similarity(&self.dom_signature, &other.dom_signature);
        let steps = if self.steps_structure_hash == other.steps_structure_hash {
            1.0
        } else {
            0.0
        };
        let profile = if self.profile == other.profile { 1.0 } else { 0.0 };

        name * 0.35 + url * 0.20 + dom * 0.25 + steps * 0.15 + profile * 0.05
    }

    /// Whether two keys describe the same scenario in different
    /// environments (same name/shape, different domain).
    pub fn is_cross_env(&self, other: &EnhancedCacheKey) -> bool {
        domain_of(&self.url_pattern) != domain_of(&other.url_pattern)
    }

    /// Admission check under the per-operation threshold table.
    pub fn admits(&self, other: &EnhancedCacheKey, operation: OperationType) -> bool {
        let operation = if self.is_cross_env(other) {
            OperationType::CrossEnv
        } else {
            operation
        };
        self.similarity(other) >= operation.threshold()
    }
}

fn name_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let sa: std::collections::HashSet<&str> = a.split_whitespace().collect();
    let sb: std::collections::HashSet<&str> = b.split_whitespace().collect();
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    let intersection = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    intersection / union
}

/// Host and path halves each contribute half of the URL similarity.
fn url_pattern_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let (host_a, path_a) = split_pattern(a);
    let (host_b, path_b) = split_pattern(b);
    let mut score = 0.0;
    if host_a == host_b {
        score += 0.5;
    }
    if path_a == path_b {
        score += 0.5;
    }
    score
}

/// Missing signatures on both sides compare equal; a one-sided signature
/// is indeterminate and scores half.
fn dom_similarity(a: &str, b: &str) -> f64 {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.5,
        (false, false) => match (DomSignature::parse(a), DomSignature::parse(b)) {
            (Some(sa), Some(sb)) => sa.similarity(&sb),
            _ => {
                if a == b {
                    1.0
                } else {
                    0.0
                }
            }
        },
    }
}

fn split_pattern(pattern: &str) -> (&str, &str) {
    match pattern.split_once('/') {
        Some((host, path)) => (host, path),
        None => (pattern, ""),
    }
}

fn domain_of(pattern: &str) -> &str {
    split_pattern(pattern).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{Step, StepAction};

    fn nav(target: &str) -> Step {
        Step {
            action: StepAction::Navigate,
            target: Some(target.to_string()),
            value: None,
            selector: None,
            timeout: None,
            description: "navigate".to_string(),
        }
    }

    fn click(selector: &str) -> Step {
        Step {
            action: StepAction::Click,
            target: None,
            value: None,
            selector: Some(selector.to_string()),
            timeout: None,
            description: "click".to_string(),
        }
    }

    #[test]
    fn test_url_pattern_collapses_volatile_tokens() {
        assert_eq!(
            extract_url_pattern(
                "https://app.example.com/todos/8f1e2a3b-1c2d-4e5f-8a9b-0c1d2e3f4a5b/edit"
            ),
            "*.example.com/todos/*/edit"
        );
        assert_eq!(extract_url_pattern("http://localhost:3000/"), "*");
        assert_eq!(
            extract_url_pattern("http://localhost:3000/todos/42"),
            "*/todos/*"
        );
        assert_eq!(
            extract_url_pattern("https://staging.example.com/login?next=/home#top"),
            "*.example.com/login"
        );
    }

    #[test]
    fn test_long_and_hex_segments_collapse() {
        assert_eq!(
            extract_url_pattern("https://example.com/session/deadbeefcafe1234"),
            "*.example.com/session/*"
        );
        assert_eq!(
            extract_url_pattern(
                "https://example.com/t/averyveryverylongsegmentvalue123"
            ),
            "*.example.com/t/*"
        );
    }

    #[test]
    fn test_selector_family_table() {
        assert_eq!(SelectorFamily::classify("https://x.com/"), SelectorFamily::Url);
        assert_eq!(
            SelectorFamily::classify("input[name='q']"),
            SelectorFamily::Input
        );
        assert_eq!(
            SelectorFamily::classify("button.primary"),
            SelectorFamily::Button
        );
        assert_eq!(SelectorFamily::classify("a[href='/home']"), SelectorFamily::Link);
        assert_eq!(SelectorFamily::classify("form#signup"), SelectorFamily::Form);
        assert_eq!(
            SelectorFamily::classify("li:has-text(\"Milk\")"),
            SelectorFamily::Text
        );
        assert_eq!(
            SelectorFamily::classify("[data-testid='row']"),
            SelectorFamily::Attr
        );
        assert_eq!(SelectorFamily::classify("div.card"), SelectorFamily::Other);
    }

    #[test]
    fn test_steps_hash_ignores_concrete_values() {
        let a = vec![nav("http://localhost:3000/"), click("button#add")];
        let b = vec![nav("https://staging.example.com/"), click("button.add")];
        assert_eq!(steps_structure_hash(&a), steps_structure_hash(&b));

        let c = vec![nav("http://localhost:3000/"), click("input#add")];
        assert_ne!(steps_structure_hash(&a), steps_structure_hash(&c));
    }

    #[test]
    fn test_cross_env_keys_stay_similar() {
        let steps = vec![nav("http://localhost:3000/"), click("button#add")];
        let local = EnhancedCacheKey::build(
            "todo smoke test",
            "http://localhost:3000/",
            None,
            &steps,
            None,
        );
        let staging_steps = vec![nav("https://staging.example.com/"), click("button#add")];
        let staging = EnhancedCacheKey::build(
            "todo smoke test",
            "https://staging.example.com/",
            None,
            &staging_steps,
            None,
        );

        let similarity = local.similarity(&staging);
        assert!(similarity >= 0.75, "similarity was {similarity}");
        assert!(local.is_cross_env(&staging));
        assert!(local.admits(&staging, OperationType::CacheLookup));
    }

    #[test]
    fn test_identical_keys_are_fully_similar() {
        let steps = vec![nav("https://example.com/"), click("button#add")];
        let key = EnhancedCacheKey::build("smoke", "https://example.com/", None, &steps, None);
        assert!((key.similarity(&key) - 1.0).abs() < f64::EPSILON);
    }
}
