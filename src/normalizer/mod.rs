//! Smart intent normalizer.
//!
//! Transforms arbitrary intent text into a deterministic canonical form that
//! preserves what differentiates distinct user intents (positional keywords,
//! quoted strings) and discards what does not (word order, casing, articles,
//! action synonyms, trailing generic nouns).
//!
//! The pipeline is pure and restartable; normalizing an already-normalized
//! string reproduces it.

pub mod similarity;

use lazy_static::lazy_static;
use lru::LruCache;
use md5::{Digest, Md5};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Words dropped from the token set entirely.
const STOP_WORDS: &[&str] = &["the", "a", "an", "and", "or", "but", "at", "on"];
/// Relational words dropped from the token set.
const RELATIONAL_WORDS: &[&str] = &["in", "of", "from", "to", "with", "by", "for"];
/// Generic nouns that never differentiate intents.
const GENERIC_NOUNS: &[&str] = &["button", "element", "field"];
/// Positional keywords preserved independently of token sorting.
pub const POSITIONAL_KEYWORDS: &[&str] = &[
    "before", "after", "first", "last", "next", "previous", "above", "below", "top", "bottom",
    "left", "right",
];

/// Action synonym groups, applied word-bounded.
const ACTION_GROUPS: &[(&str, &[&str])] = &[
    ("click", &["click", "press", "tap", "hit", "select", "choose"]),
    ("type", &["type", "enter", "input", "fill", "write"]),
    ("navigate", &["go", "navigate", "open", "visit", "load"]),
    ("hover", &["hover", "mouseover", "move"]),
];

lazy_static! {
    static ref QUOTED_RE: Regex = Regex::new(r#""([^"]*)"|'([^']*)'"#).unwrap();
    static ref ID_RE: Regex = Regex::new(r"#[A-Za-z_][\w-]*").unwrap();
    static ref CLASS_RE: Regex = Regex::new(r"\.[A-Za-z_][\w-]*").unwrap();
    static ref NUMBER_RE: Regex = Regex::new(r"\d+").unwrap();
    static ref ATTRIBUTE_RE: Regex = Regex::new(r"\[([A-Za-z][A-Za-z0-9-]*)").unwrap();
    static ref PUNCT_RE: Regex = Regex::new(r"[^\w\s#._-]").unwrap();
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").unwrap();
    static ref LEADING_CLICK_RE: Regex = Regex::new(r"^click\s+(on\s+)?(the\s+)?").unwrap();
    static ref TRAILING_NOUN_RE: Regex = Regex::new(r"\s+(button|element|field)$").unwrap();
    // Locator-syntax repair table, applied once, left-to-right.
    static ref TEXT_PSEUDO_RE: Regex = Regex::new(r":text\(").unwrap();
    static ref BARE_TEXT_RE: Regex = Regex::new(r"(^|[^-:\w])text\(").unwrap();
    static ref FIRST_LAST_RE: Regex = Regex::new(r":(first|last)(-of-type)?").unwrap();
    static ref CHAIN_FIRST_RE: Regex = Regex::new(r">>\s*first\b").unwrap();
    static ref CHAIN_LAST_RE: Regex = Regex::new(r">>\s*last\b").unwrap();
}

/// Case pattern of the raw input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CasePattern {
    Lower,
    Upper,
    Mixed,
    Title,
}

/// Structural features extracted from the repaired input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentFeatures {
    pub has_id: bool,
    pub has_class: bool,
    pub has_quoted: bool,
    pub has_data_test_id: bool,
    pub has_imperative: bool,
    pub is_navigation: bool,
    pub is_form_action: bool,
    pub numbers: Vec<String>,
    pub attributes: Vec<String>,
    pub case_pattern: CasePattern,
}

/// A positional keyword occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRef {
    pub keyword: String,
    pub index: usize,
    pub context: Option<String>,
}

/// Canonical form of an intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedIntent {
    /// Order-invariant canonical string, including `_pos`/`_quoted` suffixes
    pub normalized: String,
    /// Sorted token set
    pub tokens: Vec<String>,
    /// Positional keywords in order of appearance
    pub positions: Vec<PositionRef>,
    /// Quoted substrings in order of appearance
    pub quoted: Vec<String>,
    pub features: IntentFeatures,
    /// MD5 of the normalized string
    pub hash: String,
}

/// Deterministic intent canonicalizer with a small memo cache.
pub struct SmartNormalizer {
    memo: Mutex<LruCache<String, NormalizedIntent>>,
}

impl Default for SmartNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SmartNormalizer {
    pub fn new() -> Self {
        Self {
            memo: Mutex::new(LruCache::new(NonZeroUsize::new(512).unwrap())),
        }
    }

    /// Normalize an intent. Results are memoized; the pipeline itself is
    /// pure.
    pub fn normalize(&self, input: &str) -> NormalizedIntent {
        if let Ok(mut memo) = self.memo.lock() {
            if let Some(hit) = memo.get(input) {
                return hit.clone();
            }
        }
        let result = normalize_intent(input);
        if let Ok(mut memo) = self.memo.lock() {
            memo.put(input.to_string(), result.clone());
        }
        result
    }
}

/// Run the full normalization pipeline on one input.
pub fn normalize_intent(input: &str) -> NormalizedIntent {
    // Peel canonical suffixes first so normalize(normalize(x)) == normalize(x).
    let (body, suffix_positions, suffix_quoted) = peel_suffixes(input);

    let repaired = repair_locator_syntax(&body);
    let features = extract_features(&repaired);

    let (placeheld, mut quoted) = extract_quoted(&repaired);
    for q in suffix_quoted {
        if !quoted.contains(&q) {
            quoted.push(q);
        }
    }

    let lowered = placeheld.to_lowercase();
    let words: Vec<String> = lowered.split_whitespace().map(str::to_string).collect();

    let mut positions = extract_positions(&words);
    for p in suffix_positions {
        if !positions.iter().any(|e| e.keyword == p.keyword && e.context == p.context) {
            positions.push(p);
        }
    }

    let canonical_words: Vec<String> = words.iter().map(|w| canonicalize_action(w)).collect();
    let rejoined = canonical_words.join(" ");

    let stripped = strip_noise(&rejoined);

    let mut tokens: Vec<String> = stripped
        .split_whitespace()
        .filter(|w| !w.is_empty())
        .filter(|w| !STOP_WORDS.contains(w))
        .filter(|w| !RELATIONAL_WORDS.contains(w))
        .filter(|w| !GENERIC_NOUNS.contains(w))
        .filter(|w| !POSITIONAL_KEYWORDS.contains(w))
        .filter(|w| !w.starts_with("quoted_"))
        .map(str::to_string)
        .collect();
    tokens.sort();
    tokens.dedup();

    let mut normalized = tokens.join(" ");
    if !positions.is_empty() {
        let rendered: Vec<String> = positions
            .iter()
            .map(|p| match &p.context {
                Some(ctx) => format!("{}-{}", p.keyword, ctx),
                None => p.keyword.clone(),
            })
            .collect();
        normalized.push_str(&format!(" _pos:{}", rendered.join(",")));
    }
    if !quoted.is_empty() {
        normalized.push_str(&format!(" _quoted:{}", quoted.join(",")));
    }
    let normalized = normalized.trim().to_string();

    let hash = md5_hex(&normalized);

    NormalizedIntent {
        normalized,
        tokens,
        positions,
        quoted,
        features,
        hash,
    }
}

/// Apply the fixed locator-syntax repair table once, left-to-right.
pub fn repair_locator_syntax(input: &str) -> String {
    let s = TEXT_PSEUDO_RE.replace_all(input, ":has-text(").to_string();
    let s = BARE_TEXT_RE.replace_all(&s, "${1}text=").to_string();
    let s = FIRST_LAST_RE
        .replace_all(&s, |caps: &regex::Captures| {
            // already-expanded forms pass through untouched
            if caps.get(2).is_some() {
                caps[0].to_string()
            } else {
                format!(":{}-of-type", &caps[1])
            }
        })
        .to_string();
    let s = CHAIN_FIRST_RE.replace_all(&s, ">> nth=0").to_string();
    CHAIN_LAST_RE.replace_all(&s, ">> nth=-1").to_string()
}

fn extract_features(repaired: &str) -> IntentFeatures {
    let lowered = repaired.to_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();

    let first_word = words
        .first()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .unwrap_or("");
    let has_imperative = ACTION_GROUPS
        .iter()
        .any(|(_, synonyms)| synonyms.contains(&first_word));

    let is_navigation = words.iter().any(|w| {
        matches!(*w, "go" | "navigate" | "open" | "visit" | "load") || w.starts_with("http")
    });
    let is_form_action = words.iter().any(|w| {
        matches!(
            *w,
            "type" | "enter" | "input" | "fill" | "write" | "submit" | "select" | "check"
        )
    });

    IntentFeatures {
        has_id: ID_RE.is_match(repaired),
        has_class: CLASS_RE.is_match(repaired),
        has_quoted: QUOTED_RE.is_match(repaired),
        has_data_test_id: lowered.contains("data-testid") || lowered.contains("data-test-id"),
        has_imperative,
        is_navigation,
        is_form_action,
        numbers: NUMBER_RE
            .find_iter(repaired)
            .map(|m| m.as_str().to_string())
            .collect(),
        attributes: ATTRIBUTE_RE
            .captures_iter(repaired)
            .map(|c| c[1].to_lowercase())
            .collect(),
        case_pattern: classify_case(repaired),
    }
}

fn classify_case(input: &str) -> CasePattern {
    let letters: Vec<char> = input.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        return CasePattern::Lower;
    }
    if letters.iter().all(|c| c.is_lowercase()) {
        return CasePattern::Lower;
    }
    if letters.iter().all(|c| c.is_uppercase()) {
        return CasePattern::Upper;
    }
    let title = input.split_whitespace().all(|w| {
        let mut chars = w.chars().filter(|c| c.is_alphabetic());
        match chars.next() {
            Some(first) => first.is_uppercase() && chars.all(|c| c.is_lowercase()),
            None => true,
        }
    });
    if title {
        CasePattern::Title
    } else {
        CasePattern::Mixed
    }
}

/// Replace quoted substrings with `QUOTED_i` placeholders, remembering the
/// originals lowercased with suffix-safe characters.
fn extract_quoted(input: &str) -> (String, Vec<String>) {
    let mut quoted = Vec::new();
    let result = QUOTED_RE.replace_all(input, |caps: &regex::Captures| {
        let content = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or("");
        let sanitized = content.to_lowercase().replace(',', " ").trim().to_string();
        quoted.push(sanitized);
        format!("QUOTED_{}", quoted.len() - 1)
    });
    (result.to_string(), quoted)
}

/// Record every positional keyword with its word index and adjacent word.
/// Positional keywords are never reordered or discarded.
fn extract_positions(words: &[String]) -> Vec<PositionRef> {
    let mut positions = Vec::new();
    for (index, word) in words.iter().enumerate() {
        let cleaned = clean_word(word);
        if POSITIONAL_KEYWORDS.contains(&cleaned.as_str()) {
            let context = adjacent_word(words, index);
            positions.push(PositionRef {
                keyword: cleaned,
                index,
                context,
            });
        }
    }
    positions
}

/// Adjacent word for a positional keyword: the next non-article word, or the
/// previous one when the keyword ends the phrase. Action synonyms are
/// canonicalized so paraphrases agree on context.
fn adjacent_word(words: &[String], index: usize) -> Option<String> {
    let pick = |w: &String| {
        let cleaned = clean_word(w);
        if cleaned.is_empty() || matches!(cleaned.as_str(), "the" | "a" | "an") {
            None
        } else {
            Some(canonicalize_action(&cleaned))
        }
    };
    for w in words.iter().skip(index + 1) {
        if let Some(ctx) = pick(w) {
            return Some(ctx);
        }
    }
    for w in words.iter().take(index).rev() {
        if let Some(ctx) = pick(w) {
            return Some(ctx);
        }
    }
    None
}

fn clean_word(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
        .to_lowercase()
}

/// Map an action synonym to its canonical verb; other words pass through.
pub fn canonicalize_action(word: &str) -> String {
    for (canonical, synonyms) in ACTION_GROUPS {
        if synonyms.contains(&word) {
            return canonical.to_string();
        }
    }
    word.to_string()
}

/// Strip the leading click prefix, trailing generic noun, articles, and
/// non-word punctuation; collapse whitespace.
fn strip_noise(input: &str) -> String {
    let s = LEADING_CLICK_RE.replace(input, "").to_string();
    let s = TRAILING_NOUN_RE.replace(&s, "").to_string();
    let s = PUNCT_RE.replace_all(&s, " ").to_string();
    let s: Vec<&str> = s
        .split_whitespace()
        .filter(|w| !matches!(*w, "the" | "a" | "an"))
        .collect();
    WHITESPACE_RE.replace_all(&s.join(" "), " ").trim().to_string()
}

/// Split canonical `_pos`/`_quoted` suffixes off an already-normalized
/// input so re-normalization is stable.
fn peel_suffixes(input: &str) -> (String, Vec<PositionRef>, Vec<String>) {
    // The marker may start the string when every token stripped away.
    fn split_marker(body: &mut String, marker: &str) -> Option<String> {
        if let Some(rest) = body.strip_prefix(marker.trim_start()) {
            let tail = rest.to_string();
            body.clear();
            return Some(tail);
        }
        if let Some(idx) = body.find(marker) {
            let tail = body[idx + marker.len()..].to_string();
            body.truncate(idx);
            return Some(tail);
        }
        None
    }

    let mut body = input.to_string();
    let mut quoted = Vec::new();
    let mut positions = Vec::new();

    if let Some(tail) = split_marker(&mut body, " _quoted:") {
        quoted = tail
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(tail) = split_marker(&mut body, " _pos:") {
        for (i, item) in tail.split(',').filter(|s| !s.is_empty()).enumerate() {
            let (keyword, context) = match item.split_once('-') {
                Some((k, c)) => (k.to_string(), Some(c.to_string())),
                None => (item.to_string(), None),
            };
            positions.push(PositionRef {
                keyword,
                index: i,
                context,
            });
        }
    }
    (body, positions, quoted)
}

pub fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Token set as a `HashSet` for similarity computations.
pub fn token_set(intent: &NormalizedIntent) -> HashSet<&str> {
    intent.tokens.iter().map(String::as_str).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paraphrases_share_canonical_form() {
        let a = normalize_intent("Click the Add Todo button");
        let b = normalize_intent("press add todo");
        assert_eq!(a.normalized, b.normalized);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.normalized, "add todo");
    }

    #[test]
    fn test_word_order_is_invariant() {
        let a = normalize_intent("todo add");
        let b = normalize_intent("add todo");
        assert_eq!(a.normalized, b.normalized);
    }

    #[test]
    fn test_positional_keywords_differentiate() {
        let first = normalize_intent("Click first Submit");
        let last = normalize_intent("Click last Submit");
        assert_ne!(first.normalized, last.normalized);
        assert_eq!(first.positions.len(), 1);
        assert_eq!(first.positions[0].keyword, "first");
        assert_eq!(first.positions[0].context.as_deref(), Some("submit"));
    }

    #[test]
    fn test_action_synonym_does_not_change_position_context() {
        let a = normalize_intent("press first");
        let b = normalize_intent("click first");
        assert_eq!(a.normalized, b.normalized);
    }

    #[test]
    fn test_quoted_text_is_preserved() {
        let a = normalize_intent("click 'Save Draft'");
        assert_eq!(a.quoted, vec!["save draft".to_string()]);
        assert!(a.normalized.contains("_quoted:save draft"));

        let b = normalize_intent("click 'Discard'");
        assert_ne!(a.normalized, b.normalized);
    }

    #[test]
    fn test_idempotent_on_canonical_form() {
        let inputs = [
            "Click the Add Todo button",
            "Click first Submit",
            "type 'hello' in the search field",
            "open the settings page",
        ];
        for input in inputs {
            let once = normalize_intent(input);
            let twice = normalize_intent(&once.normalized);
            assert_eq!(once.normalized, twice.normalized, "input: {}", input);
        }
    }

    #[test]
    fn test_locator_repair_table() {
        assert_eq!(
            repair_locator_syntax("button:text(\"Add\")"),
            "button:has-text(\"Add\")"
        );
        assert_eq!(repair_locator_syntax("text(Save)"), "text=Save)");
        assert_eq!(repair_locator_syntax("li:first"), "li:first-of-type");
        assert_eq!(repair_locator_syntax("li:last"), "li:last-of-type");
        assert_eq!(
            repair_locator_syntax("li:first-of-type"),
            "li:first-of-type"
        );
        assert_eq!(repair_locator_syntax("div >> first"), "div >> nth=0");
        assert_eq!(repair_locator_syntax("div >> last"), "div >> nth=-1");
    }

    #[test]
    fn test_feature_extraction() {
        let intent = normalize_intent("Click #submit-btn with [data-testid=\"save\"] 2 times");
        assert!(intent.features.has_id);
        assert!(intent.features.has_data_test_id);
        assert!(intent.features.has_imperative);
        assert_eq!(intent.features.numbers, vec!["2".to_string()]);
        assert!(intent
            .features
            .attributes
            .contains(&"data-testid".to_string()));
    }

    #[test]
    fn test_case_pattern() {
        assert_eq!(normalize_intent("click it").features.case_pattern, CasePattern::Lower);
        assert_eq!(normalize_intent("CLICK IT").features.case_pattern, CasePattern::Upper);
        assert_eq!(normalize_intent("Click It").features.case_pattern, CasePattern::Title);
        assert_eq!(
            normalize_intent("Click the Add Todo button").features.case_pattern,
            CasePattern::Mixed
        );
    }

    #[test]
    fn test_stop_and_relational_words_dropped() {
        let intent = normalize_intent("go to the login page from home");
        assert!(!intent.tokens.contains(&"to".to_string()));
        assert!(!intent.tokens.contains(&"from".to_string()));
        assert!(intent.tokens.contains(&"login".to_string()));
        assert!(intent.tokens.contains(&"navigate".to_string()));
    }

    #[test]
    fn test_memoized_normalizer_agrees_with_pipeline() {
        let normalizer = SmartNormalizer::new();
        let direct = normalize_intent("Click the Add Todo button");
        let cached1 = normalizer.normalize("Click the Add Todo button");
        let cached2 = normalizer.normalize("Click the Add Todo button");
        assert_eq!(direct, cached1);
        assert_eq!(cached1, cached2);
    }
}
