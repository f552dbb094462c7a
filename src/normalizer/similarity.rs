//! Similarity primitives over normalized intents.
//!
//! Jaccard with quote/position adjustments, a semantic variant backed by a
//! small enumerated synonym table, Damerau-Levenshtein typo tolerance, and
//! context-aware scoring with per-operation thresholds and an
//! action-conflict sentinel.

use super::{NormalizedIntent, POSITIONAL_KEYWORDS};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use strsim::damerau_levenshtein;

/// Sentinel returned when two intents contain opposing verbs.
pub const CONFLICT_SENTINEL: f64 = -1.0;

/// Fuzzy candidates longer than this are skipped to keep the O(mn) distance
/// sub-millisecond.
pub const MAX_FUZZY_LEN: usize = 256;

/// Enumerated synonym groups for semantic Jaccard. Small and
/// domain-specific on purpose.
const SEMANTIC_GROUPS: &[&[&str]] = &[
    &["add", "create", "new", "insert"],
    &["remove", "delete", "erase"],
    &["edit", "update", "modify", "change"],
    &["search", "find", "lookup", "filter"],
    &["save", "submit", "confirm", "apply"],
    &["cancel", "dismiss", "abort"],
    &["todo", "task", "item"],
    &["login", "signin"],
    &["logout", "signout"],
    &["user", "account", "profile"],
    &["page", "screen", "view"],
];

/// Opposing verb pairs, expressed over semantic group representatives.
const ANTONYM_PAIRS: &[(&str, &str)] = &[
    ("enable", "disable"),
    ("open", "close"),
    ("login", "logout"),
    ("first", "last"),
    ("show", "hide"),
    ("start", "stop"),
    ("check", "uncheck"),
    ("expand", "collapse"),
];

lazy_static! {
    static ref SEMANTIC_MAP: HashMap<&'static str, &'static str> = {
        let mut map = HashMap::new();
        for group in SEMANTIC_GROUPS {
            let representative = group[0];
            for word in *group {
                map.insert(*word, representative);
            }
        }
        map
    };
}

/// Operation type selecting a similarity admission threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    CacheLookup,
    TestSearch,
    PatternMatch,
    CrossEnv,
    Default,
}

impl OperationType {
    /// Admission threshold for this operation.
    pub fn threshold(&self) -> f64 {
        match self {
            OperationType::CacheLookup => 0.55,
            OperationType::TestSearch => 0.45,
            OperationType::PatternMatch => 0.50,
            OperationType::CrossEnv => 0.35,
            OperationType::Default => 0.50,
        }
    }
}

fn semantic_word(word: &str) -> &str {
    SEMANTIC_MAP.get(word).copied().unwrap_or(word)
}

fn raw_sets<'a>(
    a: &'a NormalizedIntent,
    b: &'a NormalizedIntent,
) -> (HashSet<&'a str>, HashSet<&'a str>) {
    (
        a.tokens.iter().map(String::as_str).collect(),
        b.tokens.iter().map(String::as_str).collect(),
    )
}

fn adjusted(base: f64, a: &NormalizedIntent, b: &NormalizedIntent) -> f64 {
    let mut score = base;
    if !a.quoted.is_empty() && a.quoted == b.quoted {
        score += 0.2;
    }
    let pos_a: Vec<&str> = a.positions.iter().map(|p| p.keyword.as_str()).collect();
    let pos_b: Vec<&str> = b.positions.iter().map(|p| p.keyword.as_str()).collect();
    if pos_a != pos_b && (!pos_a.is_empty() || !pos_b.is_empty()) {
        score -= 0.3;
    }
    score.clamp(0.0, 1.0)
}

fn jaccard_of(sa: &HashSet<&str>, sb: &HashSet<&str>) -> f64 {
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    let intersection = sa.intersection(sb).count() as f64;
    let union = sa.union(sb).count() as f64;
    intersection / union
}

/// Plain Jaccard over token sets with quote and position adjustments,
/// clamped to [0, 1].
pub fn jaccard(a: &NormalizedIntent, b: &NormalizedIntent) -> f64 {
    let (sa, sb) = raw_sets(a, b);
    adjusted(jaccard_of(&sa, &sb), a, b)
}

/// Jaccard where enumerated synonyms count as equivalent tokens.
pub fn semantic_jaccard(a: &NormalizedIntent, b: &NormalizedIntent) -> f64 {
    let sa: HashSet<&str> = a.tokens.iter().map(|t| semantic_word(t)).collect();
    let sb: HashSet<&str> = b.tokens.iter().map(|t| semantic_word(t)).collect();
    adjusted(jaccard_of(&sa, &sb), a, b)
}

/// Semantic Jaccard over bare token lists, for stored candidates whose
/// positions and quotes are not materialized.
pub fn semantic_jaccard_tokens(a: &[String], b: &[String]) -> f64 {
    let sa: HashSet<&str> = a.iter().map(|t| semantic_word(t)).collect();
    let sb: HashSet<&str> = b.iter().map(|t| semantic_word(t)).collect();
    jaccard_of(&sa, &sb)
}

/// Semantic Jaccard over raw token collections, for learning paths that
/// compare raw inputs rather than full normalized intents.
pub fn semantic_token_overlap(a: &[String], b: &[String]) -> usize {
    let sa: HashSet<&str> = a.iter().map(|t| semantic_word(t)).collect();
    let sb: HashSet<&str> = b.iter().map(|t| semantic_word(t)).collect();
    sa.intersection(&sb).count()
}

/// Damerau-Levenshtein distance between normalized strings.
pub fn fuzzy_distance(a: &str, b: &str) -> usize {
    damerau_levenshtein(a, b)
}

/// A fuzzy match is admissible when `0 < d <= floor(len(query)/8)`.
///
/// For queries shorter than 8 characters the tolerance collapses to zero
/// and fuzzy matching is effectively disabled. That behavior is kept as-is;
/// widening it silently would change hit semantics.
pub fn fuzzy_admissible(query_normalized: &str, candidate_normalized: &str) -> Option<usize> {
    if query_normalized.len() > MAX_FUZZY_LEN || candidate_normalized.len() > MAX_FUZZY_LEN {
        return None;
    }
    let distance = fuzzy_distance(query_normalized, candidate_normalized);
    let tolerance = query_normalized.len() / 8;
    if distance > 0 && distance <= tolerance {
        Some(distance)
    } else {
        None
    }
}

/// All words relevant for conflict detection: tokens plus positional
/// keywords, canonicalized through the synonym table.
fn conflict_words(intent: &NormalizedIntent) -> HashSet<&str> {
    let mut words: HashSet<&str> = intent.tokens.iter().map(|t| semantic_word(t)).collect();
    for p in &intent.positions {
        if POSITIONAL_KEYWORDS.contains(&p.keyword.as_str()) {
            words.insert(p.keyword.as_str());
        }
    }
    words
}

/// Detect opposing verbs between two otherwise similar intents.
pub fn has_action_conflict(a: &NormalizedIntent, b: &NormalizedIntent) -> bool {
    let wa = conflict_words(a);
    let wb = conflict_words(b);
    ANTONYM_PAIRS.iter().any(|(x, y)| {
        (wa.contains(x) && wb.contains(y) && !wa.contains(y) && !wb.contains(x))
            || (wa.contains(y) && wb.contains(x) && !wa.contains(x) && !wb.contains(y))
    })
}

/// Context-aware similarity. Returns the conflict sentinel when opposing
/// verbs are present; otherwise semantic Jaccard.
pub fn context_similarity(
    a: &NormalizedIntent,
    b: &NormalizedIntent,
    _operation: OperationType,
    _cross_env: bool,
) -> f64 {
    if has_action_conflict(a, b) {
        return CONFLICT_SENTINEL;
    }
    semantic_jaccard(a, b)
}

/// Whether a similarity admits under the operation's threshold. A cross
/// environment comparison always uses the lower cross-env threshold.
pub fn admits(similarity: f64, operation: OperationType, cross_env: bool) -> bool {
    let operation = if cross_env {
        OperationType::CrossEnv
    } else {
        operation
    };
    similarity >= operation.threshold()
}
