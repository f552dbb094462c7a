//! Three-level structural hashing of page snapshots.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One element of a page snapshot, as reported by the browser driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotElement {
    pub tag: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    /// Nesting depth in the DOM tree
    #[serde(default)]
    pub depth: usize,
}

impl SnapshotElement {
    fn is_interactive(&self) -> bool {
        matches!(
            self.tag.as_str(),
            "a" | "button" | "input" | "select" | "textarea" | "form" | "label"
        ) || matches!(
            self.role.as_deref(),
            Some("button") | Some("link") | Some("textbox") | Some("checkbox") | Some("menuitem")
        )
    }
}

/// Page snapshot handed in by the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub elements: Vec<SnapshotElement>,
}

/// Three-level structural hash of a page.
///
/// `full` covers every attribute and text digest, `structure` covers the
/// tag hierarchy only, `interactive` covers interactive elements. Rendered
/// as `full:structure:interactive` with 16 hex chars per level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomSignature {
    pub full: String,
    pub structure: String,
    pub interactive: String,
}

impl DomSignature {
    pub fn compute(snapshot: &PageSnapshot) -> Self {
        let mut full_input = String::new();
        let mut structure_input = String::new();
        let mut interactive_input = String::new();

        for element in &snapshot.elements {
            full_input.push_str(&format!(
                "{}#{}.{}@{}~{}|",
                element.tag,
                element.id.as_deref().unwrap_or(""),
                element.classes.join("."),
                element.role.as_deref().unwrap_or(""),
                element.text.as_deref().unwrap_or(""),
            ));
            structure_input.push_str(&format!("{}:{}|", element.depth, element.tag));
            if element.is_interactive() {
                interactive_input.push_str(&format!(
                    "{}#{}@{}|",
                    element.tag,
                    element.id.as_deref().unwrap_or(""),
                    element.role.as_deref().unwrap_or(""),
                ));
            }
        }

        Self {
            full: truncated_sha256(&full_input, 16),
            structure: truncated_sha256(&structure_input, 16),
            interactive: truncated_sha256(&interactive_input, 16),
        }
    }

    /// Parse the `full:structure:interactive` rendering. Returns `None` for
    /// anything that does not match.
    pub fn parse(rendered: &str) -> Option<Self> {
        let mut parts = rendered.split(':');
        let full = parts.next()?.to_string();
        let structure = parts.next()?.to_string();
        let interactive = parts.next()?.to_string();
        if parts.next().is_some() || full.is_empty() {
            return None;
        }
        Some(Self {
            full,
            structure,
            interactive,
        })
    }

    /// Compare two signatures level by level.
    pub fn diff(&self, other: &DomSignature) -> DomChange {
        DomChange {
            content_changed: self.full != other.full,
            structure_changed: self.structure != other.structure,
            interactive_changed: self.interactive != other.interactive,
        }
    }

    /// Fraction of matching levels, used by enhanced-key similarity.
    pub fn similarity(&self, other: &DomSignature) -> f64 {
        let mut matching = 0;
        if self.full == other.full {
            matching += 1;
        }
        if self.structure == other.structure {
            matching += 1;
        }
        if self.interactive == other.interactive {
            matching += 1;
        }
        matching as f64 / 3.0
    }
}

impl std::fmt::Display for DomSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.full, self.structure, self.interactive)
    }
}

/// Result of comparing two DOM signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomChange {
    pub content_changed: bool,
    pub structure_changed: bool,
    pub interactive_changed: bool,
}

impl DomChange {
    pub fn any(&self) -> bool {
        self.content_changed || self.structure_changed || self.interactive_changed
    }

    /// Cosmetic means content moved but the structure and interactive
    /// surface are intact; cached selectors are likely still valid.
    pub fn is_cosmetic(&self) -> bool {
        self.content_changed && !self.structure_changed && !self.interactive_changed
    }
}

pub fn truncated_sha256(input: &str, hex_chars: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..hex_chars.min(digest.len())].to_string()
}
