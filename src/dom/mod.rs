//! DOM signature computation over page snapshots.
//!
//! The snapshot itself is produced by the external browser driver; this
//! module only defines the snapshot shape it consumes and the three-level
//! structural hash used for change detection and enhanced cache keys.

pub mod signature;

pub use signature::{DomChange, DomSignature, PageSnapshot, SnapshotElement};
