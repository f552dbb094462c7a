//! Snapshot sub-cache payload handling.
//!
//! Payloads are opaque to the cache; they are stored inside a small
//! versioned envelope so a corrupt blob is detected on read instead of
//! being handed back to the caller.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

const ENVELOPE_VERSION: u8 = 1;

/// Options accepted by `set_snapshot`.
#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub url: Option<String>,
    pub profile: Option<String>,
    pub viewport: Option<String>,
    /// Per-row TTL in seconds; falls back to the configured default
    pub ttl: Option<u64>,
    /// Structural hash of the page the payload was captured from
    pub dom_hash: Option<String>,
}

/// Scope filter for `invalidate_snapshots`.
#[derive(Debug, Clone, Default)]
pub struct SnapshotScope {
    pub url: Option<String>,
    pub profile: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    version: u8,
    data: Vec<u8>,
}

/// Encode an opaque payload for storage.
pub fn encode_payload(payload: &[u8]) -> Result<Vec<u8>> {
    bincode::serialize(&SnapshotEnvelope {
        version: ENVELOPE_VERSION,
        data: payload.to_vec(),
    })
    .map_err(|e| StoreError::SnapshotDecode(e.to_string()).into())
}

/// Decode a stored blob back into the caller's payload.
pub fn decode_payload(blob: &[u8]) -> Result<Vec<u8>> {
    let envelope: SnapshotEnvelope = bincode::deserialize(blob)
        .map_err(|e| StoreError::SnapshotDecode(e.to_string()))?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(StoreError::SnapshotDecode(format!(
            "unsupported envelope version {}",
            envelope.version
        ))
        .into());
    }
    Ok(envelope.data)
}
