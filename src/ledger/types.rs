//! Ledger stage types and idempotency key derivation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle stage kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Registration,
    Intermediate,
    Final,
}

/// One immutable stage entry as held by the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStage {
    pub tag: String,
    /// Ledger-assigned, strictly increasing and gapless per tag
    pub index: u32,
    pub kind: StageKind,
    pub content_hash: Option<String>,
    pub freshness_score: Option<u8>,
    pub location: String,
    pub handler: String,
    pub description: String,
    /// Ledger-assigned timestamp, not client wall clock
    pub recorded_at: DateTime<Utc>,
}

/// Client-side intended stage content, before the ledger assigns index
/// ordering authority and a timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePayload {
    pub kind: StageKind,
    pub content_hash: Option<String>,
    pub freshness_score: Option<u8>,
    pub location: String,
    pub handler: String,
    pub description: String,
}

impl StagePayload {
    /// Deterministic digest over the payload content.
    ///
    /// Field order is fixed by the struct definition and serde_json emits map
    /// entries in that order, so identical payloads always hash identically.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(self).expect("stage payload serializes");
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }
}

/// Confirmation handle returned by the ledger for a durable write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRef {
    pub tag: String,
    pub index: u32,
    /// Backend confirmation handle (transaction receipt)
    pub receipt: String,
}

/// Content-addressed idempotency key for one intended stage write.
///
/// Derived from (tag, intended index, payload digest): a retried submission of
/// the identical stage content hits the same key, so the ledger can recognize
/// it as a replay rather than a second stage.
pub fn idempotency_key(tag: &str, index: u32, payload: &StagePayload) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    hasher.update(b":");
    hasher.update(index.to_be_bytes());
    hasher.update(b":");
    hasher.update(payload.digest().as_bytes());
    hex::encode(hasher.finalize())
}
