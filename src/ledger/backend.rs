//! Ledger backend seam and the in-process backend
//!
//! The backend owns the per-tag stage counter: index assignment, gaplessness,
//! and closed-after-final are enforced here, not in the client wrapper. The
//! wrapper's precondition reads are an optimization; the backend's verdict is
//! authoritative under concurrent writers.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use super::types::{LedgerStage, StageKind, StagePayload, StageRef};
use crate::types::Result;

/// Outcome of one stage submission
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Stage durably appended at the requested index
    Accepted(StageRef),
    /// The identical stage (same idempotency key) already exists at this
    /// index; a replayed submission, treated as success
    Duplicate(StageRef),
    /// A different stage occupies the requested index; the caller lost the
    /// index race and may retry at the next free index
    IndexOccupied,
    /// The tag already carries a final stage; no further appends
    Closed,
}

/// Seam to the lifecycle ledger service
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Submit one stage at an intended index. At-least-once safe: replays of
    /// the same idempotency key return `Duplicate`, never a second stage.
    async fn submit_stage(
        &self,
        tag: &str,
        index: u32,
        payload: &StagePayload,
        idempotency_key: &str,
    ) -> Result<SubmitOutcome>;

    /// All stages for a tag, index ascending. Empty (not an error) when the
    /// tag was never registered.
    async fn stages(&self, tag: &str) -> Result<Vec<LedgerStage>>;

    /// All known tag ids; stable enumeration within one call
    async fn tags(&self) -> Result<Vec<String>>;
}

/// In-process ledger backend for dev mode and tests.
///
/// Mirrors the transactional backend's semantics: single writer per tag via
/// the per-entry lock the map gives us, strict index assignment, idempotency
/// key comparison at occupied indices.
#[derive(Default)]
pub struct MemoryLedger {
    /// tag -> ordered stage entries with their idempotency keys
    chains: DashMap<String, Vec<(String, LedgerStage)>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerBackend for MemoryLedger {
    async fn submit_stage(
        &self,
        tag: &str,
        index: u32,
        payload: &StagePayload,
        idempotency_key: &str,
    ) -> Result<SubmitOutcome> {
        let mut chain = self.chains.entry(tag.to_string()).or_default();

        if let Some((existing_key, existing)) = chain.get(index as usize) {
            if existing_key == idempotency_key {
                debug!(tag, index, "replayed stage submission, returning existing ref");
                return Ok(SubmitOutcome::Duplicate(StageRef {
                    tag: existing.tag.clone(),
                    index: existing.index,
                    receipt: format!("mem-{}", existing_key),
                }));
            }
            return Ok(SubmitOutcome::IndexOccupied);
        }

        if let Some((_, last)) = chain.last() {
            if last.kind == StageKind::Final {
                return Ok(SubmitOutcome::Closed);
            }
        }

        if index as usize != chain.len() {
            // Intended index is ahead of the chain head; the caller's view is
            // stale in the other direction
            return Ok(SubmitOutcome::IndexOccupied);
        }

        let stage = LedgerStage {
            tag: tag.to_string(),
            index,
            kind: payload.kind,
            content_hash: payload.content_hash.clone(),
            freshness_score: payload.freshness_score,
            location: payload.location.clone(),
            handler: payload.handler.clone(),
            description: payload.description.clone(),
            recorded_at: Utc::now(),
        };
        chain.push((idempotency_key.to_string(), stage));

        Ok(SubmitOutcome::Accepted(StageRef {
            tag: tag.to_string(),
            index,
            receipt: format!("mem-{}", idempotency_key),
        }))
    }

    async fn stages(&self, tag: &str) -> Result<Vec<LedgerStage>> {
        Ok(self
            .chains
            .get(tag)
            .map(|chain| chain.iter().map(|(_, s)| s.clone()).collect())
            .unwrap_or_default())
    }

    async fn tags(&self) -> Result<Vec<String>> {
        let mut tags: Vec<String> = self.chains.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        Ok(tags)
    }
}
