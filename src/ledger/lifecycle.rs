//! Lifecycle state machine over a ledger backend
//!
//! Enforces the three-stage lifecycle per tag: exactly one registration at
//! index 0, any number of intermediate stages, at most one final stage which
//! closes the tag. Stage indices are assigned by the ledger itself; this
//! wrapper reads preconditions, derives content-addressed idempotency keys,
//! and handles the two retry regimes:
//!
//! - transient transport failures: bounded exponential backoff, then surfaced
//! - index collisions under concurrent writers: refetch and retry the next
//!   free index a bounded number of times, then `WriteConflict`
//!
//! Lifecycle violations are never retried.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::backend::{LedgerBackend, SubmitOutcome};
use super::types::{idempotency_key, LedgerStage, StageKind, StagePayload, StageRef};
use crate::types::{Result, TraceError};

/// Retries for transient transport failures before surfacing
const MAX_TRANSIENT_RETRIES: u32 = 3;

/// Retries at the next free index after losing an index race
const MAX_INDEX_RETRIES: u32 = 3;

/// Initial backoff delay, doubled per transient retry
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle ledger client
#[derive(Clone)]
pub struct LifecycleLedger {
    backend: Arc<dyn LedgerBackend>,
}

impl LifecycleLedger {
    pub fn new(backend: Arc<dyn LedgerBackend>) -> Self {
        Self { backend }
    }

    /// Register a tag: the only call permitted to create stage 0.
    pub async fn register(
        &self,
        tag: &str,
        content_hash: Option<String>,
        freshness_score: u8,
        location: &str,
        handler: &str,
        description: &str,
    ) -> Result<StageRef> {
        let stages = self.stages_with_backoff(tag).await?;
        if !stages.is_empty() {
            return Err(TraceError::AlreadyRegistered(tag.to_string()));
        }

        let payload = StagePayload {
            kind: StageKind::Registration,
            content_hash,
            freshness_score: Some(freshness_score),
            location: location.to_string(),
            handler: handler.to_string(),
            description: description.to_string(),
        };

        match self.submit_with_backoff(tag, 0, &payload).await? {
            SubmitOutcome::Accepted(stage_ref) | SubmitOutcome::Duplicate(stage_ref) => {
                Ok(stage_ref)
            }
            SubmitOutcome::IndexOccupied => Err(TraceError::AlreadyRegistered(tag.to_string())),
            SubmitOutcome::Closed => Err(TraceError::AlreadyFinalized(tag.to_string())),
        }
    }

    /// Append an intermediate handling stage.
    pub async fn record_intermediate(
        &self,
        tag: &str,
        location: &str,
        handler: &str,
        description: &str,
        content_hash: Option<String>,
        freshness_score: Option<u8>,
    ) -> Result<StageRef> {
        let payload = StagePayload {
            kind: StageKind::Intermediate,
            content_hash,
            freshness_score,
            location: location.to_string(),
            handler: handler.to_string(),
            description: description.to_string(),
        };
        self.append(tag, payload).await
    }

    /// Append the final delivery stage, closing the tag.
    pub async fn record_final(
        &self,
        tag: &str,
        content_hash: String,
        freshness_score: u8,
        location: &str,
        handler: &str,
        description: &str,
    ) -> Result<StageRef> {
        let payload = StagePayload {
            kind: StageKind::Final,
            content_hash: Some(content_hash),
            freshness_score: Some(freshness_score),
            location: location.to_string(),
            handler: handler.to_string(),
            description: description.to_string(),
        };
        self.append(tag, payload).await
    }

    /// All stages for a tag, index ascending. Empty means the tag was never
    /// registered; callers distinguish that from "registered, nothing since"
    /// by checking for length >= 1.
    pub async fn get_stages(&self, tag: &str) -> Result<Vec<LedgerStage>> {
        self.stages_with_backoff(tag).await
    }

    /// All known tag ids
    pub async fn list_tags(&self) -> Result<Vec<String>> {
        let mut attempt = 0;
        let mut delay = INITIAL_BACKOFF;
        loop {
            match self.backend.tags().await {
                Ok(tags) => return Ok(tags),
                Err(e) if e.is_transient() && attempt < MAX_TRANSIENT_RETRIES => {
                    attempt += 1;
                    warn!(attempt, "transient ledger failure listing tags: {}", e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Append one non-registration stage, retrying lost index races at the
    /// next free index.
    async fn append(&self, tag: &str, payload: StagePayload) -> Result<StageRef> {
        let mut stages = self.stages_with_backoff(tag).await?;
        if stages.is_empty() {
            return Err(TraceError::NotRegistered(tag.to_string()));
        }

        for attempt in 0..=MAX_INDEX_RETRIES {
            if stages.iter().any(|s| s.kind == StageKind::Final) {
                return Err(TraceError::AlreadyFinalized(tag.to_string()));
            }

            let index = stages.len() as u32;
            match self.submit_with_backoff(tag, index, &payload).await? {
                SubmitOutcome::Accepted(stage_ref) | SubmitOutcome::Duplicate(stage_ref) => {
                    return Ok(stage_ref);
                }
                SubmitOutcome::Closed => {
                    return Err(TraceError::AlreadyFinalized(tag.to_string()));
                }
                SubmitOutcome::IndexOccupied => {
                    debug!(tag, index, attempt, "lost index race, refetching");
                    stages = self.stages_with_backoff(tag).await?;
                }
            }
        }

        Err(TraceError::WriteConflict(format!(
            "tag {} lost the stage index race {} times",
            tag,
            MAX_INDEX_RETRIES + 1
        )))
    }

    /// Submit one intended stage, retrying transient failures with backoff.
    ///
    /// The idempotency key is fixed before the first attempt, so a retried
    /// submission whose predecessor actually committed comes back as
    /// `Duplicate` rather than a second stage. The same intended stage is
    /// never submitted with a different payload.
    async fn submit_with_backoff(
        &self,
        tag: &str,
        index: u32,
        payload: &StagePayload,
    ) -> Result<SubmitOutcome> {
        let key = idempotency_key(tag, index, payload);

        let mut attempt = 0;
        let mut delay = INITIAL_BACKOFF;
        loop {
            match self.backend.submit_stage(tag, index, payload, &key).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt < MAX_TRANSIENT_RETRIES => {
                    attempt += 1;
                    warn!(tag, index, attempt, "transient ledger failure: {}", e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stages_with_backoff(&self, tag: &str) -> Result<Vec<LedgerStage>> {
        let mut attempt = 0;
        let mut delay = INITIAL_BACKOFF;
        loop {
            match self.backend.stages(tag).await {
                Ok(stages) => return Ok(stages),
                Err(e) if e.is_transient() && attempt < MAX_TRANSIENT_RETRIES => {
                    attempt += 1;
                    warn!(tag, attempt, "transient ledger failure reading stages: {}", e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::backend::MemoryLedger;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn ledger() -> LifecycleLedger {
        LifecycleLedger::new(Arc::new(MemoryLedger::new()))
    }

    async fn register(l: &LifecycleLedger, tag: &str) -> StageRef {
        l.register(tag, None, 95, "farm", "farmer-1", "harvested")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_assigns_stage_zero() {
        let l = ledger();
        let stage_ref = register(&l, "T1").await;
        assert_eq!(stage_ref.index, 0);

        let stages = l.get_stages("T1").await.unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].kind, StageKind::Registration);
        assert_eq!(stages[0].freshness_score, Some(95));
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let l = ledger();
        register(&l, "T1").await;

        let err = l
            .register("T1", None, 90, "farm", "farmer-2", "again")
            .await
            .unwrap_err();
        assert!(matches!(err, TraceError::AlreadyRegistered(_)));

        // Never two stage-0 entries
        assert_eq!(l.get_stages("T1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_intermediate_requires_registration() {
        let l = ledger();
        let err = l
            .record_intermediate("T9", "depot", "h1", "in transit", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TraceError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn test_indices_are_gapless_and_final_is_last() {
        let l = ledger();
        register(&l, "T1").await;
        l.record_intermediate("T1", "depot", "h1", "in transit", None, None)
            .await
            .unwrap();
        l.record_intermediate("T1", "port", "h2", "loaded", None, None)
            .await
            .unwrap();
        l.record_final("T1", "bafk-final".into(), 80, "store", "h3", "delivered")
            .await
            .unwrap();

        let stages = l.get_stages("T1").await.unwrap();
        let indices: Vec<u32> = stages.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        let finals = stages
            .iter()
            .filter(|s| s.kind == StageKind::Final)
            .count();
        assert_eq!(finals, 1);
        assert_eq!(stages.last().unwrap().kind, StageKind::Final);
    }

    #[tokio::test]
    async fn test_no_appends_after_final() {
        let l = ledger();
        register(&l, "T1").await;
        l.record_final("T1", "bafk-final".into(), 75, "store", "h3", "delivered")
            .await
            .unwrap();

        let err = l
            .record_intermediate("T1", "depot", "h1", "late", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TraceError::AlreadyFinalized(_)));

        let err = l
            .record_final("T1", "bafk-other".into(), 60, "store", "h4", "again")
            .await
            .unwrap_err();
        assert!(matches!(err, TraceError::AlreadyFinalized(_)));
    }

    #[tokio::test]
    async fn test_unknown_tag_reads_empty_not_error() {
        let l = ledger();
        assert!(l.get_stages("never-seen").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_tags() {
        let l = ledger();
        register(&l, "T1").await;
        register(&l, "T2").await;
        assert_eq!(l.list_tags().await.unwrap(), vec!["T1", "T2"]);
    }

    /// Backend whose submit commits but loses the response once, simulating a
    /// retried network call
    struct LossyBackend {
        inner: MemoryLedger,
        lose_next_response: AtomicBool,
    }

    #[async_trait]
    impl LedgerBackend for LossyBackend {
        async fn submit_stage(
            &self,
            tag: &str,
            index: u32,
            payload: &StagePayload,
            idempotency_key: &str,
        ) -> Result<SubmitOutcome> {
            let outcome = self
                .inner
                .submit_stage(tag, index, payload, idempotency_key)
                .await?;
            if self.lose_next_response.swap(false, Ordering::SeqCst) {
                return Err(TraceError::LedgerUnavailable("response lost".into()));
            }
            Ok(outcome)
        }

        async fn stages(&self, tag: &str) -> Result<Vec<LedgerStage>> {
            self.inner.stages(tag).await
        }

        async fn tags(&self) -> Result<Vec<String>> {
            self.inner.tags().await
        }
    }

    #[tokio::test]
    async fn test_idempotent_retry_after_lost_response() {
        let backend = Arc::new(LossyBackend {
            inner: MemoryLedger::new(),
            lose_next_response: AtomicBool::new(false),
        });
        let l = LifecycleLedger::new(Arc::clone(&backend) as Arc<dyn LedgerBackend>);
        register(&l, "T1").await;

        // The write commits on the first attempt but the confirmation is
        // lost; the wrapper's retry must land on Duplicate, not a new stage
        backend.lose_next_response.store(true, Ordering::SeqCst);
        l.record_intermediate("T1", "depot", "h1", "in transit", None, None)
            .await
            .unwrap();

        let stages = l.get_stages("T1").await.unwrap();
        assert_eq!(stages.len(), 2);
    }

    /// Backend that injects a competing writer's stage before the first
    /// submission attempt
    struct RacingBackend {
        inner: MemoryLedger,
        races_left: AtomicU32,
    }

    #[async_trait]
    impl LedgerBackend for RacingBackend {
        async fn submit_stage(
            &self,
            tag: &str,
            index: u32,
            payload: &StagePayload,
            idempotency_key: &str,
        ) -> Result<SubmitOutcome> {
            if self
                .races_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                let competitor = StagePayload {
                    kind: StageKind::Intermediate,
                    content_hash: None,
                    freshness_score: None,
                    location: "elsewhere".into(),
                    handler: "rival".into(),
                    description: "competing write".into(),
                };
                let key = idempotency_key_for(tag, index, &competitor);
                let _ = self.inner.submit_stage(tag, index, &competitor, &key).await;
            }
            self.inner
                .submit_stage(tag, index, payload, idempotency_key)
                .await
        }

        async fn stages(&self, tag: &str) -> Result<Vec<LedgerStage>> {
            self.inner.stages(tag).await
        }

        async fn tags(&self) -> Result<Vec<String>> {
            self.inner.tags().await
        }
    }

    fn idempotency_key_for(tag: &str, index: u32, payload: &StagePayload) -> String {
        super::idempotency_key(tag, index, payload)
    }

    #[tokio::test]
    async fn test_index_race_retries_next_free_index() {
        let backend = Arc::new(RacingBackend {
            inner: MemoryLedger::new(),
            races_left: AtomicU32::new(0),
        });
        let l = LifecycleLedger::new(Arc::clone(&backend) as Arc<dyn LedgerBackend>);
        register(&l, "T1").await;

        backend.races_left.store(1, Ordering::SeqCst);
        let stage_ref = l
            .record_intermediate("T1", "depot", "h1", "in transit", None, None)
            .await
            .unwrap();

        // Competitor took index 1; our write landed at 2
        assert_eq!(stage_ref.index, 2);
        assert_eq!(l.get_stages("T1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_persistent_index_race_surfaces_write_conflict() {
        let backend = Arc::new(RacingBackend {
            inner: MemoryLedger::new(),
            races_left: AtomicU32::new(0),
        });
        let l = LifecycleLedger::new(Arc::clone(&backend) as Arc<dyn LedgerBackend>);
        register(&l, "T1").await;

        backend.races_left.store(u32::MAX, Ordering::SeqCst);
        let err = l
            .record_intermediate("T1", "depot", "h1", "in transit", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TraceError::WriteConflict(_)));
    }
}
