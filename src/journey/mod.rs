//! Journey reconciliation
//!
//! Merges the three provenance sources for one tag into a single ordered
//! timeline. The sources disagree on schema, freshness, and trust: ledger
//! stages are authoritative, record annotations are actor-authored, telemetry
//! pings are raw sensor sightings. Reconciliation is a pure function over its
//! inputs; it is recomputed on every read and never persisted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;

use crate::ledger::LedgerStage;
use crate::record::ProductRecord;
use crate::telemetry::TelemetryPing;

/// Which source produced a journey entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Ledger,
    Record,
    Telemetry,
}

/// Trust ranking across sources. Variant order is the ranking; the derived
/// `Ord` puts `Ledger` on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Telemetry,
    Record,
    Ledger,
}

impl SourceKind {
    pub fn tier(self) -> TrustTier {
        match self {
            SourceKind::Ledger => TrustTier::Ledger,
            SourceKind::Record => TrustTier::Record,
            SourceKind::Telemetry => TrustTier::Telemetry,
        }
    }
}

/// One entry in the reconciled timeline
#[derive(Debug, Clone, Serialize)]
pub struct JourneyEntry {
    pub kind: SourceKind,
    /// Source-local id, unique within the kind
    pub source_id: String,
    pub tier: TrustTier,
    pub description: String,
    pub location: String,
    pub recorded_at: DateTime<Utc>,
    /// Media reference from the source; resolved to a gateway locator at the
    /// display boundary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freshness_score: Option<u8>,
}

/// Reconciled view of one tag
#[derive(Debug, Clone, Serialize)]
pub struct JourneyView {
    pub tag: String,
    /// Whether the ledger knows this tag. An unregistered tag can still carry
    /// telemetry entries.
    pub registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_location: Option<String>,
    pub entries: Vec<JourneyEntry>,
}

fn stage_entry(stage: &LedgerStage) -> JourneyEntry {
    JourneyEntry {
        kind: SourceKind::Ledger,
        source_id: format!("{}:{}", stage.tag, stage.index),
        tier: TrustTier::Ledger,
        description: stage.description.clone(),
        location: stage.location.clone(),
        recorded_at: stage.recorded_at,
        media: stage.content_hash.clone(),
        freshness_score: stage.freshness_score,
    }
}

fn record_entries(record: &ProductRecord) -> impl Iterator<Item = JourneyEntry> + '_ {
    record.annotations.iter().map(|a| JourneyEntry {
        kind: SourceKind::Record,
        source_id: format!("{}:{}", record.product_id, a.seq),
        tier: TrustTier::Record,
        description: a.description.clone(),
        location: a.location.clone(),
        recorded_at: a.recorded_at,
        media: a.media_hash.clone(),
        freshness_score: None,
    })
}

fn ping_entry(ping: &TelemetryPing) -> JourneyEntry {
    JourneyEntry {
        kind: SourceKind::Telemetry,
        source_id: ping.ping_id.clone(),
        tier: TrustTier::Telemetry,
        description: format!("Sighted at {}", ping.location),
        location: ping.location.clone(),
        recorded_at: ping.recorded_at,
        media: None,
        freshness_score: None,
    }
}

/// Merge the three sources into one deduplicated, newest-first timeline.
///
/// Ordering: timestamp descending, ties broken by trust tier, remaining ties
/// by input position (stable sort). Dedup key is (kind, source id), so a
/// telemetry snapshot submitted twice contributes each ping once.
pub fn reconcile(
    tag: &str,
    stages: &[LedgerStage],
    record: Option<&ProductRecord>,
    pings: &[TelemetryPing],
) -> JourneyView {
    let mut entries: Vec<JourneyEntry> = Vec::new();
    let mut seen: HashSet<(SourceKind, String)> = HashSet::new();

    let all = stages
        .iter()
        .map(stage_entry)
        .chain(record.into_iter().flat_map(record_entries))
        .chain(pings.iter().map(ping_entry));

    for entry in all {
        if seen.insert((entry.kind, entry.source_id.clone())) {
            entries.push(entry);
        }
    }

    entries.sort_by(|a, b| {
        b.recorded_at
            .cmp(&a.recorded_at)
            .then_with(|| b.tier.cmp(&a.tier))
    });

    JourneyView {
        tag: tag.to_string(),
        registered: !stages.is_empty(),
        current_location: current_location(&entries),
        entries,
    }
}

/// The display location for a tag: the newest entry from the most trusted
/// source present. A stale ledger stage still beats a fresher telemetry ping,
/// so an unattested sighting can never override a confirmed delivery.
fn current_location(entries: &[JourneyEntry]) -> Option<String> {
    let best_tier = entries.iter().map(|e| e.tier).max()?;
    entries
        .iter()
        .find(|e| e.tier == best_tier)
        .map(|e| e.location.clone())
}
