//! Live telemetry feed
//!
//! RFID readers publish pings over NATS as they see tags. The feed keeps one
//! snapshot per tag, keyed by ping id, and pushes the whole snapshot to
//! subscribers whenever it changes. Pings are sightings, not an authoritative
//! history: the reconciler ranks them below ledger stages and record entries.

mod feed;
mod subscription;

pub use feed::TelemetryFeed;
pub use subscription::{SnapshotCallback, Subscription, SubscriptionRegistry};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One RFID sighting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryPing {
    /// Reader-assigned id, unique per sighting
    pub ping_id: String,
    /// The tag that was read
    pub tag: String,
    pub location: String,
    pub recorded_at: DateTime<Utc>,
}
