//! Telemetry snapshot state and NATS ingestion

use dashmap::DashMap;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::subscription::{SnapshotCallback, Subscription, SubscriptionRegistry};
use super::TelemetryPing;
use crate::nats::NatsClient;
use crate::types::Result;

/// Live per-tag snapshot of RFID sightings
#[derive(Default)]
pub struct TelemetryFeed {
    /// Current snapshot per tag, keyed by ping id for deterministic ordering
    snapshots: DashMap<String, BTreeMap<String, TelemetryPing>>,
    registry: Arc<SubscriptionRegistry>,
}

impl TelemetryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one ping into the tag's snapshot, notifying subscribers when the
    /// snapshot actually changed. A replayed ping is absorbed silently.
    ///
    /// The entry guard stays held through `notify`, so a subscriber
    /// registering concurrently either sees this ping in its initial
    /// snapshot or receives the change notification, never neither.
    pub fn ingest(&self, ping: TelemetryPing) {
        let tag = ping.tag.clone();
        let mut snapshot = self.snapshots.entry(tag.clone()).or_default();
        let changed = match snapshot.get(&ping.ping_id) {
            Some(existing) if *existing == ping => false,
            _ => {
                snapshot.insert(ping.ping_id.clone(), ping);
                true
            }
        };

        if changed {
            let current: Vec<TelemetryPing> = snapshot.values().cloned().collect();
            debug!(tag = %tag, pings = current.len(), "telemetry snapshot changed");
            self.registry.notify(&tag, &current);
        }
    }

    /// Current snapshot for a tag, in ping-id order. A tag with no sightings
    /// yields an empty snapshot.
    pub fn snapshot(&self, tag: &str) -> Vec<TelemetryPing> {
        self.snapshots
            .get(tag)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribe to snapshot changes on a tag. The callback first receives
    /// the current snapshot, then the full snapshot after each change.
    ///
    /// Holding the snapshot entry serializes registration against `ingest`
    /// on the same tag: the initial snapshot and registry membership are
    /// established as one step.
    pub fn subscribe(&self, tag: &str, callback: SnapshotCallback) -> Subscription {
        let snapshot = self.snapshots.entry(tag.to_string()).or_default();
        let initial = snapshot.values().cloned().collect();
        Arc::clone(&self.registry).register(tag, callback, initial)
    }

    /// Number of active subscriptions across all tags
    pub fn subscription_count(&self) -> usize {
        self.registry.subscription_count()
    }

    /// Consume pings from NATS until the subscription closes. Malformed
    /// payloads are logged and skipped.
    pub async fn run_ingest(self: Arc<Self>, nats: NatsClient, subject_prefix: &str) -> Result<()> {
        let subject = format!("{}.>", subject_prefix);
        let mut subscriber = nats.subscribe(&subject).await?;
        info!(subject = %subject, "telemetry ingestion started");

        while let Some(message) = subscriber.next().await {
            match serde_json::from_slice::<TelemetryPing>(&message.payload) {
                Ok(ping) => self.ingest(ping),
                Err(e) => {
                    warn!(subject = %message.subject, "Dropping unparsable telemetry ping: {}", e)
                }
            }
        }

        warn!(subject = %subject, "telemetry ingestion stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tokio::sync::mpsc;

    fn ping(ping_id: &str, tag: &str, location: &str) -> TelemetryPing {
        TelemetryPing {
            ping_id: ping_id.to_string(),
            tag: tag.to_string(),
            location: location.to_string(),
            recorded_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn collecting_callback() -> (SnapshotCallback, mpsc::UnboundedReceiver<Vec<TelemetryPing>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: SnapshotCallback = Arc::new(move |snapshot| {
            let _ = tx.send(snapshot);
        });
        (callback, rx)
    }

    #[tokio::test]
    async fn test_replayed_ping_does_not_grow_snapshot() {
        let feed = TelemetryFeed::new();
        feed.ingest(ping("p1", "T1", "Gate A"));
        feed.ingest(ping("p1", "T1", "Gate A"));
        assert_eq!(feed.snapshot("T1").len(), 1);
    }

    #[tokio::test]
    async fn test_updated_ping_replaces_in_place() {
        let feed = TelemetryFeed::new();
        feed.ingest(ping("p1", "T1", "Gate A"));
        feed.ingest(ping("p1", "T1", "Gate B"));
        let snapshot = feed.snapshot("T1");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].location, "Gate B");
    }

    #[tokio::test]
    async fn test_snapshot_ordered_by_ping_id() {
        let feed = TelemetryFeed::new();
        feed.ingest(ping("p3", "T1", "C"));
        feed.ingest(ping("p1", "T1", "A"));
        feed.ingest(ping("p2", "T1", "B"));
        let ids: Vec<String> = feed
            .snapshot("T1")
            .into_iter()
            .map(|p| p.ping_id)
            .collect();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn test_subscriber_receives_initial_then_full_snapshots() {
        let feed = TelemetryFeed::new();
        feed.ingest(ping("p1", "T1", "Gate A"));

        let (callback, mut rx) = collecting_callback();
        let _subscription = feed.subscribe("T1", callback);

        let initial = rx.recv().await.unwrap();
        assert_eq!(initial.len(), 1);

        feed.ingest(ping("p2", "T1", "Gate B"));
        let next = rx.recv().await.unwrap();
        // Whole snapshot every time, not a delta
        assert_eq!(next.len(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_during_ingest_never_misses_the_latest_snapshot() {
        let feed = Arc::new(TelemetryFeed::new());
        let writer = {
            let feed = Arc::clone(&feed);
            tokio::spawn(async move {
                for i in 0..100 {
                    feed.ingest(ping(&format!("p{:03}", i), "T1", "Gate"));
                    tokio::task::yield_now().await;
                }
            })
        };

        let (callback, mut rx) = collecting_callback();
        let _subscription = feed.subscribe("T1", callback);
        writer.await.unwrap();

        // The last ping lands either in the initial snapshot or in a change
        // notification; a delivery reflecting all of them must arrive.
        let complete = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                let snapshot = rx.recv().await.expect("delivery channel closed");
                if snapshot.len() == 100 {
                    break;
                }
            }
        })
        .await;
        assert!(complete.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery_and_is_idempotent() {
        let feed = TelemetryFeed::new();
        let (callback, mut rx) = collecting_callback();
        let subscription = feed.subscribe("T1", callback);
        let _ = rx.recv().await;

        subscription.cancel();
        subscription.cancel();
        assert_eq!(feed.subscription_count(), 0);

        feed.ingest(ping("p1", "T1", "Gate A"));
        // Sender side is gone, so the channel drains and closes
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscriptions_are_independent() {
        let feed = TelemetryFeed::new();
        let (cb_a, mut rx_a) = collecting_callback();
        let (cb_b, mut rx_b) = collecting_callback();
        let sub_a = feed.subscribe("T1", cb_a);
        let _sub_b = feed.subscribe("T1", cb_b);
        let _ = rx_a.recv().await;
        let _ = rx_b.recv().await;

        sub_a.cancel();
        feed.ingest(ping("p1", "T1", "Gate A"));

        assert!(rx_a.recv().await.is_none());
        assert_eq!(rx_b.recv().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tags_do_not_cross_contaminate() {
        let feed = TelemetryFeed::new();
        feed.ingest(ping("p1", "T1", "Gate A"));
        feed.ingest(ping("p2", "T2", "Gate B"));
        assert_eq!(feed.snapshot("T1").len(), 1);
        assert_eq!(feed.snapshot("T2").len(), 1);
        assert!(feed.snapshot("T3").is_empty());
    }
}
