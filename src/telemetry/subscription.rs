//! Snapshot subscription registry
//!
//! Thread-safe registry of active subscriptions, indexed by tag and a
//! per-subscription id. Each subscription gets its own forwarding task so a
//! slow callback never blocks ingestion or other subscribers; deliveries to
//! one subscriber stay in order.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::TelemetryPing;

/// Callback invoked with the full snapshot on every change
pub type SnapshotCallback = Arc<dyn Fn(Vec<TelemetryPing>) + Send + Sync>;

struct Listener {
    tx: mpsc::UnboundedSender<Vec<TelemetryPing>>,
}

/// Registry of active snapshot subscriptions
#[derive(Default)]
pub struct SubscriptionRegistry {
    /// Active listeners indexed by (tag, subscription id)
    listeners: DashMap<(String, Uuid), Listener>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current subscription count
    pub fn subscription_count(&self) -> usize {
        self.listeners.len()
    }

    /// Register a callback for a tag, delivering `initial` right away
    pub fn register(
        self: Arc<Self>,
        tag: &str,
        callback: SnapshotCallback,
        initial: Vec<TelemetryPing>,
    ) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<TelemetryPing>>();

        // The task ends when the registry drops the sender
        tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                callback(snapshot);
            }
        });

        // Listener goes in before the initial send; the caller serializes
        // registration with snapshot updates, so no change can slip between
        // the two.
        self.listeners
            .insert((tag.to_string(), id), Listener { tx: tx.clone() });
        let _ = tx.send(initial);
        debug!(tag = %tag, id = %id, "telemetry subscription registered");

        Subscription {
            tag: tag.to_string(),
            id,
            registry: self,
        }
    }

    /// Push a snapshot to every listener on the tag
    pub fn notify(&self, tag: &str, snapshot: &[TelemetryPing]) {
        self.listeners.retain(|(listener_tag, _), listener| {
            if listener_tag != tag {
                return true;
            }
            // A failed send means the forwarding task is gone
            listener.tx.send(snapshot.to_vec()).is_ok()
        });
    }

    fn remove(&self, tag: &str, id: Uuid) {
        if self.listeners.remove(&(tag.to_string(), id)).is_some() {
            debug!(tag = %tag, id = %id, "telemetry subscription cancelled");
        }
    }
}

/// Handle for one active subscription
pub struct Subscription {
    tag: String,
    id: Uuid,
    registry: Arc<SubscriptionRegistry>,
}

impl Subscription {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Stop delivery. Calling this more than once is harmless.
    pub fn cancel(&self) {
        self.registry.remove(&self.tag, self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
