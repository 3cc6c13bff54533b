//! Fieldtrace - provenance reconciliation gateway for produce tracking
//!
//! Fieldtrace fuses three differently-trusted data sources into one
//! chronologically ordered journey per RFID tag:
//!
//! - **Ledger**: append-only lifecycle stages (registration, handling, delivery)
//! - **Record**: farmer/retailer-authored annotations in MongoDB
//! - **Telemetry**: live location pings from field sensors via NATS
//!
//! ## Services
//!
//! - **LifecycleLedger**: stage state machine over the ledger node
//! - **ContentStore**: content-addressed media (CIDv1, sha2-256)
//! - **FreshnessInference**: external classifier wrapper with degrade-to-default
//! - **ProvenanceRecord**: append-only annotation log per product
//! - **LiveTelemetryFeed**: snapshot-on-change ping subscriptions
//! - **JourneyReconciler**: merge/sort/dedup into one timeline

pub mod config;
pub mod content;
pub mod freshness;
pub mod journey;
pub mod ledger;
pub mod nats;
pub mod record;
pub mod server;
pub mod services;
pub mod telemetry;
pub mod types;

pub use config::Args;
pub use server::AppState;
pub use types::{Result, TraceError};
