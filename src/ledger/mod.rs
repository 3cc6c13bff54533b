//! Lifecycle ledger: append-only, stage-ordered record of a tag's journey
//!
//! The ledger node is the external ordering authority: it assigns stage
//! indices and timestamps, serializes writers per tag, and never updates or
//! deletes a written stage. This module provides the wire client, the backend
//! seam, and the state-machine wrapper callers use.

mod backend;
mod client;
mod connection;
mod lifecycle;
mod types;

pub use backend::{LedgerBackend, MemoryLedger, SubmitOutcome};
pub use client::LedgerClient;
pub use connection::LedgerConnection;
pub use lifecycle::LifecycleLedger;
pub use types::{idempotency_key, LedgerStage, StageKind, StagePayload, StageRef};
