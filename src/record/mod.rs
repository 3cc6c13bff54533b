//! Provenance record: the mutable-by-append annotation log
//!
//! One document per product, owned by the registering farmer, accumulating
//! harvest and verification annotations at the tail. Entries are never
//! reordered or edited; the whole record goes away only on explicit delist,
//! which also releases referenced media.

mod mongo;
mod schema;
mod store;

pub use mongo::{IntoIndexes, MongoClient, MutMetadata};
pub use schema::{AnnotationDocument, Metadata, ProductDocument};
pub use store::{MemoryRecordStore, MongoRecordStore, RecordStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ActorRole;

/// One annotation in a product's record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    /// Position in the record, assigned at append time
    pub seq: u32,
    pub actor_id: String,
    /// Actor category, recorded for trust tiering in the reconciler
    pub actor_kind: ActorRole,
    pub location: String,
    pub recorded_at: DateTime<Utc>,
    pub description: String,
    pub media_hash: Option<String>,
}

/// A product record with its annotation log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRecord {
    pub product_id: String,
    /// The physical tag this product is bound to
    pub tag: String,
    pub name: String,
    pub product_type: String,
    pub origin: String,
    pub harvest_date: DateTime<Utc>,
    /// Actor id of the registering farmer; ownership anchor for delist
    pub farmer: String,
    pub annotations: Vec<Annotation>,
}

/// Input for one appended annotation
#[derive(Debug, Clone)]
pub struct NewAnnotation {
    pub actor_id: String,
    pub actor_kind: ActorRole,
    pub location: String,
    pub description: String,
    pub media_hash: Option<String>,
}

impl NewAnnotation {
    /// Materialize at the given sequence position with the current time
    pub fn into_annotation(self, seq: u32) -> Annotation {
        Annotation {
            seq,
            actor_id: self.actor_id,
            actor_kind: self.actor_kind,
            location: self.location,
            recorded_at: Utc::now(),
            description: self.description,
            media_hash: self.media_hash,
        }
    }
}
