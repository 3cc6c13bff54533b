//! MongoDB document schemas for product records
//!
//! BSON-facing shapes with index definitions and soft-delete metadata;
//! conversions to the domain types live alongside.

use bson::{doc, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use super::mongo::{IntoIndexes, MutMetadata};
use super::{Annotation, ProductRecord};
use crate::types::ActorRole;

/// Common metadata for all documents
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Metadata {
    /// Whether this document has been soft-deleted
    #[serde(default)]
    pub is_deleted: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime>,
}

/// One annotation as stored inside a product document
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AnnotationDocument {
    pub seq: u32,
    pub actor_id: String,
    pub actor_kind: ActorRole,
    pub location: String,
    pub recorded_at: DateTime,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_hash: Option<String>,
}

/// Product record document, one per registered product
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ProductDocument {
    pub product_id: String,
    pub tag: String,
    pub name: String,
    pub product_type: String,
    pub origin: String,
    pub harvest_date: Option<DateTime>,
    pub farmer: String,
    #[serde(default)]
    pub annotations: Vec<AnnotationDocument>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl IntoIndexes for ProductDocument {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "product_id": 1 },
                Some(IndexOptions::builder().unique(true).build()),
            ),
            (doc! { "tag": 1 }, None),
        ]
    }
}

impl MutMetadata for ProductDocument {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

impl From<Annotation> for AnnotationDocument {
    fn from(a: Annotation) -> Self {
        Self {
            seq: a.seq,
            actor_id: a.actor_id,
            actor_kind: a.actor_kind,
            location: a.location,
            recorded_at: DateTime::from_chrono(a.recorded_at),
            description: a.description,
            media_hash: a.media_hash,
        }
    }
}

impl From<AnnotationDocument> for Annotation {
    fn from(d: AnnotationDocument) -> Self {
        Self {
            seq: d.seq,
            actor_id: d.actor_id,
            actor_kind: d.actor_kind,
            location: d.location,
            recorded_at: d.recorded_at.to_chrono(),
            description: d.description,
            media_hash: d.media_hash,
        }
    }
}

impl From<ProductRecord> for ProductDocument {
    fn from(r: ProductRecord) -> Self {
        Self {
            product_id: r.product_id,
            tag: r.tag,
            name: r.name,
            product_type: r.product_type,
            origin: r.origin,
            harvest_date: Some(DateTime::from_chrono(r.harvest_date)),
            farmer: r.farmer,
            annotations: r.annotations.into_iter().map(Into::into).collect(),
            metadata: Metadata::default(),
        }
    }
}

impl From<ProductDocument> for ProductRecord {
    fn from(d: ProductDocument) -> Self {
        Self {
            product_id: d.product_id,
            tag: d.tag,
            name: d.name,
            product_type: d.product_type,
            origin: d.origin,
            harvest_date: d
                .harvest_date
                .map(|t| t.to_chrono())
                .unwrap_or_else(chrono::Utc::now),
            farmer: d.farmer,
            annotations: d.annotations.into_iter().map(Into::into).collect(),
        }
    }
}
