//! MongoDB access for the product record collection
//!
//! One collection, soft deletes, indexes applied at connect time. Annotation
//! appends run as a single server-side pipeline update so sequence numbers
//! stay unique under concurrent writers.

use bson::{doc, Bson, DateTime, Document};
use mongodb::{
    options::{IndexOptions, ReturnDocument},
    Client, Collection, IndexModel,
};
use tracing::info;

use super::schema::{Metadata, ProductDocument};
use crate::types::{Result, TraceError};

const PRODUCTS_COLLECTION: &str = "products";

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// Trait for schemas with mutable metadata
pub trait MutMetadata {
    fn mut_metadata(&mut self) -> &mut Metadata;
}

/// Handle to the product record collection
#[derive(Clone)]
pub struct MongoClient {
    products: Collection<ProductDocument>,
}

impl MongoClient {
    /// Connect, verify with a ping, and apply the schema indexes
    pub async fn new(uri: &str, db_name: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // Bounded server selection so an unreachable MongoDB fails fast
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| TraceError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        let db = client.database(db_name);
        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| TraceError::Database(format!("MongoDB ping failed: {}", e)))?;

        let products = db.collection::<ProductDocument>(PRODUCTS_COLLECTION);
        let indices: Vec<IndexModel> = ProductDocument::into_indices()
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();
        products
            .create_indexes(indices)
            .await
            .map_err(|e| TraceError::Database(format!("Failed to create indexes: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);
        Ok(Self { products })
    }

    /// Insert a product document, stamping its metadata
    pub async fn insert_product(&self, mut product: ProductDocument) -> Result<()> {
        let metadata = product.mut_metadata();
        metadata.is_deleted = false;
        metadata.created_at = Some(DateTime::now());
        metadata.updated_at = Some(DateTime::now());

        self.products
            .insert_one(product)
            .await
            .map_err(|e| TraceError::Database(format!("Insert failed: {}", e)))?;
        Ok(())
    }

    /// Find one live product matching the filter
    pub async fn find_product(&self, filter: Document) -> Result<Option<ProductDocument>> {
        self.products
            .find_one(live(filter))
            .await
            .map_err(|e| TraceError::Database(format!("Find failed: {}", e)))
    }

    /// Append an annotation entry in one server-side update. The entry's
    /// `seq` is computed from the array size inside the pipeline, so two
    /// concurrent appends can never claim the same position. Returns the
    /// document as it stands after this append, or `None` when no live
    /// product matched.
    pub async fn push_annotation(
        &self,
        product_id: &str,
        entry: Document,
    ) -> Result<Option<ProductDocument>> {
        let appended = doc! {
            "$concatArrays": [
                { "$ifNull": ["$annotations", []] },
                [entry],
            ]
        };
        let pipeline = vec![doc! {
            "$set": {
                "annotations": appended,
                "metadata": {
                    "$mergeObjects": ["$metadata", { "updated_at": "$$NOW" }]
                },
            }
        }];

        self.products
            .find_one_and_update(live(doc! { "product_id": product_id }), pipeline)
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| TraceError::Database(format!("Annotation append failed: {}", e)))
    }

    /// Soft-delete one live product
    pub async fn soft_delete_product(&self, product_id: &str) -> Result<()> {
        let update = doc! {
            "$set": {
                "metadata.is_deleted": true,
                "metadata.deleted_at": DateTime::now(),
                "metadata.updated_at": DateTime::now(),
            }
        };
        self.products
            .update_one(live(doc! { "product_id": product_id }), update)
            .await
            .map_err(|e| TraceError::Database(format!("Delete failed: {}", e)))?;
        Ok(())
    }
}

/// Scope a filter to documents that have not been soft-deleted
fn live(mut filter: Document) -> Document {
    filter.insert("metadata.is_deleted", doc! { "$ne": true });
    filter
}

/// Build the pipeline-side annotation entry. `seq` is the only computed
/// field; user-supplied strings ride in `$literal` so content is never read
/// as an aggregation expression.
pub(super) fn annotation_entry(
    actor_id: &str,
    actor_kind: Bson,
    location: &str,
    description: &str,
    media_hash: Option<&str>,
    recorded_at: DateTime,
) -> Document {
    let media = match media_hash {
        Some(hash) => bson::bson!({ "$literal": hash }),
        None => Bson::Null,
    };

    doc! {
        "seq": { "$size": { "$ifNull": ["$annotations", []] } },
        "actor_id": { "$literal": actor_id },
        "actor_kind": { "$literal": actor_kind },
        "location": { "$literal": location },
        "recorded_at": recorded_at,
        "description": { "$literal": description },
        "media_hash": media,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActorRole;

    #[test]
    fn test_annotation_entry_computes_seq_server_side() {
        let entry = annotation_entry(
            "farmer-1",
            bson::to_bson(&ActorRole::Farmer).unwrap(),
            "Depot",
            "$annotations",
            Some("bafk1"),
            DateTime::now(),
        );

        assert_eq!(
            entry.get_document("seq").unwrap(),
            &doc! { "$size": { "$ifNull": ["$annotations", []] } }
        );
        // User content stays literal even when it looks like a field path
        assert_eq!(
            entry.get_document("description").unwrap(),
            &doc! { "$literal": "$annotations" }
        );
        assert_eq!(
            entry.get_document("media_hash").unwrap(),
            &doc! { "$literal": "bafk1" }
        );
    }

    #[test]
    fn test_live_filter_excludes_soft_deleted() {
        let filter = live(doc! { "product_id": "P1" });
        assert_eq!(
            filter.get_document("metadata.is_deleted").unwrap(),
            &doc! { "$ne": true }
        );
    }
}
