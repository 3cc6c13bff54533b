//! Record store trait and backends
//!
//! Appends go to the tail of the annotations array. Sequence numbers are
//! assigned atomically with the append itself, so the log stays gap-free and
//! no two annotations ever share a position.

use async_trait::async_trait;
use bson::doc;
use dashmap::DashMap;
use tracing::debug;

use super::mongo::{annotation_entry, MongoClient};
use super::{Annotation, NewAnnotation, ProductRecord};
use crate::types::{Result, TraceError};

/// Persistence seam for product records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a record. Fails with `AlreadyRegistered` when the product id
    /// is taken.
    async fn create(&self, record: ProductRecord) -> Result<()>;

    /// Fetch a record by product id
    async fn get(&self, product_id: &str) -> Result<Option<ProductRecord>>;

    /// Fetch a record by its bound tag
    async fn find_by_tag(&self, tag: &str) -> Result<Option<ProductRecord>>;

    /// Append one annotation at the tail, returning it with its assigned
    /// sequence number
    async fn append_annotation(
        &self,
        product_id: &str,
        annotation: NewAnnotation,
    ) -> Result<Annotation>;

    /// Remove a record. Only the registering farmer may delist; returns the
    /// media hashes the record referenced so the caller can release them.
    async fn delete(&self, product_id: &str, actor_id: &str) -> Result<Vec<String>>;
}

fn media_hashes(record: &ProductRecord) -> Vec<String> {
    record
        .annotations
        .iter()
        .filter_map(|a| a.media_hash.clone())
        .collect()
}

/// Record store over MongoDB
pub struct MongoRecordStore {
    client: MongoClient,
}

impl MongoRecordStore {
    pub fn new(client: MongoClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RecordStore for MongoRecordStore {
    async fn create(&self, record: ProductRecord) -> Result<()> {
        if self
            .client
            .find_product(doc! { "product_id": &record.product_id })
            .await?
            .is_some()
        {
            return Err(TraceError::AlreadyRegistered(record.product_id));
        }

        let product_id = record.product_id.clone();
        self.client.insert_product(record.into()).await?;
        debug!(product_id = %product_id, "product record created");
        Ok(())
    }

    async fn get(&self, product_id: &str) -> Result<Option<ProductRecord>> {
        Ok(self
            .client
            .find_product(doc! { "product_id": product_id })
            .await?
            .map(Into::into))
    }

    async fn find_by_tag(&self, tag: &str) -> Result<Option<ProductRecord>> {
        Ok(self
            .client
            .find_product(doc! { "tag": tag })
            .await?
            .map(Into::into))
    }

    async fn append_annotation(
        &self,
        product_id: &str,
        annotation: NewAnnotation,
    ) -> Result<Annotation> {
        let actor_kind = bson::to_bson(&annotation.actor_kind)
            .map_err(|e| TraceError::Database(format!("annotation encode failed: {}", e)))?;
        let entry = annotation_entry(
            &annotation.actor_id,
            actor_kind,
            &annotation.location,
            &annotation.description,
            annotation.media_hash.as_deref(),
            bson::DateTime::now(),
        );

        // The server assigns seq inside the update, so the appended entry
        // comes back as the tail of the returned document
        let updated: ProductRecord = self
            .client
            .push_annotation(product_id, entry)
            .await?
            .ok_or_else(|| TraceError::NotFound(format!("record {}", product_id)))?
            .into();

        updated
            .annotations
            .last()
            .cloned()
            .ok_or_else(|| TraceError::Database("append returned an empty annotation log".into()))
    }

    async fn delete(&self, product_id: &str, actor_id: &str) -> Result<Vec<String>> {
        let existing: ProductRecord = self
            .client
            .find_product(doc! { "product_id": product_id })
            .await?
            .map(Into::into)
            .ok_or_else(|| TraceError::NotFound(format!("record {}", product_id)))?;

        if existing.farmer != actor_id {
            return Err(TraceError::NotOwner(format!(
                "{} does not own {}",
                actor_id, product_id
            )));
        }

        self.client.soft_delete_product(product_id).await?;
        Ok(media_hashes(&existing))
    }
}

/// In-memory record store for dev mode and tests
#[derive(Default)]
pub struct MemoryRecordStore {
    records: DashMap<String, ProductRecord>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, record: ProductRecord) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(record.product_id.clone()) {
            Entry::Occupied(_) => Err(TraceError::AlreadyRegistered(record.product_id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn get(&self, product_id: &str) -> Result<Option<ProductRecord>> {
        Ok(self.records.get(product_id).map(|r| r.clone()))
    }

    async fn find_by_tag(&self, tag: &str) -> Result<Option<ProductRecord>> {
        Ok(self
            .records
            .iter()
            .find(|r| r.tag == tag)
            .map(|r| r.clone()))
    }

    async fn append_annotation(
        &self,
        product_id: &str,
        annotation: NewAnnotation,
    ) -> Result<Annotation> {
        // The entry guard is held across seq assignment and the push
        let mut record = self
            .records
            .get_mut(product_id)
            .ok_or_else(|| TraceError::NotFound(format!("record {}", product_id)))?;

        let seq = record.annotations.len() as u32;
        let annotation = annotation.into_annotation(seq);
        record.annotations.push(annotation.clone());
        Ok(annotation)
    }

    async fn delete(&self, product_id: &str, actor_id: &str) -> Result<Vec<String>> {
        let owner_ok = {
            let record = self
                .records
                .get(product_id)
                .ok_or_else(|| TraceError::NotFound(format!("record {}", product_id)))?;
            record.farmer == actor_id
        };

        if !owner_ok {
            return Err(TraceError::NotOwner(format!(
                "{} does not own {}",
                actor_id, product_id
            )));
        }

        let (_, record) = self
            .records
            .remove(product_id)
            .ok_or_else(|| TraceError::NotFound(format!("record {}", product_id)))?;
        Ok(media_hashes(&record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActorRole;
    use chrono::Utc;

    fn record(product_id: &str, tag: &str, farmer: &str) -> ProductRecord {
        ProductRecord {
            product_id: product_id.to_string(),
            tag: tag.to_string(),
            name: "Mangoes".to_string(),
            product_type: "fruit".to_string(),
            origin: "Orchard 7".to_string(),
            harvest_date: Utc::now(),
            farmer: farmer.to_string(),
            annotations: Vec::new(),
        }
    }

    fn note(actor_id: &str, text: &str, media: Option<&str>) -> NewAnnotation {
        NewAnnotation {
            actor_id: actor_id.to_string(),
            actor_kind: ActorRole::Retailer,
            location: "Depot".to_string(),
            description: text.to_string(),
            media_hash: media.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_product_id() {
        let store = MemoryRecordStore::new();
        store.create(record("P1", "T1", "farmer-1")).await.unwrap();
        let err = store.create(record("P1", "T2", "farmer-2")).await.unwrap_err();
        assert!(matches!(err, TraceError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn test_annotations_get_sequential_positions() {
        let store = MemoryRecordStore::new();
        store.create(record("P1", "T1", "farmer-1")).await.unwrap();

        let a = store
            .append_annotation("P1", note("retailer-1", "received", None))
            .await
            .unwrap();
        let b = store
            .append_annotation("P1", note("retailer-1", "shelved", None))
            .await
            .unwrap();
        assert_eq!(a.seq, 0);
        assert_eq!(b.seq, 1);

        let fetched = store.get("P1").await.unwrap().unwrap();
        let seqs: Vec<u32> = fetched.annotations.iter().map(|x| x.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_never_share_a_seq() {
        use std::sync::Arc;

        let store = Arc::new(MemoryRecordStore::new());
        store.create(record("P1", "T1", "farmer-1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .append_annotation("P1", note("retailer-1", &format!("check {}", i), None))
                    .await
                    .unwrap()
                    .seq
            }));
        }

        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (0..16).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_find_by_tag() {
        let store = MemoryRecordStore::new();
        store.create(record("P1", "TAG-9", "farmer-1")).await.unwrap();
        let found = store.find_by_tag("TAG-9").await.unwrap().unwrap();
        assert_eq!(found.product_id, "P1");
        assert!(store.find_by_tag("TAG-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_requires_owner() {
        let store = MemoryRecordStore::new();
        store.create(record("P1", "T1", "farmer-1")).await.unwrap();

        let err = store.delete("P1", "retailer-1").await.unwrap_err();
        assert!(matches!(err, TraceError::NotOwner(_)));
        assert!(store.get("P1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_returns_referenced_media() {
        let store = MemoryRecordStore::new();
        store.create(record("P1", "T1", "farmer-1")).await.unwrap();
        store
            .append_annotation("P1", note("farmer-1", "harvest photo", Some("bafk1")))
            .await
            .unwrap();
        store
            .append_annotation("P1", note("farmer-1", "no photo", None))
            .await
            .unwrap();
        store
            .append_annotation("P1", note("farmer-1", "final photo", Some("bafk2")))
            .await
            .unwrap();

        let released = store.delete("P1", "farmer-1").await.unwrap();
        assert_eq!(released, vec!["bafk1".to_string(), "bafk2".to_string()]);
        assert!(store.get("P1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_unknown_record_is_not_found() {
        let store = MemoryRecordStore::new();
        let err = store.delete("P9", "farmer-1").await.unwrap_err();
        assert!(matches!(err, TraceError::NotFound(_)));
    }
}
