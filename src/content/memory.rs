//! In-memory content store for dev mode and tests

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::{content_address, ContentStore};
use crate::types::{Result, TraceError};

/// Content store backed by a process-local map
pub struct MemoryContentStore {
    blobs: DashMap<String, Bytes>,
    gateway_url: String,
}

impl MemoryContentStore {
    pub fn new(gateway_url: &str) -> Self {
        Self {
            blobs: DashMap::new(),
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
        }
    }

    /// Number of distinct blobs held
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, bytes: Bytes) -> Result<String> {
        let hash = content_address(&bytes);
        // Identical content maps to the identical key; re-puts are no-ops
        self.blobs.entry(hash.clone()).or_insert(bytes);
        Ok(hash)
    }

    async fn get(&self, hash: &str) -> Result<Bytes> {
        self.blobs
            .get(hash)
            .map(|b| b.clone())
            .ok_or_else(|| TraceError::NotFound(format!("content {}", hash)))
    }

    async fn release(&self, hash: &str) -> Result<()> {
        self.blobs.remove(hash);
        Ok(())
    }

    fn locator_for(&self, hash: &str) -> String {
        format!("{}/store/{}", self.gateway_url, hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_is_referentially_transparent() {
        let store = MemoryContentStore::new("http://localhost:8080");
        let h1 = store.put(Bytes::from_static(b"image bytes")).await.unwrap();
        let h2 = store.put(Bytes::from_static(b"image bytes")).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.len(), 1);

        let fetched = store.get(&h1).await.unwrap();
        assert_eq!(fetched.as_ref(), b"image bytes");
    }

    #[tokio::test]
    async fn test_get_unknown_hash_is_not_found() {
        let store = MemoryContentStore::new("http://localhost:8080");
        let err = store.get("bafkreimissing").await.unwrap_err();
        assert!(matches!(err, TraceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_release_removes_blob() {
        let store = MemoryContentStore::new("http://localhost:8080");
        let hash = store.put(Bytes::from_static(b"ephemeral")).await.unwrap();
        store.release(&hash).await.unwrap();
        assert!(store.get(&hash).await.is_err());
        // Releasing again is harmless
        store.release(&hash).await.unwrap();
    }

    #[test]
    fn test_locator_is_pure_and_stable() {
        let store = MemoryContentStore::new("http://localhost:8080/");
        assert_eq!(
            store.locator_for("bafkabc"),
            "http://localhost:8080/store/bafkabc"
        );
        assert_eq!(store.locator_for("bafkabc"), store.locator_for("bafkabc"));
    }
}
