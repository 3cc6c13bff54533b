//! HTTP-backed content store
//!
//! Talks to the authoritative storage service over `{base}/store/{cid}`. The
//! client computes the CID locally before uploading; the backend verifies the
//! bytes against the address and rejects mismatches.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use super::{content_address, ContentStore};
use crate::types::{Result, TraceError};

/// Content store client over the storage service HTTP API
pub struct HttpContentStore {
    client: reqwest::Client,
    base_url: String,
    gateway_url: String,
}

impl HttpContentStore {
    /// Create a client for the given storage backend.
    ///
    /// `gateway_url` is this gateway's public base, used only for locators.
    pub fn new(base_url: &str, gateway_url: &str, request_timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms))
            .build()
            .map_err(|e| TraceError::Config(format!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
        })
    }

    fn blob_url(&self, hash: &str) -> String {
        format!("{}/store/{}", self.base_url, hash)
    }

    fn map_transport_error(err: reqwest::Error) -> TraceError {
        if err.is_timeout() {
            TraceError::Timeout(format!("content store: {}", err))
        } else {
            TraceError::StoreUnavailable(err.to_string())
        }
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn put(&self, bytes: Bytes) -> Result<String> {
        let hash = content_address(&bytes);
        debug!(hash = %hash, size = bytes.len(), "uploading blob");

        let response = self
            .client
            .put(self.blob_url(&hash))
            .body(bytes)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        // 409 from the backend means the blob already exists, which is the
        // dedup fast path, not a failure
        if response.status().is_success() || response.status() == StatusCode::CONFLICT {
            return Ok(hash);
        }

        Err(TraceError::StoreUnavailable(format!(
            "put {} returned {}",
            hash,
            response.status()
        )))
    }

    async fn get(&self, hash: &str) -> Result<Bytes> {
        let response = self
            .client
            .get(self.blob_url(hash))
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(TraceError::NotFound(format!("content {}", hash))),
            status if status.is_success() => response
                .bytes()
                .await
                .map_err(Self::map_transport_error),
            status => Err(TraceError::StoreUnavailable(format!(
                "get {} returned {}",
                hash, status
            ))),
        }
    }

    async fn release(&self, hash: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.blob_url(hash))
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        // An already-released blob is fine
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }

        Err(TraceError::StoreUnavailable(format!(
            "release {} returned {}",
            hash,
            response.status()
        )))
    }

    fn locator_for(&self, hash: &str) -> String {
        format!("{}/store/{}", self.gateway_url, hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_url_normalizes_trailing_slash() {
        let store =
            HttpContentStore::new("http://localhost:8091/", "http://localhost:8080", 5000)
                .unwrap();
        assert_eq!(
            store.blob_url("bafkabc"),
            "http://localhost:8091/store/bafkabc"
        );
    }

    #[test]
    fn test_locator_uses_gateway_base() {
        let store =
            HttpContentStore::new("http://storage:8091", "https://trace.example.com", 5000)
                .unwrap();
        assert_eq!(
            store.locator_for("bafkabc"),
            "https://trace.example.com/store/bafkabc"
        );
    }
}
