//! Content-addressed media store
//!
//! Media identity is derived from content: CIDv1 with the raw codec over a
//! sha2-256 multihash, the IPFS-compatible form. Identical bytes always yield
//! the identical address, so puts are naturally deduplicating and a stored
//! hash doubles as an integrity check.

mod http;
mod memory;

pub use http::HttpContentStore;
pub use memory::MemoryContentStore;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};

use crate::types::Result;

/// Raw binary codec for CIDv1
const RAW_CODEC: u64 = 0x55;

/// Compute the content address for a byte string.
///
/// Deterministic: the only input is the content itself.
pub fn content_address(bytes: &[u8]) -> String {
    let hash = Code::Sha2_256.digest(bytes);
    Cid::new_v1(RAW_CODEC, hash).to_string()
}

/// Content store seam
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store bytes, returning their content address. Safe to call repeatedly
    /// with the same content.
    async fn put(&self, bytes: Bytes) -> Result<String>;

    /// Fetch bytes by content address. `NotFound` when the hash is unknown.
    async fn get(&self, hash: &str) -> Result<Bytes>;

    /// Drop one reference to stored content (delist path). Best effort; the
    /// backend decides whether the blob actually goes away.
    async fn release(&self, hash: &str) -> Result<()>;

    /// Build an externally resolvable locator for a hash. Pure, no I/O.
    fn locator_for(&self, hash: &str) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_address_deterministic() {
        let a = content_address(b"tomato crate 42");
        let b = content_address(b"tomato crate 42");
        assert_eq!(a, b);
    }

    #[test]
    fn test_content_address_differs_by_content() {
        assert_ne!(content_address(b"fresh"), content_address(b"rotten"));
    }

    #[test]
    fn test_content_address_is_cid_v1() {
        let addr = content_address(b"anything");
        let cid: Cid = addr.parse().unwrap();
        assert_eq!(cid.version(), cid::Version::V1);
        assert_eq!(cid.codec(), RAW_CODEC);
    }
}
