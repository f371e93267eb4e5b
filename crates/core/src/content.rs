//! Content store: immutable blobs addressed by their SHA-256.
//!
//! The store is an external collaborator; the core only needs `put`, `get`
//! and `contains`. [`MemoryContentStore`] is the bundled implementation used
//! by tests and embedded deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::errors::StorageError;
use crate::locking;
use crate::models::ContentHash;

/// Blob storage keyed by content hash.
///
/// Implementations own their own timeout/retry policy; failures are reported
/// as [`StorageError::Unavailable`] and never retried by the core.
pub trait ContentStore: Send + Sync {
    /// Store `bytes` and return their content hash. Storing the same bytes
    /// twice is a no-op.
    fn put(&self, bytes: &[u8]) -> Result<ContentHash, StorageError>;

    /// Fetch the bytes for `hash`.
    fn get(&self, hash: &ContentHash) -> Result<Vec<u8>, StorageError>;

    /// Whether the store holds `hash`.
    fn contains(&self, hash: &ContentHash) -> Result<bool, StorageError>;

    /// Size in bytes of the blob for `hash`.
    fn size(&self, hash: &ContentHash) -> Result<u64, StorageError> {
        self.get(hash).map(|bytes| bytes.len() as u64)
    }
}

/// Thread-safe in-memory content store.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    blobs: RwLock<HashMap<ContentHash, Arc<[u8]>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held.
    pub fn len(&self) -> usize {
        locking::read(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentStore for MemoryContentStore {
    fn put(&self, bytes: &[u8]) -> Result<ContentHash, StorageError> {
        let hash = ContentHash::of(bytes);
        let mut blobs = locking::write(&self.blobs);
        if !blobs.contains_key(&hash) {
            debug!(hash = %hash.short(), size = bytes.len(), "storing blob");
            blobs.insert(hash.clone(), Arc::from(bytes));
        }
        Ok(hash)
    }

    fn get(&self, hash: &ContentHash) -> Result<Vec<u8>, StorageError> {
        locking::read(&self.blobs)
            .get(hash)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| StorageError::BlobMissing(hash.clone()))
    }

    fn contains(&self, hash: &ContentHash) -> Result<bool, StorageError> {
        Ok(locking::read(&self.blobs).contains_key(hash))
    }

    fn size(&self, hash: &ContentHash) -> Result<u64, StorageError> {
        locking::read(&self.blobs)
            .get(hash)
            .map(|bytes| bytes.len() as u64)
            .ok_or_else(|| StorageError::BlobMissing(hash.clone()))
    }
}
