//! Local store trait definition.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;

/// Summary of a store's contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    /// Backend name.
    pub backend: &'static str,
    /// Number of keys.
    pub entries: usize,
    /// Total size of all values in bytes.
    pub bytes: u64,
}

/// A durable key-value store.
///
/// # Invariants
///
/// - `read` returns exactly the bytes of the last `write` for that key
/// - `write` replaces the whole value; a reader never observes a partial value
/// - `delete` of a missing key is not an error
/// - `list` returns keys in ascending order
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Prepares the store for use. Idempotent.
    async fn init(&self) -> StorageResult<()>;

    /// Reads the value stored under `key`, if any.
    async fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn write(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes `key`. Returns true if it existed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Lists all keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Returns true if `key` holds a value.
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.read(key).await?.is_some())
    }

    /// Removes every key.
    async fn clear(&self) -> StorageResult<()>;

    /// Returns a summary of the store.
    async fn info(&self) -> StorageResult<StoreInfo>;
}

/// Checks that `key` is usable by every backend.
///
/// Keys are `/`-separated; segments must be non-empty and must not start
/// with a dot.
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] describing the first violation.
pub fn validate_key(key: &str) -> StorageResult<()> {
    let reject = |reason| {
        Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason,
        })
    };

    if key.is_empty() {
        return reject("empty key");
    }
    if key.contains('\\') || key.contains('\0') {
        return reject("forbidden character");
    }
    for segment in key.split('/') {
        if segment.is_empty() {
            return reject("empty segment");
        }
        if segment.starts_with('.') {
            return reject("segment starts with '.'");
        }
    }
    Ok(())
}
