//! Replicated document content.
//!
//! The engine treats replicas as opaque: it creates them, applies binary
//! updates received from the remote, and extracts binary snapshots to send
//! back. Merge semantics belong to the replica implementation.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update};

/// Store of in-memory replica handles keyed by document id.
pub trait ReplicaStore: Send + Sync {
    /// Returns the handle for `id`, creating an empty one if needed.
    /// Returns true if it was created.
    fn get_or_create(&self, id: &str) -> bool;

    /// Returns true if a handle for `id` is loaded.
    fn contains(&self, id: &str) -> bool;

    /// Merges a binary update into the replica, creating it if needed.
    /// Applying the same update twice is harmless.
    fn apply_remote_update(&self, id: &str, update: &[u8]) -> SyncResult<()>;

    /// Encodes the full replica state, or `None` if it is not loaded.
    fn extract_snapshot(&self, id: &str) -> Option<Vec<u8>>;

    /// Renders the replica's text content.
    fn content(&self, id: &str) -> Option<String>;

    /// Inserts text at a character index (clamped to the end).
    fn insert_text(&self, id: &str, index: u32, text: &str) -> SyncResult<()>;

    /// Drops the in-memory handle. Returns true if it existed.
    fn destroy(&self, id: &str) -> bool;
}

/// Name of the shared text inside each document.
const CONTENT_TEXT: &str = "content";

/// [`ReplicaStore`] backed by `yrs` documents.
#[derive(Default)]
pub struct YrsReplicaStore {
    docs: RwLock<HashMap<String, Doc>>,
}

impl YrsReplicaStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of loaded replicas.
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    /// Returns true if no replica is loaded.
    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    fn doc(&self, id: &str) -> Option<Doc> {
        self.docs.read().get(id).cloned()
    }

    fn doc_or_create(&self, id: &str) -> Doc {
        self.docs
            .write()
            .entry(id.to_string())
            .or_insert_with(Doc::new)
            .clone()
    }
}

impl ReplicaStore for YrsReplicaStore {
    fn get_or_create(&self, id: &str) -> bool {
        let mut docs = self.docs.write();
        if docs.contains_key(id) {
            return false;
        }
        docs.insert(id.to_string(), Doc::new());
        true
    }

    fn contains(&self, id: &str) -> bool {
        self.docs.read().contains_key(id)
    }

    fn apply_remote_update(&self, id: &str, update: &[u8]) -> SyncResult<()> {
        let doc = self.doc_or_create(id);
        let decoded = Update::decode_v1(update)
            .map_err(|e| SyncError::Replica(format!("failed to decode update for {id}: {e}")))?;
        let mut txn = doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| SyncError::Replica(format!("failed to apply update for {id}: {e}")))
    }

    fn extract_snapshot(&self, id: &str) -> Option<Vec<u8>> {
        let doc = self.doc(id)?;
        let txn = doc.transact();
        Some(txn.encode_state_as_update_v1(&Default::default()))
    }

    fn content(&self, id: &str) -> Option<String> {
        let doc = self.doc(id)?;
        let text = doc.get_or_insert_text(CONTENT_TEXT);
        let txn = doc.transact();
        Some(text.get_string(&txn))
    }

    fn insert_text(&self, id: &str, index: u32, value: &str) -> SyncResult<()> {
        let doc = self.doc_or_create(id);
        let text = doc.get_or_insert_text(CONTENT_TEXT);
        let mut txn = doc.transact_mut();
        let index = index.min(text.len(&txn));
        text.insert(&mut txn, index, value);
        Ok(())
    }

    fn destroy(&self, id: &str) -> bool {
        self.docs.write().remove(id).is_some()
    }
}

impl std::fmt::Debug for YrsReplicaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YrsReplicaStore")
            .field("loaded", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_idempotent() {
        let store = YrsReplicaStore::new();
        assert!(store.get_or_create("a"));
        assert!(!store.get_or_create("a"));
        assert_eq!(store.content("a").as_deref(), Some(""));
        assert!(store.destroy("a"));
        assert!(!store.contains("a"));
        assert_eq!(store.extract_snapshot("a"), None);
    }

    #[test]
    fn snapshot_roundtrip_between_stores() {
        let local = YrsReplicaStore::new();
        local.insert_text("d", 0, "hello").unwrap();
        let snapshot = local.extract_snapshot("d").unwrap();

        let other = YrsReplicaStore::new();
        other.apply_remote_update("d", &snapshot).unwrap();
        assert_eq!(other.content("d").as_deref(), Some("hello"));

        other.apply_remote_update("d", &snapshot).unwrap();
        assert_eq!(other.content("d").as_deref(), Some("hello"));
    }

    #[test]
    fn concurrent_edits_merge() {
        let a = YrsReplicaStore::new();
        a.insert_text("d", 0, "base").unwrap();
        let base = a.extract_snapshot("d").unwrap();

        let b = YrsReplicaStore::new();
        b.apply_remote_update("d", &base).unwrap();

        a.insert_text("d", 4, " local").unwrap();
        b.insert_text("d", 0, "remote ").unwrap();

        a.apply_remote_update("d", &b.extract_snapshot("d").unwrap())
            .unwrap();
        b.apply_remote_update("d", &a.extract_snapshot("d").unwrap())
            .unwrap();

        let merged = a.content("d").unwrap();
        assert_eq!(merged, b.content("d").unwrap());
        assert!(merged.contains("remote "));
        assert!(merged.contains(" local"));
    }

    #[test]
    fn insert_index_is_clamped() {
        let store = YrsReplicaStore::new();
        store.insert_text("d", 0, "ab").unwrap();
        store.insert_text("d", 99, "c").unwrap();
        assert_eq!(store.content("d").as_deref(), Some("abc"));
    }

    #[test]
    fn garbage_update_is_rejected() {
        let store = YrsReplicaStore::new();
        let err = store.apply_remote_update("d", &[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, SyncError::Replica(_)));
    }
}
