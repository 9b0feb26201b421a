//! Reference-counted registry of open documents.
//!
//! The first [`DocumentRegistry::acquire`] of a document creates its replica,
//! attaches the local adapter (hydrating persisted replica bytes) and, when
//! the environment allows network sync, a network adapter. The last
//! [`DocumentRegistry::release`] detaches both and evicts the in-memory
//! replica. Durable data is never touched by eviction.
//!
//! Writers of a document's durable replica bytes (local edits persisting
//! them, acknowledged pushes clearing them) serialize on
//! [`DocumentRegistry::lock_writes`].

use crate::environment::{EnvironmentClassifier, EnvironmentSnapshot};
use crate::error::SyncResult;
use crate::replica::ReplicaStore;
use crate::repository::Repository;
use docsync_protocol::{DocumentRecord, SyncStatus};
use docsync_storage::LocalStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Live network channel for an open document.
pub trait NetworkAdapter: Send + Sync {
    /// Starts live exchange for `id`.
    fn attach(&self, id: &str);

    /// Stops live exchange for `id`.
    fn detach(&self, id: &str);
}

/// Key under which a document's replica bytes are persisted.
pub fn replica_key(id: &str) -> String {
    format!("replica/{id}")
}

struct Entry {
    refcount: usize,
    status: SyncStatus,
    metadata: Arc<DocumentRecord>,
    local_attached: bool,
    network_attached: bool,
}

/// Read-only view of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenDocument {
    /// Document id.
    pub id: String,
    /// Outstanding acquisitions.
    pub refcount: usize,
    /// Cached sync status.
    pub status: SyncStatus,
    /// Whether the local adapter is attached.
    pub local_attached: bool,
    /// Whether the network adapter is attached.
    pub network_attached: bool,
}

/// The document registry.
pub struct DocumentRegistry {
    store: Arc<dyn LocalStore>,
    replicas: Arc<dyn ReplicaStore>,
    repository: Repository,
    environment: Arc<EnvironmentClassifier>,
    network: Option<Arc<dyn NetworkAdapter>>,
    entries: Mutex<HashMap<String, Entry>>,
    writers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DocumentRegistry {
    /// Creates an empty registry without a network adapter.
    pub fn new(
        store: Arc<dyn LocalStore>,
        replicas: Arc<dyn ReplicaStore>,
        environment: Arc<EnvironmentClassifier>,
    ) -> Self {
        Self {
            repository: Repository::new(store.clone()),
            store,
            replicas,
            environment,
            network: None,
            entries: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the adapter attached while the environment allows sync.
    pub fn with_network_adapter(mut self, adapter: Arc<dyn NetworkAdapter>) -> Self {
        self.network = Some(adapter);
        self
    }

    /// The replica store handles are created in.
    pub fn replicas(&self) -> &Arc<dyn ReplicaStore> {
        &self.replicas
    }

    /// Opens a document, returning its current metadata.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::UnknownEntity`] if no record exists, or a
    /// storage or replica error if hydration fails.
    pub async fn acquire(&self, id: &str) -> SyncResult<Arc<DocumentRecord>> {
        if let Some(metadata) = self.bump(id) {
            return Ok(metadata);
        }

        let record = self.repository.require_document(id).await?;
        let persisted = self.store.read(&replica_key(id)).await?;

        let (metadata, network_attached) = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(id) {
                entry.refcount += 1;
                return Ok(entry.metadata.clone());
            }

            self.replicas.get_or_create(id);
            if let Some(snapshot) = &record.snapshot_cache {
                self.replicas.apply_remote_update(id, snapshot)?;
            }
            if let Some(bytes) = &persisted {
                self.replicas.apply_remote_update(id, bytes)?;
            }

            let network_attached = self.network.is_some() && self.environment.can_sync();
            let metadata = Arc::new(record);
            entries.insert(
                id.to_string(),
                Entry {
                    refcount: 1,
                    status: metadata.meta.status(),
                    metadata: metadata.clone(),
                    local_attached: true,
                    network_attached,
                },
            );
            (metadata, network_attached)
        };

        if network_attached {
            if let Some(network) = &self.network {
                network.attach(id);
            }
        }
        debug!(id, hydrated = persisted.is_some(), "document opened");
        Ok(metadata)
    }

    fn bump(&self, id: &str) -> Option<Arc<DocumentRecord>> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(id)?;
        entry.refcount += 1;
        trace!(id, refcount = entry.refcount, "document acquired");
        Some(entry.metadata.clone())
    }

    /// Releases one acquisition. Returns true if the document was evicted.
    pub fn release(&self, id: &str) -> bool {
        let evicted = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(id) else {
                warn!(id, "release of a document that is not open");
                return false;
            };
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount > 0 {
                return false;
            }
            entries.remove(id)
        };

        if let Some(entry) = evicted {
            if entry.network_attached {
                if let Some(network) = &self.network {
                    network.detach(id);
                }
            }
            self.replicas.destroy(id);
            debug!(id, "document evicted");
        }
        true
    }

    /// Waits for exclusive write access to a document's durable state.
    pub async fn lock_writes(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self.writers.lock().entry(id.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    /// Writes the replica's current state to the local store.
    pub async fn persist(&self, id: &str) -> SyncResult<bool> {
        let Some(bytes) = self.replicas.extract_snapshot(id) else {
            return Ok(false);
        };
        self.store.write(&replica_key(id), &bytes).await?;
        Ok(true)
    }

    /// Deletes the persisted replica bytes. The in-memory handle is kept.
    pub async fn clear_persistence(&self, id: &str) -> SyncResult<bool> {
        Ok(self.store.delete(&replica_key(id)).await?)
    }

    /// Updates the cached status of an open document.
    pub fn set_status(&self, id: &str, status: SyncStatus) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.status = status;
        }
    }

    /// Replaces the cached metadata of an open document.
    pub fn update_metadata(&self, record: &DocumentRecord) {
        if let Some(entry) = self.entries.lock().get_mut(&record.id) {
            entry.status = record.meta.status();
            entry.metadata = Arc::new(record.clone());
        }
    }

    /// Cached status of an open document.
    pub fn status(&self, id: &str) -> Option<SyncStatus> {
        self.entries.lock().get(id).map(|entry| entry.status)
    }

    /// Cached metadata of an open document.
    pub fn metadata(&self, id: &str) -> Option<Arc<DocumentRecord>> {
        self.entries.lock().get(id).map(|entry| entry.metadata.clone())
    }

    /// Outstanding acquisitions of a document.
    pub fn refcount(&self, id: &str) -> usize {
        self.entries.lock().get(id).map_or(0, |entry| entry.refcount)
    }

    /// Ids of all open documents.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.entries.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Views of all open documents, ordered by id.
    pub fn open_documents(&self) -> Vec<OpenDocument> {
        let mut out: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(id, entry)| OpenDocument {
                id: id.clone(),
                refcount: entry.refcount,
                status: entry.status,
                local_attached: entry.local_attached,
                network_attached: entry.network_attached,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Re-evaluates the network adapter of every open document.
    pub fn on_environment_change(&self, snapshot: EnvironmentSnapshot) {
        let Some(network) = &self.network else {
            return;
        };
        let wanted = snapshot.can_sync();
        let changed: Vec<String> = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .filter(|(_, entry)| entry.network_attached != wanted)
                .map(|(id, entry)| {
                    entry.network_attached = wanted;
                    id.clone()
                })
                .collect()
        };
        for id in &changed {
            if wanted {
                network.attach(id);
            } else {
                network.detach(id);
            }
        }
        if !changed.is_empty() {
            debug!(count = changed.len(), attached = wanted, "network adapters updated");
        }
    }

    /// Spawns a task that applies environment changes until the classifier
    /// is dropped.
    pub fn spawn_environment_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut rx = self.environment.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = *rx.borrow_and_update();
                registry.on_environment_change(snapshot);
            }
        })
    }
}

impl std::fmt::Debug for DocumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRegistry")
            .field("open", &self.entries.lock().len())
            .field("network", &self.network.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{Platform, StaticAuth};
    use crate::replica::YrsReplicaStore;
    use docsync_storage::InMemoryStore;

    #[derive(Default)]
    struct RecordingAdapter {
        events: Mutex<Vec<(String, bool)>>,
    }

    impl RecordingAdapter {
        fn events(&self) -> Vec<(String, bool)> {
            self.events.lock().clone()
        }
    }

    impl NetworkAdapter for RecordingAdapter {
        fn attach(&self, id: &str) {
            self.events.lock().push((id.to_string(), true));
        }

        fn detach(&self, id: &str) {
            self.events.lock().push((id.to_string(), false));
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        replicas: Arc<YrsReplicaStore>,
        env: Arc<EnvironmentClassifier>,
        adapter: Arc<RecordingAdapter>,
        registry: Arc<DocumentRegistry>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let replicas = Arc::new(YrsReplicaStore::new());
        let env = Arc::new(EnvironmentClassifier::with_platform(
            Arc::new(StaticAuth::new(Some("token".into()))),
            Platform::Desktop,
        ));
        let adapter = Arc::new(RecordingAdapter::default());
        let registry = Arc::new(
            DocumentRegistry::new(store.clone(), replicas.clone(), env.clone())
                .with_network_adapter(adapter.clone()),
        );
        Fixture {
            store,
            replicas,
            env,
            adapter,
            registry,
        }
    }

    async fn seed(store: &Arc<InMemoryStore>) -> DocumentRecord {
        let doc = DocumentRecord::new("ws", "Doc");
        Repository::new(store.clone())
            .put_document(&doc)
            .await
            .unwrap();
        doc
    }

    #[tokio::test]
    async fn refcount_and_eviction() {
        let fx = fixture();
        let doc = seed(&fx.store).await;

        fx.registry.acquire(&doc.id).await.unwrap();
        fx.registry.acquire(&doc.id).await.unwrap();
        assert_eq!(fx.registry.refcount(&doc.id), 2);
        assert!(fx.replicas.contains(&doc.id));

        assert!(!fx.registry.release(&doc.id));
        assert!(fx.replicas.contains(&doc.id));
        assert!(fx.registry.release(&doc.id));
        assert!(!fx.replicas.contains(&doc.id));
        assert!(fx.registry.active_ids().is_empty());
        assert!(!fx.registry.release(&doc.id));
    }

    #[tokio::test]
    async fn unknown_document_fails() {
        let fx = fixture();
        assert!(fx.registry.acquire("missing").await.is_err());
        assert!(fx.registry.active_ids().is_empty());
    }

    #[tokio::test]
    async fn persisted_bytes_rehydrate() {
        let fx = fixture();
        let doc = seed(&fx.store).await;

        fx.registry.acquire(&doc.id).await.unwrap();
        fx.replicas.insert_text(&doc.id, 0, "draft").unwrap();
        assert!(fx.registry.persist(&doc.id).await.unwrap());
        fx.registry.release(&doc.id);

        fx.registry.acquire(&doc.id).await.unwrap();
        assert_eq!(fx.replicas.content(&doc.id).as_deref(), Some("draft"));

        assert!(fx.registry.clear_persistence(&doc.id).await.unwrap());
        assert!(fx.replicas.contains(&doc.id));
    }

    #[tokio::test]
    async fn network_adapter_follows_environment() {
        let fx = fixture();
        let doc = seed(&fx.store).await;

        fx.registry.acquire(&doc.id).await.unwrap();
        assert!(fx.adapter.events().is_empty());

        fx.env.set_online(true);
        fx.registry.on_environment_change(fx.env.snapshot());
        assert_eq!(fx.adapter.events(), vec![(doc.id.clone(), true)]);
        assert!(fx.registry.open_documents()[0].network_attached);

        fx.registry.release(&doc.id);
        assert_eq!(
            fx.adapter.events(),
            vec![(doc.id.clone(), true), (doc.id.clone(), false)]
        );
    }

    #[tokio::test]
    async fn watcher_applies_changes() {
        let fx = fixture();
        let doc = seed(&fx.store).await;
        fx.registry.acquire(&doc.id).await.unwrap();
        let watcher = fx.registry.spawn_environment_watcher();

        fx.env.set_online(true);
        for _ in 0..50 {
            if !fx.adapter.events().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(fx.adapter.events(), vec![(doc.id.clone(), true)]);
        watcher.abort();
    }

    #[tokio::test]
    async fn metadata_is_replaced() {
        let fx = fixture();
        let doc = seed(&fx.store).await;
        let before = fx.registry.acquire(&doc.id).await.unwrap();

        let mut changed = doc.clone();
        changed.meta.mark_synced("r", 1, chrono::Utc::now());
        fx.registry.update_metadata(&changed);

        assert_eq!(before.meta.status(), SyncStatus::Local);
        assert_eq!(fx.registry.status(&doc.id), Some(SyncStatus::Synced));
        assert_eq!(
            fx.registry.metadata(&doc.id).unwrap().meta.cloud_id(),
            Some("r")
        );
    }
}
