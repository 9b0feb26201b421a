//! Local → remote identifier mapping.
//!
//! One injective table per entity kind. Lookups are synchronous; writes
//! are serialized per table by an async mutex that also covers the
//! write-through to the local store, so the "is this remote id taken"
//! check and the insert happen as one step.

use crate::error::SyncResult;
use docsync_protocol::{from_cbor, to_cbor, EntityKind, IdentifierMapping, MappingOutcome};
use docsync_storage::LocalStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Default)]
struct MappingTable {
    rows: RwLock<HashMap<String, IdentifierMapping>>,
    write_gate: Mutex<()>,
}

impl MappingTable {
    fn owner_of(&self, remote_id: &str) -> Option<String> {
        self.rows
            .read()
            .values()
            .find(|row| row.remote_id == remote_id)
            .map(|row| row.local_id.clone())
    }

    fn sorted_rows(&self) -> Vec<IdentifierMapping> {
        let mut rows: Vec<_> = self.rows.read().values().cloned().collect();
        rows.sort_by(|a, b| a.local_id.cmp(&b.local_id));
        rows
    }
}

/// The identifier mapping service.
pub struct MappingService {
    store: Arc<dyn LocalStore>,
    workspaces: MappingTable,
    folders: MappingTable,
    documents: MappingTable,
}

impl MappingService {
    /// Creates an empty service. Call [`MappingService::load`] to restore
    /// persisted tables.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            workspaces: MappingTable::default(),
            folders: MappingTable::default(),
            documents: MappingTable::default(),
        }
    }

    fn table(&self, kind: EntityKind) -> &MappingTable {
        match kind {
            EntityKind::Workspace => &self.workspaces,
            EntityKind::Folder => &self.folders,
            EntityKind::Document => &self.documents,
        }
    }

    fn key(kind: EntityKind) -> String {
        format!("mappings/{}", kind.as_str())
    }

    /// Remote id mapped to `local_id`.
    pub fn resolve(&self, kind: EntityKind, local_id: &str) -> Option<String> {
        self.table(kind)
            .rows
            .read()
            .get(local_id)
            .map(|row| row.remote_id.clone())
    }

    /// Local id that owns `remote_id`.
    pub fn reverse(&self, kind: EntityKind, remote_id: &str) -> Option<String> {
        self.table(kind).owner_of(remote_id)
    }

    /// All rows of a table, ordered by local id.
    pub fn entries(&self, kind: EntityKind) -> Vec<IdentifierMapping> {
        self.table(kind).sorted_rows()
    }

    /// Records `local_id → remote_id`.
    ///
    /// Rejected, leaving the table unchanged, if `remote_id` already belongs
    /// to a different local id. Remapping a local id to a new remote id
    /// replaces its row.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be persisted; the in-memory
    /// table is rolled back in that case.
    pub async fn record(
        &self,
        kind: EntityKind,
        local_id: &str,
        remote_id: &str,
        display_name: &str,
    ) -> SyncResult<MappingOutcome> {
        let table = self.table(kind);
        let _gate = table.write_gate.lock().await;

        if let Some(existing) = table.owner_of(remote_id) {
            if existing == local_id {
                return Ok(MappingOutcome::Unchanged);
            }
            warn!(
                %kind,
                local_id,
                remote_id,
                existing_local_id = %existing,
                "mapping rejected, remote id already claimed"
            );
            return Ok(MappingOutcome::Rejected {
                existing_local_id: existing,
            });
        }

        let row = IdentifierMapping::new(local_id, remote_id, display_name);
        let previous = table.rows.write().insert(local_id.to_string(), row);
        if let Err(err) = self.persist(kind).await {
            let mut rows = table.rows.write();
            match previous {
                Some(prev) => rows.insert(local_id.to_string(), prev),
                None => rows.remove(local_id),
            };
            return Err(err);
        }

        debug!(%kind, local_id, remote_id, "mapping recorded");
        Ok(match previous {
            Some(prev) => MappingOutcome::Refreshed {
                previous_remote_id: prev.remote_id,
            },
            None => MappingOutcome::Inserted,
        })
    }

    /// Removes the row for `local_id`. Returns true if it existed.
    pub async fn forget(&self, kind: EntityKind, local_id: &str) -> SyncResult<bool> {
        let table = self.table(kind);
        let _gate = table.write_gate.lock().await;
        let removed = table.rows.write().remove(local_id);
        match removed {
            Some(row) => {
                if let Err(err) = self.persist(kind).await {
                    table.rows.write().insert(local_id.to_string(), row);
                    return Err(err);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Restores all tables from the local store. Returns the number of rows
    /// loaded.
    pub async fn load(&self) -> SyncResult<usize> {
        let mut loaded = 0;
        for kind in [EntityKind::Workspace, EntityKind::Folder, EntityKind::Document] {
            let table = self.table(kind);
            let _gate = table.write_gate.lock().await;
            let rows: Vec<IdentifierMapping> = match self.store.read(&Self::key(kind)).await? {
                Some(bytes) => from_cbor(&bytes)?,
                None => Vec::new(),
            };
            loaded += rows.len();
            *table.rows.write() = rows
                .into_iter()
                .map(|row| (row.local_id.clone(), row))
                .collect();
        }
        Ok(loaded)
    }

    async fn persist(&self, kind: EntityKind) -> SyncResult<()> {
        let rows = self.table(kind).sorted_rows();
        self.store.write(&Self::key(kind), &to_cbor(&rows)?).await?;
        Ok(())
    }
}

impl std::fmt::Debug for MappingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingService")
            .field("workspaces", &self.workspaces.rows.read().len())
            .field("folders", &self.folders.rows.read().len())
            .field("documents", &self.documents.rows.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_storage::InMemoryStore;

    fn service() -> (Arc<InMemoryStore>, MappingService) {
        let store = Arc::new(InMemoryStore::new());
        (store.clone(), MappingService::new(store))
    }

    #[tokio::test]
    async fn record_and_resolve() {
        let (_, svc) = service();
        let outcome = svc
            .record(EntityKind::Document, "local-1", "remote-1", "Doc")
            .await
            .unwrap();
        assert_eq!(outcome, MappingOutcome::Inserted);
        assert_eq!(
            svc.resolve(EntityKind::Document, "local-1").as_deref(),
            Some("remote-1")
        );
        assert_eq!(
            svc.reverse(EntityKind::Document, "remote-1").as_deref(),
            Some("local-1")
        );
        assert_eq!(svc.resolve(EntityKind::Workspace, "local-1"), None);
    }

    #[tokio::test]
    async fn second_claim_is_rejected() {
        let (_, svc) = service();
        svc.record(EntityKind::Document, "a", "r", "A").await.unwrap();
        let outcome = svc.record(EntityKind::Document, "b", "r", "B").await.unwrap();

        assert_eq!(
            outcome,
            MappingOutcome::Rejected {
                existing_local_id: "a".into()
            }
        );
        assert!(!outcome.is_mapped());
        assert_eq!(svc.resolve(EntityKind::Document, "a").as_deref(), Some("r"));
        assert_eq!(svc.resolve(EntityKind::Document, "b"), None);
    }

    #[tokio::test]
    async fn rerecord_refreshes_or_is_unchanged() {
        let (_, svc) = service();
        svc.record(EntityKind::Document, "a", "r1", "A").await.unwrap();
        assert_eq!(
            svc.record(EntityKind::Document, "a", "r1", "A").await.unwrap(),
            MappingOutcome::Unchanged
        );
        assert_eq!(
            svc.record(EntityKind::Document, "a", "r2", "A").await.unwrap(),
            MappingOutcome::Refreshed {
                previous_remote_id: "r1".into()
            }
        );
        assert_eq!(svc.reverse(EntityKind::Document, "r1"), None);
    }

    #[tokio::test]
    async fn concurrent_claims_leave_one_owner() {
        let (_, svc) = service();
        let svc = Arc::new(svc);
        let mut handles = Vec::new();
        for i in 0..16 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                svc.record(EntityKind::Workspace, &format!("local-{i}"), "shared", "W")
                    .await
                    .unwrap()
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() == MappingOutcome::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(svc.entries(EntityKind::Workspace).len(), 1);
    }

    #[tokio::test]
    async fn tables_survive_reload() {
        let (store, svc) = service();
        svc.record(EntityKind::Folder, "f", "rf", "F").await.unwrap();
        svc.record(EntityKind::Document, "d", "rd", "D").await.unwrap();
        svc.record(EntityKind::Document, "e", "re", "E").await.unwrap();
        assert!(svc.forget(EntityKind::Document, "e").await.unwrap());

        let reloaded = MappingService::new(store);
        assert_eq!(reloaded.load().await.unwrap(), 2);
        assert_eq!(
            reloaded.resolve(EntityKind::Folder, "f").as_deref(),
            Some("rf")
        );
        assert_eq!(reloaded.resolve(EntityKind::Document, "e"), None);
    }
}
