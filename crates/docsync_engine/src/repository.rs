//! Durable entity records.
//!
//! Records are CBOR encoded under `workspaces/<id>`, `folders/<id>`,
//! `documents/<id>` and `conflicts/<id>`. Reads return owned copies; a
//! change is written back as a whole record.

use crate::error::{SyncError, SyncResult};
use docsync_protocol::{
    from_cbor, to_cbor, Conflict, DocumentRecord, EntityKind, FolderRecord, SyncStatus,
    WorkspaceRecord,
};
use docsync_storage::LocalStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

const WORKSPACES: &str = "workspaces/";
const FOLDERS: &str = "folders/";
const DOCUMENTS: &str = "documents/";
const CONFLICTS: &str = "conflicts/";

/// Entity repository over a [`LocalStore`].
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn LocalStore>,
}

impl Repository {
    /// Creates a repository.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    async fn get<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<T>> {
        match self.store.read(key).await? {
            Some(bytes) => Ok(Some(from_cbor(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put<T: Serialize>(&self, key: &str, value: &T) -> SyncResult<()> {
        self.store.write(key, &to_cbor(value)?).await?;
        Ok(())
    }

    async fn all<T: DeserializeOwned>(&self, prefix: &str) -> SyncResult<Vec<T>> {
        let mut out = Vec::new();
        for key in self.store.list(prefix).await? {
            match self.get(&key).await {
                Ok(Some(value)) => out.push(value),
                Ok(None) => {}
                Err(SyncError::Protocol(err)) => {
                    warn!(%key, error = %err, "skipping undecodable record");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    /// Stores a workspace.
    pub async fn put_workspace(&self, record: &WorkspaceRecord) -> SyncResult<()> {
        self.put(&format!("{WORKSPACES}{}", record.id), record).await
    }

    /// Loads a workspace.
    pub async fn workspace(&self, id: &str) -> SyncResult<Option<WorkspaceRecord>> {
        self.get(&format!("{WORKSPACES}{id}")).await
    }

    /// Loads a workspace or fails with [`SyncError::UnknownEntity`].
    pub async fn require_workspace(&self, id: &str) -> SyncResult<WorkspaceRecord> {
        self.workspace(id).await?.ok_or_else(|| SyncError::UnknownEntity {
            kind: EntityKind::Workspace,
            id: id.to_string(),
        })
    }

    /// Lists all workspaces.
    pub async fn workspaces(&self) -> SyncResult<Vec<WorkspaceRecord>> {
        self.all(WORKSPACES).await
    }

    /// Stores a folder.
    pub async fn put_folder(&self, record: &FolderRecord) -> SyncResult<()> {
        self.put(&format!("{FOLDERS}{}", record.id), record).await
    }

    /// Loads a folder.
    pub async fn folder(&self, id: &str) -> SyncResult<Option<FolderRecord>> {
        self.get(&format!("{FOLDERS}{id}")).await
    }

    /// Lists the folders of a workspace.
    pub async fn folders(&self, workspace_id: &str) -> SyncResult<Vec<FolderRecord>> {
        Ok(self
            .all::<FolderRecord>(FOLDERS)
            .await?
            .into_iter()
            .filter(|f| f.workspace_id == workspace_id)
            .collect())
    }

    /// Stores a document.
    pub async fn put_document(&self, record: &DocumentRecord) -> SyncResult<()> {
        self.put(&format!("{DOCUMENTS}{}", record.id), record).await
    }

    /// Loads a document.
    pub async fn document(&self, id: &str) -> SyncResult<Option<DocumentRecord>> {
        self.get(&format!("{DOCUMENTS}{id}")).await
    }

    /// Loads a document or fails with [`SyncError::UnknownEntity`].
    pub async fn require_document(&self, id: &str) -> SyncResult<DocumentRecord> {
        self.document(id).await?.ok_or_else(|| SyncError::UnknownEntity {
            kind: EntityKind::Document,
            id: id.to_string(),
        })
    }

    /// Lists documents, optionally restricted to one workspace.
    pub async fn documents(&self, workspace_id: Option<&str>) -> SyncResult<Vec<DocumentRecord>> {
        Ok(self
            .all::<DocumentRecord>(DOCUMENTS)
            .await?
            .into_iter()
            .filter(|d| workspace_id.map_or(true, |ws| d.workspace_id == ws))
            .collect())
    }

    /// Lists documents of a workspace that are not `Synced`.
    pub async fn unsynced_documents(&self, workspace_id: &str) -> SyncResult<Vec<DocumentRecord>> {
        Ok(self
            .documents(Some(workspace_id))
            .await?
            .into_iter()
            .filter(|d| d.meta.status() != SyncStatus::Synced)
            .collect())
    }

    /// Applies `change` to a stored document and writes the result back.
    pub async fn update_document<F>(&self, id: &str, change: F) -> SyncResult<DocumentRecord>
    where
        F: FnOnce(&mut DocumentRecord),
    {
        let mut record = self.require_document(id).await?;
        change(&mut record);
        self.put_document(&record).await?;
        Ok(record)
    }

    /// Removes a document record. Returns true if it existed.
    pub async fn delete_document(&self, id: &str) -> SyncResult<bool> {
        Ok(self.store.delete(&format!("{DOCUMENTS}{id}")).await?)
    }

    /// Stores a conflict, replacing any previous one for the same entity.
    pub async fn put_conflict(&self, conflict: &Conflict) -> SyncResult<()> {
        self.put(&format!("{CONFLICTS}{}", conflict.entity_id), conflict)
            .await
    }

    /// Loads the conflict recorded for an entity.
    pub async fn conflict(&self, entity_id: &str) -> SyncResult<Option<Conflict>> {
        self.get(&format!("{CONFLICTS}{entity_id}")).await
    }

    /// Lists recorded conflicts.
    pub async fn conflicts(&self) -> SyncResult<Vec<Conflict>> {
        self.all(CONFLICTS).await
    }

    /// Removes a recorded conflict. Returns true if it existed.
    pub async fn remove_conflict(&self, entity_id: &str) -> SyncResult<bool> {
        Ok(self.store.delete(&format!("{CONFLICTS}{entity_id}")).await?)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}
