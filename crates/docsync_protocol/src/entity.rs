//! Local entity records and their sync metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generates a fresh local identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Sync status of a local entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Never synced; exists only locally.
    Local,
    /// Previously synced, has local changes waiting to be pushed.
    Pending,
    /// A push or pull is in progress.
    Syncing,
    /// Local state matches the last acknowledged remote state.
    Synced,
    /// Local and remote diverged; needs resolution.
    Conflict,
    /// Retries exhausted; needs explicit user action.
    Error,
}

impl SyncStatus {
    /// Returns true if the entity still has work for the sync engine.
    pub fn needs_sync(&self) -> bool {
        !matches!(self, SyncStatus::Synced)
    }

    /// Returns the lowercase name used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Local => "local",
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of syncable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A workspace (root container).
    Workspace,
    /// A folder inside a workspace.
    Folder,
    /// A document.
    Document,
}

impl EntityKind {
    /// Returns the lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Workspace => "workspace",
            EntityKind::Folder => "folder",
            EntityKind::Document => "document",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync bookkeeping shared by every entity.
///
/// # Invariants
///
/// - Once `cloud_id` is assigned it is never unset.
/// - A dirty entity without a `cloud_id` is `Local`; a dirty entity that has
///   one is `Pending`.
/// - `version` tracks the last version acknowledged by the remote store and
///   is sent as the expected version on the next update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    cloud_id: Option<String>,
    status: SyncStatus,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_synced_at: Option<DateTime<Utc>>,
}

impl SyncMeta {
    /// Metadata for an entity created locally at `now`.
    pub fn new_local(now: DateTime<Utc>) -> Self {
        Self {
            cloud_id: None,
            status: SyncStatus::Local,
            version: 0,
            created_at: now,
            updated_at: now,
            last_synced_at: None,
        }
    }

    /// Remote identifier, if the entity has ever been synced.
    pub fn cloud_id(&self) -> Option<&str> {
        self.cloud_id.as_deref()
    }

    /// Current sync status.
    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Last acknowledged remote version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last local or adopted remote modification time.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Time of the last successful sync.
    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    /// Records a local modification.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.mark_dirty();
    }

    /// Flags the entity as needing a push.
    pub fn mark_dirty(&mut self) {
        self.status = if self.cloud_id.is_some() {
            SyncStatus::Pending
        } else {
            SyncStatus::Local
        };
    }

    /// Flags a push or pull as in progress.
    pub fn mark_syncing(&mut self) {
        self.status = SyncStatus::Syncing;
    }

    /// Records a successful push.
    pub fn mark_synced(&mut self, cloud_id: impl Into<String>, version: u64, at: DateTime<Utc>) {
        self.cloud_id = Some(cloud_id.into());
        self.version = version;
        self.last_synced_at = Some(at);
        self.status = SyncStatus::Synced;
    }

    /// Records a successful pull that adopted the remote record.
    pub fn adopt_remote(
        &mut self,
        cloud_id: impl Into<String>,
        version: u64,
        remote_updated_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) {
        self.mark_synced(cloud_id, version, at);
        self.updated_at = remote_updated_at;
    }

    /// Adopts a remote version as the next expected version without changing
    /// the status. Used after a pull-merge before retrying a push.
    pub fn rebase_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Flags divergent local and remote versions.
    pub fn mark_conflict(&mut self) {
        self.status = SyncStatus::Conflict;
    }

    /// Flags exhausted retries.
    pub fn mark_error(&mut self) {
        self.status = SyncStatus::Error;
    }

    /// Returns true if the entity has local changes not yet acknowledged.
    pub fn is_dirty(&self) -> bool {
        matches!(self.status, SyncStatus::Local | SyncStatus::Pending)
    }
}

/// A workspace, the root container for folders and documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    /// Local identifier.
    pub id: String,
    /// Display name; also used to match an existing remote workspace.
    pub name: String,
    /// Sync metadata.
    pub meta: SyncMeta,
}

impl WorkspaceRecord {
    /// Creates a local workspace with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            meta: SyncMeta::new_local(Utc::now()),
        }
    }
}

/// A folder; folders form a chain through `parent_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderRecord {
    /// Local identifier.
    pub id: String,
    /// Local id of the owning workspace.
    pub workspace_id: String,
    /// Local id of the parent folder, `None` at workspace root.
    pub parent_id: Option<String>,
    /// Display name.
    pub name: String,
    /// Sync metadata.
    pub meta: SyncMeta,
}

impl FolderRecord {
    /// Creates a local folder with a fresh id.
    pub fn new(
        workspace_id: impl Into<String>,
        parent_id: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            workspace_id: workspace_id.into(),
            parent_id,
            name: name.into(),
            meta: SyncMeta::new_local(Utc::now()),
        }
    }
}

/// A document. Its content lives in the replica keyed by `id`; the caches
/// here are for listing and display only and are never pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Local identifier, also the replica key.
    pub id: String,
    /// Local id of the owning workspace.
    pub workspace_id: String,
    /// Local id of the containing folder.
    pub folder_id: Option<String>,
    /// Title.
    pub title: String,
    /// Last known rendered content.
    pub content_cache: Option<String>,
    /// Last known replica snapshot.
    pub snapshot_cache: Option<Vec<u8>>,
    /// Local deletion tombstone awaiting a remote delete.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Sync metadata.
    pub meta: SyncMeta,
}

impl DocumentRecord {
    /// Creates a local document at the workspace root.
    pub fn new(workspace_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            workspace_id: workspace_id.into(),
            folder_id: None,
            title: title.into(),
            content_cache: None,
            snapshot_cache: None,
            deleted_at: None,
            meta: SyncMeta::new_local(Utc::now()),
        }
    }

    /// Places the document in a folder.
    pub fn in_folder(mut self, folder_id: impl Into<String>) -> Self {
        self.folder_id = Some(folder_id.into());
        self
    }

    /// Returns true if the document was deleted locally.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
