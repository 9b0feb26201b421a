//! Push and pull of documents against the remote store.
//!
//! ## Push
//!
//! 1. Make sure the owning workspace, then the folder chain, exist remotely
//!    (create, or adopt a same-named remote entity when creation reports it
//!    already exists). Folder failures are not fatal: the document is pushed
//!    at workspace root.
//! 2. Read content and snapshot from the replica, never from the caches.
//! 3. Create when no mapping exists, update with the last acknowledged
//!    version otherwise.
//! 4. On a version conflict, merge the remote replica state into the local
//!    replica and retry exactly once at the remote version.
//! 5. On not-found during an update, re-create and migrate queued
//!    operations to the new remote id.
//!
//! Only precondition violations (no identity, halted engine, unknown
//! document) are returned as `Err`; every other failure is reported through
//! [`PushOutcome::Failed`] so callers can decide whether to retry.

use crate::connection::ConnectionMachine;
use crate::environment::EnvironmentClassifier;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::mapping::MappingService;
use crate::pending::PendingStore;
use crate::registry::DocumentRegistry;
use crate::remote::{RemoteApi, RemoteError};
use crate::repository::Repository;
use chrono::Utc;
use docsync_protocol::{
    Conflict, ConflictResolution, DocumentRecord, DocumentWrite, EntityKind, MappingOutcome,
    NewFolder, NewWorkspace, SyncMeta, SyncStatus, WriteAck,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of a push.
#[derive(Debug)]
pub enum PushOutcome {
    /// The remote acknowledged the document.
    Synced {
        /// Remote id.
        remote_id: String,
        /// Version after the write.
        version: u64,
    },
    /// A tombstoned document was deleted remotely and purged locally.
    Deleted,
    /// Versions still diverge after the single merge retry.
    Conflict(Conflict),
    /// The push failed; the error tells whether a retry can help.
    Failed(SyncError),
    /// A push or pull of the same document is already running.
    InFlight,
}

impl PushOutcome {
    /// Returns true if the document is now in sync with the remote.
    pub fn is_success(&self) -> bool {
        matches!(self, PushOutcome::Synced { .. } | PushOutcome::Deleted)
    }
}

/// Result of a pull.
#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    /// The document has never been pushed.
    NotMapped,
    /// Local metadata now mirrors the remote record.
    Updated {
        /// Remote version adopted.
        version: u64,
    },
    /// Local changes are newer than the remote record and differ from it.
    Conflict(Conflict),
    /// The remote record no longer exists.
    Failed(Conflict),
    /// A push or pull of the same document is already running.
    InFlight,
}

struct FlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> FlightGuard<'a> {
    fn claim(set: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        set.lock().insert(id.to_string()).then(|| Self {
            set,
            id: id.to_string(),
        })
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

struct Lease<'a> {
    registry: &'a DocumentRegistry,
    id: &'a str,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

/// Coordinates push and pull for documents and their ancestors.
pub struct SyncOrchestrator {
    remote: Arc<dyn RemoteApi>,
    repository: Repository,
    mappings: Arc<MappingService>,
    registry: Arc<DocumentRegistry>,
    pending: Arc<PendingStore>,
    connection: Arc<ConnectionMachine>,
    environment: Arc<EnvironmentClassifier>,
    events: EventBus,
    in_flight: Mutex<HashSet<String>>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        repository: Repository,
        mappings: Arc<MappingService>,
        registry: Arc<DocumentRegistry>,
        pending: Arc<PendingStore>,
        connection: Arc<ConnectionMachine>,
        environment: Arc<EnvironmentClassifier>,
        events: EventBus,
    ) -> Self {
        Self {
            remote,
            repository,
            mappings,
            registry,
            pending,
            connection,
            environment,
            events,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// The remote this orchestrator talks to.
    pub fn remote(&self) -> &Arc<dyn RemoteApi> {
        &self.remote
    }

    /// Returns true if a push or pull of `id` is running.
    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.lock().contains(id)
    }

    pub(crate) fn check_ready(&self) -> SyncResult<()> {
        if !self.environment.is_authenticated() {
            return Err(SyncError::unauthenticated());
        }
        if self.connection.is_fatal() {
            return Err(SyncError::Halted);
        }
        Ok(())
    }

    /// Pushes a document and its ancestors.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Auth`] without network I/O when unauthenticated,
    /// [`SyncError::Halted`] when the connection machine is fatal, and
    /// [`SyncError::UnknownEntity`] when the document does not exist.
    pub async fn push_document(&self, id: &str) -> SyncResult<PushOutcome> {
        self.check_ready()?;
        let Some(_flight) = FlightGuard::claim(&self.in_flight, id) else {
            debug!(id, "push skipped, already in flight");
            return Ok(PushOutcome::InFlight);
        };
        let record = self.repository.require_document(id).await?;

        self.events.emit(SyncEvent::SyncStarted {
            entity_id: id.to_string(),
        });
        let result = if record.is_deleted() {
            self.push_deletion(&record).await
        } else {
            match self.update_meta(id, SyncMeta::mark_syncing).await {
                Ok(_) => self.push_content(&record).await,
                Err(err) => Err(err),
            }
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(id, error = %err, retryable = err.is_retryable(), "push failed");
                if !record.is_deleted() {
                    if let Err(restore) = self.update_meta(id, SyncMeta::mark_dirty).await {
                        warn!(id, error = %restore, "failed to restore dirty status");
                    }
                }
                self.events.emit(SyncEvent::SyncFailed {
                    entity_id: id.to_string(),
                    error: err.to_string(),
                    retryable: err.is_retryable(),
                });
                Ok(PushOutcome::Failed(err))
            }
        }
    }

    async fn push_content(&self, record: &DocumentRecord) -> SyncResult<PushOutcome> {
        let id = record.id.as_str();
        let workspace_remote = self.ensure_workspace(&record.workspace_id).await?;
        let folder_remote = self.folder_or_root(record).await;

        self.registry.acquire(id).await?;
        let _lease = Lease {
            registry: &self.registry,
            id,
        };

        let write = self.document_write(record, &workspace_remote, folder_remote.clone());
        let mapped = self.mappings.resolve(EntityKind::Document, id);
        let first = match &mapped {
            Some(remote_id) => {
                self.remote
                    .update_document(remote_id, &write, record.meta.version())
                    .await
            }
            None => self.remote.create_document(&write).await,
        };

        match (first, mapped) {
            (Ok(ack), _) => self.apply_ack(record, &ack, &write).await,
            (Err(RemoteError::Conflict { current_version }), Some(remote_id)) => {
                info!(id, remote_id, ?current_version, "version conflict, merging remote state");
                self.merge_and_retry(record, &remote_id, &workspace_remote, folder_remote)
                    .await
            }
            (Err(RemoteError::NotFound(_)), Some(stale)) => {
                info!(id, stale_remote_id = %stale, "remote document gone, re-creating");
                let ack = self.remote.create_document(&write).await?;
                self.pending.migrate_remote_id(&stale, &ack.id).await?;
                self.apply_ack(record, &ack, &write).await
            }
            (Err(err), _) => Err(err.into()),
        }
    }

    async fn merge_and_retry(
        &self,
        record: &DocumentRecord,
        remote_id: &str,
        workspace_remote: &str,
        folder_remote: Option<String>,
    ) -> SyncResult<PushOutcome> {
        let id = record.id.as_str();
        let remote_doc = self.remote.get_document(remote_id).await?;
        if let Some(state) = &remote_doc.replica_state {
            self.registry.replicas().apply_remote_update(id, state)?;
            self.registry.persist(id).await?;
        }
        let rebased = self
            .repository
            .update_document(id, |doc| doc.meta.rebase_version(remote_doc.version))
            .await?;

        let write = self.document_write(&rebased, workspace_remote, folder_remote);
        match self
            .remote
            .update_document(remote_id, &write, remote_doc.version)
            .await
        {
            Ok(ack) => self.apply_ack(record, &ack, &write).await,
            Err(RemoteError::Conflict { current_version }) => {
                let conflict = Conflict::content(
                    id,
                    remote_doc.version,
                    current_version.unwrap_or(remote_doc.version),
                );
                warn!(id, remote_id, "conflict persists after merge retry");
                self.update_meta(id, SyncMeta::mark_conflict).await?;
                self.record_conflict(&conflict).await?;
                Ok(PushOutcome::Conflict(conflict))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn push_deletion(&self, record: &DocumentRecord) -> SyncResult<PushOutcome> {
        let id = record.id.as_str();
        let remote_id = self
            .mappings
            .resolve(EntityKind::Document, id)
            .or_else(|| record.meta.cloud_id().map(str::to_string));

        if let Some(remote_id) = &remote_id {
            match self.remote.delete_document(remote_id).await {
                Ok(()) => {}
                Err(RemoteError::NotFound(_)) => {
                    debug!(id, remote_id, "remote document already gone");
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.purge_local(id).await?;
        info!(id, ?remote_id, "document deletion synced");
        if let Some(remote_id) = remote_id {
            self.events.emit(SyncEvent::SyncCompleted {
                entity_id: id.to_string(),
                remote_id,
                version: record.meta.version(),
            });
        }
        Ok(PushOutcome::Deleted)
    }

    async fn folder_or_root(&self, record: &DocumentRecord) -> Option<String> {
        let folder_id = record.folder_id.as_deref()?;
        match self.ensure_folder(folder_id).await {
            Ok(remote_id) => Some(remote_id),
            Err(err) => {
                warn!(id = %record.id, folder_id, error = %err, "folder sync failed, pushing at root");
                None
            }
        }
    }

    /// Loads the replica of `record` just long enough to build its write
    /// body. Folder failures fall back to workspace root.
    pub(crate) async fn prepare_write(
        &self,
        record: &DocumentRecord,
        workspace_remote: &str,
    ) -> SyncResult<DocumentWrite> {
        let folder_remote = self.folder_or_root(record).await;
        self.registry.acquire(&record.id).await?;
        let _lease = Lease {
            registry: &self.registry,
            id: &record.id,
        };
        Ok(self.document_write(record, workspace_remote, folder_remote))
    }

    /// Builds the write body for a document whose replica is loaded.
    pub(crate) fn document_write(
        &self,
        record: &DocumentRecord,
        workspace_remote: &str,
        folder_remote: Option<String>,
    ) -> DocumentWrite {
        let replicas = self.registry.replicas();
        DocumentWrite {
            workspace_id: workspace_remote.to_string(),
            folder_id: folder_remote,
            title: record.title.clone(),
            content: replicas.content(&record.id).unwrap_or_default(),
            replica_state: replicas.extract_snapshot(&record.id),
        }
    }

    /// Records a successful write: mapping, version, status and caches.
    ///
    /// If the document was edited while the write was in flight it stays
    /// dirty and its persisted replica is kept.
    pub(crate) async fn apply_ack(
        &self,
        started: &DocumentRecord,
        ack: &WriteAck,
        write: &DocumentWrite,
    ) -> SyncResult<PushOutcome> {
        let id = started.id.as_str();
        if let MappingOutcome::Rejected { existing_local_id } = self
            .mappings
            .record(EntityKind::Document, id, &ack.id, &started.title)
            .await?
        {
            return Err(RemoteError::Rejected(format!(
                "remote document {} already belongs to {existing_local_id}",
                ack.id
            ))
            .into());
        }

        let _writes = self.registry.lock_writes(id).await;
        let mut edited = false;
        let updated = self
            .repository
            .update_document(id, |doc| {
                edited = doc.meta.updated_at() != started.meta.updated_at();
                doc.meta.mark_synced(ack.id.clone(), ack.version, Utc::now());
                if edited {
                    doc.meta.mark_dirty();
                }
                doc.content_cache = Some(write.content.clone());
                doc.snapshot_cache = write.replica_state.clone();
            })
            .await?;
        if !edited {
            self.registry.clear_persistence(id).await?;
        }
        self.registry.update_metadata(&updated);

        info!(id, remote_id = %ack.id, version = ack.version, "document synced");
        self.events.emit(SyncEvent::SyncCompleted {
            entity_id: id.to_string(),
            remote_id: ack.id.clone(),
            version: ack.version,
        });
        self.events
            .status(EntityKind::Document, id, updated.meta.status());
        Ok(PushOutcome::Synced {
            remote_id: ack.id.clone(),
            version: ack.version,
        })
    }

    /// Returns the remote id of a workspace, creating or adopting the remote
    /// workspace first if it is not mapped yet.
    pub async fn ensure_workspace(&self, local_id: &str) -> SyncResult<String> {
        if let Some(remote_id) = self.mappings.resolve(EntityKind::Workspace, local_id) {
            return Ok(remote_id);
        }
        let mut workspace = self.repository.require_workspace(local_id).await?;

        let body = NewWorkspace {
            name: workspace.name.clone(),
        };
        let (remote_id, version) = match self.remote.create_workspace(&body).await {
            Ok(ack) => (ack.id, ack.version),
            Err(RemoteError::AlreadyExists(_)) => {
                let listed = self.remote.list_workspaces().await?.items;
                let found = listed
                    .iter()
                    .find(|ws| ws.name == workspace.name)
                    .or_else(|| {
                        warn!(
                            local_id,
                            name = %workspace.name,
                            "no remote workspace with matching name, adopting the first listed"
                        );
                        listed.first()
                    })
                    .ok_or_else(|| {
                        RemoteError::NotFound(format!("remote workspace {}", workspace.name))
                    })?;
                (found.id.clone(), found.version)
            }
            Err(err) => return Err(err.into()),
        };

        self.claim(EntityKind::Workspace, local_id, &remote_id, &workspace.name)
            .await?;
        workspace.meta.mark_synced(remote_id.clone(), version, Utc::now());
        self.repository.put_workspace(&workspace).await?;
        self.events
            .status(EntityKind::Workspace, local_id, SyncStatus::Synced);
        debug!(local_id, remote_id, "workspace mapped");
        Ok(remote_id)
    }

    /// Returns the remote id of a folder, syncing its workspace and parent
    /// chain first.
    pub fn ensure_folder<'a>(&'a self, local_id: &'a str) -> BoxFuture<'a, SyncResult<String>> {
        Box::pin(async move {
            if let Some(remote_id) = self.mappings.resolve(EntityKind::Folder, local_id) {
                return Ok(remote_id);
            }
            let mut folder =
                self.repository
                    .folder(local_id)
                    .await?
                    .ok_or_else(|| SyncError::UnknownEntity {
                        kind: EntityKind::Folder,
                        id: local_id.to_string(),
                    })?;
            let workspace_remote = self.ensure_workspace(&folder.workspace_id).await?;
            let parent_remote = match &folder.parent_id {
                Some(parent) => Some(self.ensure_folder(parent).await?),
                None => None,
            };

            let body = NewFolder {
                workspace_id: workspace_remote.clone(),
                parent_id: parent_remote.clone(),
                name: folder.name.clone(),
            };
            let (remote_id, version) = match self.remote.create_folder(&body).await {
                Ok(ack) => (ack.id, ack.version),
                Err(RemoteError::AlreadyExists(_)) => {
                    let listed = self.remote.list_folders(&workspace_remote).await?.items;
                    let found = listed
                        .into_iter()
                        .find(|f| f.name == folder.name && f.parent_id == parent_remote)
                        .ok_or_else(|| {
                            RemoteError::NotFound(format!("remote folder {}", folder.name))
                        })?;
                    (found.id, found.version)
                }
                Err(err) => return Err(err.into()),
            };

            self.claim(EntityKind::Folder, local_id, &remote_id, &folder.name)
                .await?;
            folder.meta.mark_synced(remote_id.clone(), version, Utc::now());
            self.repository.put_folder(&folder).await?;
            self.events
                .status(EntityKind::Folder, local_id, SyncStatus::Synced);
            Ok(remote_id)
        })
    }

    async fn claim(
        &self,
        kind: EntityKind,
        local_id: &str,
        remote_id: &str,
        name: &str,
    ) -> SyncResult<()> {
        match self.mappings.record(kind, local_id, remote_id, name).await? {
            MappingOutcome::Rejected { existing_local_id } => Err(RemoteError::Rejected(
                format!("remote {kind} {remote_id} already belongs to {existing_local_id}"),
            )
            .into()),
            _ => Ok(()),
        }
    }

    /// Pulls the remote state of a mapped document.
    ///
    /// # Errors
    ///
    /// Returns precondition errors like [`SyncOrchestrator::push_document`],
    /// and remote errors other than not-found.
    pub async fn pull_document(&self, id: &str) -> SyncResult<PullOutcome> {
        self.check_ready()?;
        let Some(_flight) = FlightGuard::claim(&self.in_flight, id) else {
            return Ok(PullOutcome::InFlight);
        };
        let record = self.repository.require_document(id).await?;
        let Some(remote_id) = self.mappings.resolve(EntityKind::Document, id) else {
            return Ok(PullOutcome::NotMapped);
        };

        self.events.emit(SyncEvent::SyncStarted {
            entity_id: id.to_string(),
        });
        let remote_doc = match self.remote.get_document(&remote_id).await {
            Ok(doc) => doc,
            Err(RemoteError::NotFound(_)) => {
                let conflict = Conflict::deletion(id, record.meta.version());
                warn!(id, remote_id, "remote document deleted");
                self.update_meta(id, SyncMeta::mark_conflict).await?;
                self.record_conflict(&conflict).await?;
                return Ok(PullOutcome::Failed(conflict));
            }
            Err(err) => {
                self.events.emit(SyncEvent::SyncFailed {
                    entity_id: id.to_string(),
                    error: err.to_string(),
                    retryable: err.kind() == ErrorKind::Network,
                });
                return Err(err.into());
            }
        };

        if let Some(state) = &remote_doc.replica_state {
            self.registry.acquire(id).await?;
            let _lease = Lease {
                registry: &self.registry,
                id,
            };
            self.registry.replicas().apply_remote_update(id, state)?;
            self.registry.persist(id).await?;
        }

        let local_newer = record.meta.updated_at() > remote_doc.updated_at;
        let differs = record
            .content_cache
            .as_deref()
            .is_some_and(|cached| cached != remote_doc.content);
        if local_newer && differs {
            let conflict = Conflict::content(id, record.meta.version(), remote_doc.version);
            info!(id, remote_id, "local changes are newer than remote");
            self.record_conflict(&conflict).await?;
            return Ok(PullOutcome::Conflict(conflict));
        }

        let folder_id = remote_doc
            .folder_id
            .as_deref()
            .and_then(|remote| self.mappings.reverse(EntityKind::Folder, remote));
        let updated = self
            .repository
            .update_document(id, |doc| {
                doc.title = remote_doc.title.clone();
                doc.content_cache = Some(remote_doc.content.clone());
                if remote_doc.replica_state.is_some() {
                    doc.snapshot_cache = remote_doc.replica_state.clone();
                }
                if folder_id.is_some() {
                    doc.folder_id = folder_id;
                }
                doc.meta.adopt_remote(
                    remote_id.clone(),
                    remote_doc.version,
                    remote_doc.updated_at,
                    Utc::now(),
                );
            })
            .await?;
        self.registry.update_metadata(&updated);
        self.events.emit(SyncEvent::SyncCompleted {
            entity_id: id.to_string(),
            remote_id,
            version: remote_doc.version,
        });
        self.events
            .status(EntityKind::Document, id, SyncStatus::Synced);
        Ok(PullOutcome::Updated {
            version: remote_doc.version,
        })
    }

    /// Resolves a recorded conflict.
    ///
    /// `AcceptRemote` replaces the local replica with the remote state and
    /// marks the document synced. `KeepLocal` and `Merge` rebase onto the
    /// remote version and leave the document dirty for the next push;
    /// `Merge` applies the remote replica state first.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        resolution: ConflictResolution,
    ) -> SyncResult<DocumentRecord> {
        self.check_ready()?;
        let mut conflict = self
            .repository
            .conflict(id)
            .await?
            .ok_or_else(|| SyncError::UnknownEntity {
                kind: EntityKind::Document,
                id: id.to_string(),
            })?;
        let remote_id = self
            .mappings
            .resolve(EntityKind::Document, id)
            .ok_or_else(|| SyncError::UnknownEntity {
                kind: EntityKind::Document,
                id: id.to_string(),
            })?;

        let remote_doc = match self.remote.get_document(&remote_id).await {
            Ok(doc) => Some(doc),
            Err(RemoteError::NotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };
        let replicas = self.registry.replicas();

        let _writes = self.registry.lock_writes(id).await;
        let updated = match (resolution, remote_doc) {
            (ConflictResolution::AcceptRemote, Some(remote_doc)) => {
                replicas.destroy(id);
                replicas.get_or_create(id);
                if let Some(state) = &remote_doc.replica_state {
                    replicas.apply_remote_update(id, state)?;
                }
                self.registry.clear_persistence(id).await?;
                self.repository
                    .update_document(id, |doc| {
                        doc.title = remote_doc.title.clone();
                        doc.content_cache = Some(remote_doc.content.clone());
                        doc.snapshot_cache = remote_doc.replica_state.clone();
                        doc.meta.adopt_remote(
                            remote_id.clone(),
                            remote_doc.version,
                            remote_doc.updated_at,
                            Utc::now(),
                        );
                    })
                    .await?
            }
            (ConflictResolution::AcceptRemote, None) => {
                self.mappings.forget(EntityKind::Document, id).await?;
                self.registry.clear_persistence(id).await?;
                let removed = self.repository.require_document(id).await?;
                self.repository.delete_document(id).await?;
                removed
            }
            (_, remote_doc) => {
                if resolution == ConflictResolution::Merge {
                    if let Some(state) = remote_doc.as_ref().and_then(|d| d.replica_state.as_ref())
                    {
                        replicas.apply_remote_update(id, state)?;
                        self.registry.persist(id).await?;
                    }
                }
                let version = remote_doc.map(|d| d.version);
                self.repository
                    .update_document(id, |doc| {
                        if let Some(version) = version {
                            doc.meta.rebase_version(version);
                        }
                        doc.meta.mark_dirty();
                    })
                    .await?
            }
        };

        conflict.resolve(resolution);
        self.repository.remove_conflict(id).await?;
        self.registry.update_metadata(&updated);
        self.events
            .status(EntityKind::Document, id, updated.meta.status());
        info!(
            id,
            kind = ?conflict.kind,
            resolution = ?conflict.resolution,
            "conflict resolved"
        );
        Ok(updated)
    }

    /// Removes every local trace of a document whose deletion the remote
    /// has acknowledged.
    pub(crate) async fn purge_local(&self, id: &str) -> SyncResult<()> {
        self.mappings.forget(EntityKind::Document, id).await?;
        self.registry.clear_persistence(id).await?;
        self.repository.delete_document(id).await?;
        Ok(())
    }

    pub(crate) async fn record_conflict(&self, conflict: &Conflict) -> SyncResult<()> {
        self.repository.put_conflict(conflict).await?;
        self.events
            .emit(SyncEvent::ConflictDetected(conflict.clone()));
        Ok(())
    }

    /// Applies a metadata transition to a stored document and publishes the
    /// new status.
    pub(crate) async fn update_meta(
        &self,
        id: &str,
        change: fn(&mut SyncMeta),
    ) -> SyncResult<DocumentRecord> {
        let updated = self
            .repository
            .update_document(id, |doc| change(&mut doc.meta))
            .await?;
        self.registry.update_metadata(&updated);
        self.events
            .status(EntityKind::Document, id, updated.meta.status());
        Ok(updated)
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("in_flight", &self.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::connection::ConnectionState;
    use crate::environment::{Platform, StaticAuth};
    use crate::remote::MockRemote;
    use crate::replica::{ReplicaStore, YrsReplicaStore};
    use docsync_protocol::{FolderRecord, WorkspaceRecord};
    use docsync_storage::InMemoryStore;

    struct Fixture {
        remote: Arc<MockRemote>,
        repository: Repository,
        replicas: Arc<YrsReplicaStore>,
        mappings: Arc<MappingService>,
        auth: Arc<StaticAuth>,
        connection: Arc<ConnectionMachine>,
        orchestrator: SyncOrchestrator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let remote = Arc::new(MockRemote::new());
        let replicas = Arc::new(YrsReplicaStore::new());
        let auth = Arc::new(StaticAuth::new(Some("token".into())));
        let environment = Arc::new(EnvironmentClassifier::with_platform(
            auth.clone(),
            Platform::Desktop,
        ));
        let registry = Arc::new(DocumentRegistry::new(
            store.clone(),
            replicas.clone(),
            environment.clone(),
        ));
        let mappings = Arc::new(MappingService::new(store.clone()));
        let pending = Arc::new(PendingStore::new(store.clone()));
        let connection = Arc::new(ConnectionMachine::new(BackoffConfig::default(), 50));
        let repository = Repository::new(store);
        let orchestrator = SyncOrchestrator::new(
            remote.clone(),
            repository.clone(),
            mappings.clone(),
            registry,
            pending,
            connection.clone(),
            environment,
            EventBus::default(),
        );
        Fixture {
            remote,
            repository,
            replicas,
            mappings,
            auth,
            connection,
            orchestrator,
        }
    }

    async fn seed_document(fx: &Fixture, content: &str) -> DocumentRecord {
        let ws = WorkspaceRecord::new("Personal");
        fx.repository.put_workspace(&ws).await.unwrap();
        let doc = DocumentRecord::new(ws.id.clone(), "Notes");
        fx.repository.put_document(&doc).await.unwrap();
        fx.replicas.insert_text(&doc.id, 0, content).unwrap();
        let snapshot = fx.replicas.extract_snapshot(&doc.id).unwrap();
        fx.replicas.destroy(&doc.id);
        fx.repository
            .update_document(&doc.id, |d| d.snapshot_cache = Some(snapshot))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn first_push_creates_everything() {
        let fx = fixture();
        let doc = seed_document(&fx, "hello").await;

        let outcome = fx.orchestrator.push_document(&doc.id).await.unwrap();
        let PushOutcome::Synced { remote_id, version } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(version, 1);

        let stored = fx.repository.require_document(&doc.id).await.unwrap();
        assert_eq!(stored.meta.status(), SyncStatus::Synced);
        assert_eq!(stored.meta.cloud_id(), Some(remote_id.as_str()));
        assert_eq!(stored.content_cache.as_deref(), Some("hello"));
        assert_eq!(fx.remote.document(&remote_id).unwrap().content, "hello");
        assert_eq!(fx.remote.workspaces().len(), 1);
        assert!(fx
            .mappings
            .resolve(EntityKind::Workspace, &doc.workspace_id)
            .is_some());
    }

    #[tokio::test]
    async fn existing_workspace_is_adopted_by_name() {
        let fx = fixture();
        let remote_ws = fx.remote.seed_workspace("Personal");
        let doc = seed_document(&fx, "x").await;

        fx.orchestrator.push_document(&doc.id).await.unwrap();
        assert_eq!(
            fx.mappings
                .resolve(EntityKind::Workspace, &doc.workspace_id)
                .as_deref(),
            Some(remote_ws.as_str())
        );
        assert_eq!(fx.remote.workspaces().len(), 1);
    }

    #[tokio::test]
    async fn folder_failure_pushes_at_root() {
        let fx = fixture();
        let doc = seed_document(&fx, "x").await;
        let folder = FolderRecord::new(doc.workspace_id.clone(), None, "Inbox");
        fx.repository.put_folder(&folder).await.unwrap();
        fx.repository
            .update_document(&doc.id, |d| d.folder_id = Some(folder.id.clone()))
            .await
            .unwrap();

        fx.orchestrator
            .ensure_workspace(&doc.workspace_id)
            .await
            .unwrap();
        fx.remote.fail_next(RemoteError::server(500, "boom"));

        let outcome = fx.orchestrator.push_document(&doc.id).await.unwrap();
        let PushOutcome::Synced { remote_id, .. } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(fx.remote.document(&remote_id).unwrap().folder_id, None);
    }

    #[tokio::test]
    async fn folder_chain_is_created_parent_first() {
        let fx = fixture();
        let doc = seed_document(&fx, "x").await;
        let parent = FolderRecord::new(doc.workspace_id.clone(), None, "Projects");
        let child = FolderRecord::new(doc.workspace_id.clone(), Some(parent.id.clone()), "2024");
        fx.repository.put_folder(&parent).await.unwrap();
        fx.repository.put_folder(&child).await.unwrap();

        let child_remote = fx.orchestrator.ensure_folder(&child.id).await.unwrap();
        let parent_remote = fx
            .mappings
            .resolve(EntityKind::Folder, &parent.id)
            .unwrap();
        let remote_child = fx
            .remote
            .folders()
            .into_iter()
            .find(|f| f.id == child_remote)
            .unwrap();
        assert_eq!(remote_child.parent_id, Some(parent_remote));
    }

    #[tokio::test]
    async fn conflict_merges_and_retries_once() {
        let fx = fixture();
        let doc = seed_document(&fx, "base").await;
        let PushOutcome::Synced { remote_id, .. } =
            fx.orchestrator.push_document(&doc.id).await.unwrap()
        else {
            panic!("first push failed");
        };

        // another client writes version 2 with its own replica edit
        let other = YrsReplicaStore::new();
        other
            .apply_remote_update("r", &fx.remote.document(&remote_id).unwrap().replica_state.unwrap())
            .unwrap();
        other.insert_text("r", 0, "remote ").unwrap();
        let version = fx
            .remote
            .overwrite_document(&remote_id, "remote base", other.extract_snapshot("r"))
            .unwrap();
        assert_eq!(version, 2);

        fx.repository
            .update_document(&doc.id, |d| d.meta.touch(Utc::now()))
            .await
            .unwrap();
        let outcome = fx.orchestrator.push_document(&doc.id).await.unwrap();
        let PushOutcome::Synced { version, .. } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(version, 3);
        assert_eq!(fx.remote.calls("update_document"), 2);
        assert_eq!(fx.remote.document(&remote_id).unwrap().content, "remote base");
    }

    #[tokio::test]
    async fn not_found_update_recreates() {
        let fx = fixture();
        let doc = seed_document(&fx, "x").await;
        let PushOutcome::Synced { remote_id, .. } =
            fx.orchestrator.push_document(&doc.id).await.unwrap()
        else {
            panic!("first push failed");
        };
        fx.remote.drop_document(&remote_id);

        let PushOutcome::Synced {
            remote_id: fresh, ..
        } = fx.orchestrator.push_document(&doc.id).await.unwrap()
        else {
            panic!("re-create failed");
        };
        assert_ne!(fresh, remote_id);
        assert_eq!(
            fx.mappings.resolve(EntityKind::Document, &doc.id).as_deref(),
            Some(fresh.as_str())
        );
    }

    #[tokio::test]
    async fn network_failure_is_reported_not_raised() {
        let fx = fixture();
        let doc = seed_document(&fx, "x").await;
        fx.remote.set_reachable(false);

        let outcome = fx.orchestrator.push_document(&doc.id).await.unwrap();
        let PushOutcome::Failed(err) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(err.is_retryable());
        let stored = fx.repository.require_document(&doc.id).await.unwrap();
        assert_eq!(stored.meta.status(), SyncStatus::Local);
    }

    #[tokio::test]
    async fn preconditions_are_errors() {
        let fx = fixture();
        let doc = seed_document(&fx, "x").await;

        assert!(matches!(
            fx.orchestrator.push_document("missing").await,
            Err(SyncError::UnknownEntity { .. })
        ));

        fx.auth.clear();
        assert!(fx.orchestrator.push_document(&doc.id).await.unwrap_err().is_auth());
        assert_eq!(fx.remote.total_calls(), 0);

        fx.auth.set_token("t");
        for _ in 0..5 {
            let _ = fx.connection.transition(ConnectionState::Connecting);
            let _ = fx.connection.error("down");
        }
        assert!(fx.connection.is_fatal());
        assert!(matches!(
            fx.orchestrator.push_document(&doc.id).await,
            Err(SyncError::Halted)
        ));
    }

    #[tokio::test]
    async fn tombstone_deletes_remotely_and_purges() {
        let fx = fixture();
        let doc = seed_document(&fx, "x").await;
        let PushOutcome::Synced { remote_id, .. } =
            fx.orchestrator.push_document(&doc.id).await.unwrap()
        else {
            panic!("first push failed");
        };
        fx.repository
            .update_document(&doc.id, |d| d.deleted_at = Some(Utc::now()))
            .await
            .unwrap();

        let outcome = fx.orchestrator.push_document(&doc.id).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Deleted));
        assert!(fx.remote.document(&remote_id).is_none());
        assert!(fx.repository.document(&doc.id).await.unwrap().is_none());
        assert!(fx.mappings.resolve(EntityKind::Document, &doc.id).is_none());
    }

    #[tokio::test]
    async fn pull_adopts_remote_and_detects_deletion() {
        let fx = fixture();
        let doc = seed_document(&fx, "x").await;
        assert_eq!(
            fx.orchestrator.pull_document(&doc.id).await.unwrap(),
            PullOutcome::NotMapped
        );
        let PushOutcome::Synced { remote_id, .. } =
            fx.orchestrator.push_document(&doc.id).await.unwrap()
        else {
            panic!("push failed");
        };

        fx.remote.overwrite_document(&remote_id, "changed", None);
        assert_eq!(
            fx.orchestrator.pull_document(&doc.id).await.unwrap(),
            PullOutcome::Updated { version: 2 }
        );
        let stored = fx.repository.require_document(&doc.id).await.unwrap();
        assert_eq!(stored.content_cache.as_deref(), Some("changed"));
        assert_eq!(stored.meta.version(), 2);

        fx.remote.drop_document(&remote_id);
        let outcome = fx.orchestrator.pull_document(&doc.id).await.unwrap();
        assert!(matches!(outcome, PullOutcome::Failed(c) if c.kind == docsync_protocol::ConflictKind::Deletion));
        assert_eq!(fx.repository.conflicts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pull_reports_newer_local_changes() {
        let fx = fixture();
        let doc = seed_document(&fx, "x").await;
        let PushOutcome::Synced { remote_id, .. } =
            fx.orchestrator.push_document(&doc.id).await.unwrap()
        else {
            panic!("push failed");
        };
        fx.remote.overwrite_document(&remote_id, "theirs", None);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        fx.repository
            .update_document(&doc.id, |d| {
                d.content_cache = Some("mine".into());
                d.meta.touch(Utc::now());
            })
            .await
            .unwrap();

        let outcome = fx.orchestrator.pull_document(&doc.id).await.unwrap();
        assert!(matches!(outcome, PullOutcome::Conflict(_)));
        let stored = fx.repository.require_document(&doc.id).await.unwrap();
        assert_eq!(stored.content_cache.as_deref(), Some("mine"));
        assert_eq!(stored.meta.status(), SyncStatus::Pending);
    }

    #[tokio::test]
    async fn resolve_keep_local_rebases() {
        let fx = fixture();
        let doc = seed_document(&fx, "x").await;
        let PushOutcome::Synced { remote_id, .. } =
            fx.orchestrator.push_document(&doc.id).await.unwrap()
        else {
            panic!("push failed");
        };
        fx.remote.overwrite_document(&remote_id, "theirs", None);
        fx.repository
            .put_conflict(&Conflict::content(&doc.id, 1, 2))
            .await
            .unwrap();

        let resolved = fx
            .orchestrator
            .resolve_conflict(&doc.id, ConflictResolution::KeepLocal)
            .await
            .unwrap();
        assert_eq!(resolved.meta.version(), 2);
        assert_eq!(resolved.meta.status(), SyncStatus::Pending);
        assert!(fx.repository.conflict(&doc.id).await.unwrap().is_none());

        let outcome = fx.orchestrator.push_document(&doc.id).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Synced { version: 3, .. }));
    }
}
