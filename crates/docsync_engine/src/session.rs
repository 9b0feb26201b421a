//! Top-level sync session.
//!
//! [`SyncSession`] builds every service once and shares them through `Arc`.
//! It is the surface an application talks to: local mutations, connectivity
//! and login notifications, explicit sync requests, conflict resolution.
//!
//! Whenever the connection machine lands in `Error` (a failed connect or a
//! network failure during a drain) a reconnect is scheduled after the
//! backoff delay. Reaching `Fatal` stops the retries until
//! [`SyncSession::reset`].

use crate::batch::{BatchAggregator, BatchReport};
use crate::config::SyncConfig;
use crate::connection::{ConnectionMachine, ConnectionState};
use crate::environment::{AuthProvider, ConnectivityProbe, EnvironmentClassifier};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::mapping::MappingService;
use crate::orchestrator::{PullOutcome, SyncOrchestrator};
use crate::pending::PendingStore;
use crate::queue::{DrainReport, DrainTrigger, SyncQueue};
use crate::registry::DocumentRegistry;
use crate::remote::RemoteApi;
use crate::replica::{ReplicaStore, YrsReplicaStore};
use crate::repository::Repository;
use chrono::Utc;
use docsync_protocol::{
    ConflictResolution, DocumentRecord, EntityKind, EntityPayload, FolderRecord, OperationType,
    PendingOperation, Priority, SyncStatus, WorkspaceRecord,
};
use docsync_storage::LocalStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Counts restored by [`SyncSession::load`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Identifier mappings restored.
    pub mappings: usize,
    /// Pending operations restored.
    pub pending: usize,
}

/// A wired sync engine.
pub struct SyncSession {
    config: SyncConfig,
    store: Arc<dyn LocalStore>,
    probe: Arc<dyn ConnectivityProbe>,
    repository: Repository,
    mappings: Arc<MappingService>,
    pending: Arc<PendingStore>,
    registry: Arc<DocumentRegistry>,
    connection: Arc<ConnectionMachine>,
    environment: Arc<EnvironmentClassifier>,
    events: EventBus,
    orchestrator: Arc<SyncOrchestrator>,
    queue: Arc<SyncQueue>,
    batch: BatchAggregator,
    this: Weak<SyncSession>,
    reconnect: Mutex<Option<(u64, JoinHandle<()>)>>,
    reconnect_generation: AtomicU64,
}

impl SyncSession {
    /// Creates a session with the reference replica store and the current
    /// platform.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        probe: Arc<dyn ConnectivityProbe>,
        auth: Arc<dyn AuthProvider>,
    ) -> Arc<Self> {
        Self::with_parts(
            config,
            store,
            remote,
            probe,
            Arc::new(EnvironmentClassifier::new(auth)),
            Arc::new(YrsReplicaStore::new()),
        )
    }

    /// Creates a session from explicit collaborators.
    pub fn with_parts(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        probe: Arc<dyn ConnectivityProbe>,
        environment: Arc<EnvironmentClassifier>,
        replicas: Arc<dyn ReplicaStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| {
            Self::build(config, store, remote, probe, environment, replicas, this.clone())
        })
    }

    fn build(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        probe: Arc<dyn ConnectivityProbe>,
        environment: Arc<EnvironmentClassifier>,
        replicas: Arc<dyn ReplicaStore>,
        this: Weak<SyncSession>,
    ) -> Self {
        let repository = Repository::new(store.clone());
        let mappings = Arc::new(MappingService::new(store.clone()));
        let pending = Arc::new(PendingStore::new(store.clone()));
        let registry = Arc::new(DocumentRegistry::new(
            store.clone(),
            replicas,
            environment.clone(),
        ));
        let connection = Arc::new(ConnectionMachine::new(
            config.backoff.clone(),
            config.history_limit,
        ));
        let events = EventBus::new(config.event_capacity);
        let orchestrator = Arc::new(SyncOrchestrator::new(
            remote,
            repository.clone(),
            mappings.clone(),
            registry.clone(),
            pending.clone(),
            connection.clone(),
            environment.clone(),
            events.clone(),
        ));
        let hook_target = this.clone();
        let queue = Arc::new(
            SyncQueue::new(
                config.clone(),
                pending.clone(),
                orchestrator.clone(),
                repository.clone(),
                mappings.clone(),
                connection.clone(),
                environment.clone(),
            )
            .with_network_error_hook(move || {
                if let Some(session) = hook_target.upgrade() {
                    session.schedule_reconnect();
                }
            }),
        );
        let batch = BatchAggregator::new(
            config.clone(),
            orchestrator.clone(),
            repository.clone(),
            mappings.clone(),
            pending.clone(),
        );
        Self {
            config,
            store,
            probe,
            repository,
            mappings,
            pending,
            registry,
            connection,
            environment,
            events,
            orchestrator,
            queue,
            batch,
            this,
            reconnect: Mutex::new(None),
            reconnect_generation: AtomicU64::new(0),
        }
    }

    /// Initializes the local store and restores mappings and the pending
    /// list.
    pub async fn load(&self) -> SyncResult<LoadSummary> {
        self.store.init().await?;
        let summary = LoadSummary {
            mappings: self.mappings.load().await?,
            pending: self.pending.load().await?,
        };
        info!(mappings = summary.mappings, pending = summary.pending, "session loaded");
        Ok(summary)
    }

    /// Configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Entity repository.
    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Identifier mappings.
    pub fn mappings(&self) -> &Arc<MappingService> {
        &self.mappings
    }

    /// Pending-operation list.
    pub fn pending(&self) -> &Arc<PendingStore> {
        &self.pending
    }

    /// Open-document registry.
    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    /// Connection state machine.
    pub fn connection(&self) -> &Arc<ConnectionMachine> {
        &self.connection
    }

    /// Environment classifier.
    pub fn environment(&self) -> &Arc<EnvironmentClassifier> {
        &self.environment
    }

    /// Push/pull orchestrator.
    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Retry/debounce queue.
    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Subscribes to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------

    /// Probes the remote and moves the connection machine accordingly. When
    /// the remote is reachable the queue is drained; otherwise a reconnect
    /// is scheduled after the backoff delay.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Halted`] if the machine is fatal.
    pub async fn connect(&self) -> SyncResult<ConnectionState> {
        let state = self.connection.state();
        if state == ConnectionState::Fatal {
            return Err(SyncError::Halted);
        }
        if state.is_online() {
            return Ok(state);
        }

        self.connection.transition(ConnectionState::Connecting)?;
        let online = self
            .environment
            .probe(self.probe.as_ref(), self.config.probe_timeout)
            .await;
        if !online {
            let info = self.connection.error("remote unreachable")?;
            let retry_in_ms = self
                .connection
                .next_retry_delay()
                .map(|delay| delay.as_millis() as u64);
            warn!(
                state = %info.state,
                retry_count = info.retry_count,
                ?retry_in_ms,
                "connect failed"
            );
            self.schedule_reconnect();
            return Ok(info.state);
        }

        self.connection.transition(ConnectionState::Connected)?;
        self.cancel_reconnect();
        info!("connected");
        self.drain(DrainTrigger::NetworkRegained).await?;
        Ok(self.connection.state())
    }

    /// Marks the remote unreachable.
    pub fn disconnect(&self) {
        self.environment.set_online(false);
        if self
            .connection
            .state()
            .can_transition_to(ConnectionState::Disconnected)
        {
            if let Err(err) = self.connection.transition(ConnectionState::Disconnected) {
                warn!(error = %err, "disconnect transition failed");
            }
        }
    }

    /// Records a reachability change reported by the platform. Regaining
    /// the network reconnects and drains.
    pub async fn set_online(&self, online: bool) -> SyncResult<ConnectionState> {
        if online {
            self.connect().await
        } else {
            self.disconnect();
            Ok(self.connection.state())
        }
    }

    /// Re-reads the auth provider after a login and drains the queue.
    pub async fn on_login(&self) -> SyncResult<DrainReport> {
        self.environment.refresh_auth();
        self.drain(DrainTrigger::Login).await
    }

    /// Re-reads the auth provider after a logout.
    pub fn on_logout(&self) {
        self.environment.refresh_auth();
    }

    /// Drains the queue after the application returns to the foreground.
    pub async fn on_visibility_regained(&self) -> SyncResult<DrainReport> {
        self.drain(DrainTrigger::VisibilityRegained).await
    }

    /// Rebuilds the connection machine after a fatal error and cancels any
    /// scheduled reconnect.
    pub fn reset(&self) {
        self.cancel_reconnect();
        self.connection.reset();
    }

    /// Returns true while a reconnect is waiting for its backoff delay.
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect.lock().is_some()
    }

    /// Schedules one reconnect attempt after the current backoff delay,
    /// replacing any earlier one. No-op unless the machine is in `Error`.
    fn schedule_reconnect(&self) {
        if self.connection.state() != ConnectionState::Error {
            return;
        }
        let Some(delay) = self.connection.next_retry_delay() else {
            return;
        };
        let generation = self.reconnect_generation.fetch_add(1, Ordering::Relaxed);
        let session = self.this.clone();

        let mut slot = self.reconnect.lock();
        if let Some((_, previous)) = slot.take() {
            previous.abort();
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            {
                let mut slot = session.reconnect.lock();
                if slot.as_ref().is_some_and(|(g, _)| *g == generation) {
                    *slot = None;
                }
            }
            match session.connect().await {
                Ok(state) => debug!(%state, "reconnect attempt finished"),
                Err(err) => warn!(error = %err, "reconnect attempt failed"),
            }
        });
        *slot = Some((generation, handle));
        info!(
            retry_count = self.connection.retry_count(),
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
    }

    fn cancel_reconnect(&self) {
        if let Some((_, handle)) = self.reconnect.lock().take() {
            handle.abort();
            debug!("scheduled reconnect cancelled");
        }
    }

    async fn drain(&self, trigger: DrainTrigger) -> SyncResult<DrainReport> {
        if self.connection.is_fatal() {
            return Err(SyncError::Halted);
        }
        self.queue.drain(trigger).await
    }

    /// Watches the environment and drains the queue whenever sync becomes
    /// possible again. Also keeps the registry's network adapters current.
    pub fn spawn_environment_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let registry_task = self.registry.spawn_environment_watcher();
        let session = Arc::clone(self);
        let mut rx = self.environment.subscribe();
        tokio::spawn(async move {
            let mut could_sync = rx.borrow().can_sync();
            while rx.changed().await.is_ok() {
                let can_sync = rx.borrow_and_update().can_sync();
                if can_sync && !could_sync {
                    if let Err(err) = session.drain(DrainTrigger::NetworkRegained).await {
                        warn!(error = %err, "drain after network regained failed");
                    }
                }
                could_sync = can_sync;
            }
            registry_task.abort();
        })
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    /// Creates a workspace locally and queues its creation remotely.
    pub async fn create_workspace(&self, name: &str) -> SyncResult<WorkspaceRecord> {
        let record = WorkspaceRecord::new(name);
        self.repository.put_workspace(&record).await?;
        let op = PendingOperation::new(OperationType::Create, EntityKind::Workspace, &record.id)
            .with_payload(EntityPayload::from(&record))
            .with_priority(Priority::High);
        self.queue.enqueue(op).await?;
        debug!(id = %record.id, name, "workspace created");
        Ok(record)
    }

    /// Creates a folder locally and queues its creation remotely.
    pub async fn create_folder(
        &self,
        workspace_id: &str,
        parent_id: Option<&str>,
        name: &str,
    ) -> SyncResult<FolderRecord> {
        self.repository.require_workspace(workspace_id).await?;
        if let Some(parent) = parent_id {
            if self.repository.folder(parent).await?.is_none() {
                return Err(SyncError::UnknownEntity {
                    kind: EntityKind::Folder,
                    id: parent.to_string(),
                });
            }
        }
        let record = FolderRecord::new(workspace_id, parent_id.map(str::to_string), name);
        self.repository.put_folder(&record).await?;
        let op = PendingOperation::new(OperationType::Create, EntityKind::Folder, &record.id)
            .with_payload(EntityPayload::from(&record))
            .with_priority(Priority::High);
        self.queue.enqueue(op).await?;
        debug!(id = %record.id, workspace_id, name, "folder created");
        Ok(record)
    }

    /// Creates a document with initial content. The push is debounced like
    /// any other edit.
    pub async fn create_document(
        self: &Arc<Self>,
        workspace_id: &str,
        folder_id: Option<&str>,
        title: &str,
        content: &str,
    ) -> SyncResult<DocumentRecord> {
        self.repository.require_workspace(workspace_id).await?;
        let mut record = DocumentRecord::new(workspace_id, title);
        if let Some(folder) = folder_id {
            record = record.in_folder(folder);
        }
        self.repository.put_document(&record).await?;
        let record = self.write_content(&record.id, 0, content).await?;
        debug!(id = %record.id, workspace_id, "document created");
        Ok(record)
    }

    /// Inserts text into a document at a character index.
    pub async fn edit_document(
        self: &Arc<Self>,
        id: &str,
        index: u32,
        text: &str,
    ) -> SyncResult<DocumentRecord> {
        let record = self.repository.require_document(id).await?;
        if record.is_deleted() {
            return Err(SyncError::UnknownEntity {
                kind: EntityKind::Document,
                id: id.to_string(),
            });
        }
        self.write_content(id, index, text).await
    }

    async fn write_content(
        self: &Arc<Self>,
        id: &str,
        index: u32,
        text: &str,
    ) -> SyncResult<DocumentRecord> {
        let writes = self.registry.lock_writes(id).await;
        self.registry.acquire(id).await?;
        let result = self.apply_edit(id, index, text).await;
        self.registry.release(id);
        drop(writes);
        let record = result?;
        self.queue.notify_change(id);
        Ok(record)
    }

    async fn apply_edit(&self, id: &str, index: u32, text: &str) -> SyncResult<DocumentRecord> {
        let replicas = self.registry.replicas();
        if !text.is_empty() {
            replicas.insert_text(id, index, text)?;
        }
        self.registry.persist(id).await?;
        let content = replicas.content(id).unwrap_or_default();
        let record = self
            .repository
            .update_document(id, |doc| {
                doc.meta.touch(Utc::now());
                doc.content_cache = Some(content);
            })
            .await?;
        self.registry.update_metadata(&record);
        self.events
            .status(EntityKind::Document, id, record.meta.status());
        Ok(record)
    }

    /// Tombstones a document and queues its remote deletion ahead of
    /// regular edits.
    pub async fn delete_document(&self, id: &str) -> SyncResult<DocumentRecord> {
        let record = self
            .repository
            .update_document(id, |doc| {
                doc.deleted_at = Some(Utc::now());
                doc.meta.touch(Utc::now());
            })
            .await?;
        self.registry.update_metadata(&record);
        self.queue.enqueue_document(id, Priority::High).await?;
        debug!(id, "document tombstoned");
        Ok(record)
    }

    /// Current text of a document, read from its replica.
    pub async fn document_content(&self, id: &str) -> SyncResult<String> {
        self.registry.acquire(id).await?;
        let content = self.registry.replicas().content(id).unwrap_or_default();
        self.registry.release(id);
        Ok(content)
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    /// Queues every document with unpushed local changes and drains
    /// immediately, skipping the debounce window. Documents in `Error` or
    /// `Conflict` wait for explicit action.
    pub async fn force_sync(&self) -> SyncResult<DrainReport> {
        self.queue.cancel_timers();
        for doc in self.repository.documents(None).await? {
            if matches!(doc.meta.status(), SyncStatus::Local | SyncStatus::Pending) {
                self.queue.enqueue_document(&doc.id, Priority::Normal).await?;
            }
        }
        self.drain(DrainTrigger::ForceSync).await
    }

    /// Syncs every unsynced document of a workspace in bulk.
    pub async fn batch_sync(&self, workspace_id: &str) -> SyncResult<BatchReport> {
        self.batch.sync_workspace(workspace_id).await
    }

    /// Pulls the remote state of a document.
    pub async fn pull_document(&self, id: &str) -> SyncResult<PullOutcome> {
        self.orchestrator.pull_document(id).await
    }

    /// Resolves a recorded conflict. Resolutions that keep local changes
    /// queue the document for the next drain.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        resolution: ConflictResolution,
    ) -> SyncResult<DocumentRecord> {
        let record = self.orchestrator.resolve_conflict(id, resolution).await?;
        if resolution.requires_push() {
            self.queue.enqueue_document(id, Priority::High).await?;
        } else {
            self.pending.remove(id).await?;
        }
        Ok(record)
    }

    /// Re-queues an operation whose retries were exhausted.
    pub async fn retry_failed(&self, id: &str) -> SyncResult<bool> {
        self.queue.retry_failed(id).await
    }

    /// Documents grouped by status.
    pub async fn status_counts(&self) -> SyncResult<Vec<(SyncStatus, usize)>> {
        let docs = self.repository.documents(None).await?;
        let statuses = [
            SyncStatus::Local,
            SyncStatus::Pending,
            SyncStatus::Syncing,
            SyncStatus::Synced,
            SyncStatus::Conflict,
            SyncStatus::Error,
        ];
        Ok(statuses
            .into_iter()
            .map(|status| {
                let count = docs.iter().filter(|d| d.meta.status() == status).count();
                (status, count)
            })
            .collect())
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if let Some((_, handle)) = self.reconnect.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("connection", &self.connection.state())
            .field("environment", &self.environment.snapshot())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{Platform, StaticAuth};
    use crate::orchestrator::PushOutcome;
    use crate::registry::replica_key;
    use crate::remote::{MockRemote, RemoteError};
    use async_trait::async_trait;
    use docsync_storage::{InMemoryStore, StorageResult, StoreInfo};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Store whose delete of one armed key waits until released.
    #[derive(Default)]
    struct GatedStore {
        inner: InMemoryStore,
        gated: Mutex<Option<String>>,
        entered: Notify,
        release: Notify,
    }

    impl GatedStore {
        fn arm(&self, key: String) {
            *self.gated.lock() = Some(key);
        }
    }

    #[async_trait]
    impl LocalStore for GatedStore {
        async fn init(&self) -> StorageResult<()> {
            self.inner.init().await
        }

        async fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
            self.inner.read(key).await
        }

        async fn write(&self, key: &str, value: &[u8]) -> StorageResult<()> {
            self.inner.write(key, value).await
        }

        async fn delete(&self, key: &str) -> StorageResult<bool> {
            let gated = self.gated.lock().as_deref() == Some(key);
            if gated {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
            self.inner.list(prefix).await
        }

        async fn clear(&self) -> StorageResult<()> {
            self.inner.clear().await
        }

        async fn info(&self) -> StorageResult<StoreInfo> {
            self.inner.info().await
        }
    }

    fn session(auth: Arc<StaticAuth>) -> (Arc<MockRemote>, Arc<SyncSession>) {
        let remote = Arc::new(MockRemote::new());
        let session = SyncSession::with_parts(
            SyncConfig::default().with_item_delay(Duration::ZERO),
            Arc::new(InMemoryStore::new()),
            remote.clone(),
            remote.clone(),
            Arc::new(EnvironmentClassifier::with_platform(auth, Platform::Desktop)),
            Arc::new(YrsReplicaStore::new()),
        );
        (remote, session)
    }

    #[tokio::test]
    async fn connect_probes_and_drains() {
        let (remote, session) = session(Arc::new(StaticAuth::new(Some("t".into()))));
        session.load().await.unwrap();
        let ws = session.create_workspace("Personal").await.unwrap();
        assert_eq!(session.pending().len(), 1);

        let state = session.connect().await.unwrap();
        assert_eq!(state, ConnectionState::Synced);
        assert!(session.pending().is_empty());
        assert!(session
            .mappings()
            .resolve(EntityKind::Workspace, &ws.id)
            .is_some());
        assert_eq!(remote.workspaces().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_remote_moves_to_error() {
        let (remote, session) = session(Arc::new(StaticAuth::new(Some("t".into()))));
        remote.set_reachable(false);

        let state = session.connect().await.unwrap();
        assert_eq!(state, ConnectionState::Error);
        assert!(!session.environment().is_online());
        assert_eq!(session.connection().retry_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_backoff_without_outside_calls() {
        let (remote, session) = session(Arc::new(StaticAuth::new(Some("t".into()))));
        let ws = session.create_workspace("Personal").await.unwrap();
        remote.set_reachable(false);

        assert_eq!(session.connect().await.unwrap(), ConnectionState::Error);
        assert!(session.connection().next_retry_delay().is_some());
        assert!(session.reconnect_pending());

        remote.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(session.connection().state().is_online());
        assert!(!session.reconnect_pending());
        assert!(session.pending().is_empty());
        assert!(session
            .mappings()
            .resolve(EntityKind::Workspace, &ws.id)
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_stops_at_max_retries() {
        let (remote, session) = session(Arc::new(StaticAuth::new(Some("t".into()))));
        remote.set_reachable(false);

        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(session.connection().state(), ConnectionState::Fatal);
        assert_eq!(
            session.connection().retry_count(),
            session.config().backoff.max_retries
        );
        assert!(!session.reconnect_pending());
        assert!(matches!(session.connect().await, Err(SyncError::Halted)));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_scheduled_reconnect() {
        let (remote, session) = session(Arc::new(StaticAuth::new(Some("t".into()))));
        remote.set_reachable(false);
        session.connect().await.unwrap();
        assert!(session.reconnect_pending());

        session.reset();
        remote.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(!session.reconnect_pending());
        assert_eq!(session.connection().state(), ConnectionState::Initializing);
    }

    #[tokio::test(start_paused = true)]
    async fn network_failure_during_drain_schedules_reconnect() {
        let (remote, session) = session(Arc::new(StaticAuth::new(Some("t".into()))));
        session.create_workspace("Personal").await.unwrap();
        remote.fail_next(RemoteError::Network("connection reset".into()));

        assert_eq!(session.connect().await.unwrap(), ConnectionState::Error);
        assert!(session.reconnect_pending());
        assert_eq!(session.pending().len(), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(session.connection().state().is_online());
        assert!(session.pending().is_empty());
    }

    #[tokio::test]
    async fn edit_during_ack_keeps_persisted_replica() {
        let store = Arc::new(GatedStore::default());
        let remote = Arc::new(MockRemote::new());
        let session = SyncSession::with_parts(
            SyncConfig::default().with_item_delay(Duration::ZERO),
            store.clone(),
            remote.clone(),
            remote.clone(),
            Arc::new(EnvironmentClassifier::with_platform(
                Arc::new(StaticAuth::new(Some("t".into()))),
                Platform::Desktop,
            )),
            Arc::new(YrsReplicaStore::new()),
        );
        session.connect().await.unwrap();
        let ws = session.create_workspace("Notes").await.unwrap();
        let doc = session
            .create_document(&ws.id, None, "Draft", "hello")
            .await
            .unwrap();
        session.queue().cancel_timers();
        store.arm(replica_key(&doc.id));

        let pusher = {
            let session = session.clone();
            let id = doc.id.clone();
            tokio::spawn(async move { session.orchestrator().push_document(&id).await })
        };
        store.entered.notified().await;
        let editor = {
            let session = session.clone();
            let id = doc.id.clone();
            tokio::spawn(async move { session.edit_document(&id, 5, " world").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.release.notify_one();

        let outcome = pusher.await.unwrap().unwrap();
        assert!(matches!(outcome, PushOutcome::Synced { version: 1, .. }));
        let edited = editor.await.unwrap().unwrap();
        assert_eq!(edited.meta.status(), SyncStatus::Pending);
        assert!(store.inner.exists(&replica_key(&doc.id)).await.unwrap());
        assert_eq!(
            session.document_content(&doc.id).await.unwrap(),
            "hello world"
        );
    }

    #[tokio::test]
    async fn edits_update_replica_and_cache() {
        let (_, session) = session(Arc::new(StaticAuth::guest()));
        let ws = session.create_workspace("Notes").await.unwrap();
        let doc = session
            .create_document(&ws.id, None, "Todo", "milk")
            .await
            .unwrap();
        let doc = session.edit_document(&doc.id, 0, "buy ").await.unwrap();

        assert_eq!(doc.content_cache.as_deref(), Some("buy milk"));
        assert_eq!(doc.meta.status(), SyncStatus::Local);
        assert_eq!(session.document_content(&doc.id).await.unwrap(), "buy milk");
        assert_eq!(session.registry().refcount(&doc.id), 0);
        assert_eq!(session.queue().scheduled(), 1);
    }

    #[tokio::test]
    async fn login_drains_the_queue() {
        let auth = Arc::new(StaticAuth::guest());
        let (remote, session) = session(auth.clone());
        let ws = session.create_workspace("Team").await.unwrap();
        assert_eq!(session.connect().await.unwrap(), ConnectionState::Connected);
        assert_eq!(remote.total_calls(), 0);

        auth.set_token("fresh");
        let report = session.on_login().await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(session
            .mappings()
            .resolve(EntityKind::Workspace, &ws.id)
            .is_some());
    }

    #[tokio::test]
    async fn folder_with_unknown_parent_is_rejected() {
        let (_, session) = session(Arc::new(StaticAuth::guest()));
        let ws = session.create_workspace("Notes").await.unwrap();
        let err = session
            .create_folder(&ws.id, Some("missing"), "Child")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownEntity { .. }));
    }
}
