//! Debounced retry queue.
//!
//! Local edits restart a per-document debounce timer. When the timer fires
//! the document is queued (at most once) and the queue is drained. Drains
//! are single-flight, walk the queue in priority then timestamp order, and
//! pause briefly between items.
//!
//! Failure handling per item:
//!
//! - retryable: the retry count grows; at the cap the item moves to the
//!   failed list and the document is marked `Error`
//! - authentication: the drain stops and every item stays queued
//! - anything else: the item moves to the failed list immediately

use crate::config::SyncConfig;
use crate::connection::ConnectionMachine;
use crate::environment::EnvironmentClassifier;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::mapping::MappingService;
use crate::orchestrator::{PushOutcome, SyncOrchestrator};
use crate::pending::{FailureDisposition, PendingStore};
use crate::repository::Repository;
use chrono::Utc;
use docsync_protocol::{EntityKind, EntityPayload, PendingOperation, Priority, SyncMeta};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why a drain was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainTrigger {
    /// The remote became reachable again.
    NetworkRegained,
    /// The application came back to the foreground.
    VisibilityRegained,
    /// The user asked for a sync.
    ForceSync,
    /// A user signed in.
    Login,
    /// A debounce timer fired.
    Debounce,
}

impl fmt::Display for DrainTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DrainTrigger::NetworkRegained => "network_regained",
            DrainTrigger::VisibilityRegained => "visibility_regained",
            DrainTrigger::ForceSync => "force_sync",
            DrainTrigger::Login => "login",
            DrainTrigger::Debounce => "debounce",
        };
        f.write_str(name)
    }
}

/// Summary of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Items attempted.
    pub attempted: usize,
    /// Items that synced and left the queue.
    pub synced: usize,
    /// Items that failed and stay queued.
    pub retrying: usize,
    /// Items moved to the failed list.
    pub failed: usize,
    /// Items that ended in a conflict.
    pub conflicts: usize,
    /// True if the drain did not run at all.
    pub skipped: bool,
    /// Reason the drain stopped early.
    pub stopped: Option<String>,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Returns true if every attempted item synced.
    pub fn is_clean(&self) -> bool {
        !self.skipped && self.stopped.is_none() && self.synced == self.attempted
    }
}

enum Attempt {
    Synced,
    Conflict,
    Failed(SyncError),
    InFlight,
}

struct DrainFlag<'a>(&'a AtomicBool);

impl Drop for DrainFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The retry/debounce queue.
pub struct SyncQueue {
    config: SyncConfig,
    pending: Arc<PendingStore>,
    orchestrator: Arc<SyncOrchestrator>,
    repository: Repository,
    mappings: Arc<MappingService>,
    connection: Arc<ConnectionMachine>,
    environment: Arc<EnvironmentClassifier>,
    timers: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
    generation: AtomicU64,
    draining: AtomicBool,
    on_network_error: Option<Box<dyn Fn() + Send + Sync>>,
}

impl SyncQueue {
    /// Creates a queue.
    pub fn new(
        config: SyncConfig,
        pending: Arc<PendingStore>,
        orchestrator: Arc<SyncOrchestrator>,
        repository: Repository,
        mappings: Arc<MappingService>,
        connection: Arc<ConnectionMachine>,
        environment: Arc<EnvironmentClassifier>,
    ) -> Self {
        Self {
            config,
            pending,
            orchestrator,
            repository,
            mappings,
            connection,
            environment,
            timers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            on_network_error: None,
        }
    }

    /// Registers a callback run after a network failure during a drain
    /// has been recorded on the connection machine.
    pub fn with_network_error_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_network_error = Some(Box::new(hook));
        self
    }

    /// The pending-operation list.
    pub fn pending(&self) -> &Arc<PendingStore> {
        &self.pending
    }

    /// Returns true while a drain is running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Number of debounce timers waiting to fire.
    pub fn scheduled(&self) -> usize {
        self.timers.lock().len()
    }

    /// Records a local change to a document, restarting its debounce timer.
    pub fn notify_change(self: &Arc<Self>, id: &str) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::clone(self);
        let doc_id = id.to_string();
        let debounce = self.config.debounce;

        let mut timers = self.timers.lock();
        if let Some((_, previous)) = timers.remove(id) {
            previous.abort();
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            {
                let mut timers = queue.timers.lock();
                if timers.get(&doc_id).is_some_and(|(g, _)| *g == generation) {
                    timers.remove(&doc_id);
                }
            }
            if let Err(err) = queue.enqueue_document(&doc_id, Priority::Normal).await {
                warn!(id = %doc_id, error = %err, "failed to enqueue document");
                return;
            }
            if let Err(err) = queue.drain(DrainTrigger::Debounce).await {
                warn!(id = %doc_id, error = %err, "debounced drain failed");
            }
        });
        timers.insert(id.to_string(), (generation, handle));
        debug!(id, "debounce timer restarted");
    }

    /// Cancels every pending debounce timer.
    pub fn cancel_timers(&self) {
        for (_, (_, handle)) in self.timers.lock().drain() {
            handle.abort();
        }
    }

    /// Queues a document push. Returns true if it was newly queued.
    pub async fn enqueue_document(&self, id: &str, priority: Priority) -> SyncResult<bool> {
        let record = self.repository.require_document(id).await?;
        let remote_id = self.mappings.resolve(EntityKind::Document, id);
        let op = PendingOperation::for_document(&record, remote_id).with_priority(priority);
        self.pending.upsert(op).await
    }

    /// Queues an arbitrary operation. Returns true if it was newly queued.
    pub async fn enqueue(&self, op: PendingOperation) -> SyncResult<bool> {
        self.pending.upsert(op).await
    }

    /// Drains the queue once.
    ///
    /// Skipped when the environment does not allow sync or another drain is
    /// running.
    pub async fn drain(&self, trigger: DrainTrigger) -> SyncResult<DrainReport> {
        if !self.environment.can_sync() {
            debug!(%trigger, "drain skipped, offline or unauthenticated");
            return Ok(DrainReport::skipped());
        }
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!(%trigger, "drain skipped, already draining");
            return Ok(DrainReport::skipped());
        }
        let _flag = DrainFlag(&self.draining);

        let began = self.connection.begin_sync();
        let ops = self.pending.ordered();
        info!(%trigger, queued = ops.len(), "drain started");

        let mut report = DrainReport::default();
        for (index, op) in ops.into_iter().enumerate() {
            if index > 0 && !self.config.item_delay.is_zero() {
                tokio::time::sleep(self.config.item_delay).await;
            }
            if !self.environment.can_sync() {
                report.stopped = Some("environment no longer allows sync".into());
                break;
            }
            report.attempted += 1;

            let attempt = match self.attempt(&op).await {
                Ok(attempt) => attempt,
                Err(err @ SyncError::UnknownEntity { .. }) => {
                    debug!(entity_id = %op.entity_id, error = %err, "dropping operation for missing entity");
                    self.pending.remove(&op.entity_id).await?;
                    continue;
                }
                Err(err) => {
                    report.stopped = Some(err.to_string());
                    break;
                }
            };

            match attempt {
                Attempt::Synced => {
                    self.pending.remove(&op.entity_id).await?;
                    report.synced += 1;
                }
                Attempt::Conflict => {
                    self.pending.remove(&op.entity_id).await?;
                    report.conflicts += 1;
                }
                Attempt::InFlight => {}
                Attempt::Failed(err) if err.is_auth() => {
                    warn!(entity_id = %op.entity_id, error = %err, "authentication failed, drain stopped");
                    report.stopped = Some(err.to_string());
                    break;
                }
                Attempt::Failed(err) if err.is_retryable() => {
                    let network = err.kind() == ErrorKind::Network;
                    self.record_retry(&op, &err, &mut report).await?;
                    if network {
                        if self.connection.state().is_online() {
                            match self.connection.error(err.to_string()) {
                                Ok(_) => {
                                    if let Some(hook) = &self.on_network_error {
                                        hook();
                                    }
                                }
                                Err(transition) => {
                                    warn!(error = %transition, "could not record connection error");
                                }
                            }
                        }
                        report.stopped = Some(err.to_string());
                        break;
                    }
                }
                Attempt::Failed(err) => {
                    warn!(entity_id = %op.entity_id, error = %err, "operation failed permanently");
                    self.pending.fail(&op.entity_id, &err.to_string()).await?;
                    self.mark_error(&op).await;
                    report.failed += 1;
                }
            }
        }

        if began {
            self.connection.finish_sync(report.is_clean());
        }
        info!(
            %trigger,
            attempted = report.attempted,
            synced = report.synced,
            retrying = report.retrying,
            failed = report.failed,
            conflicts = report.conflicts,
            "drain finished"
        );
        Ok(report)
    }

    async fn record_retry(
        &self,
        op: &PendingOperation,
        err: &SyncError,
        report: &mut DrainReport,
    ) -> SyncResult<()> {
        match self
            .pending
            .record_failure(&op.entity_id, &err.to_string(), self.config.max_retries)
            .await?
        {
            FailureDisposition::Retrying(count) => {
                debug!(entity_id = %op.entity_id, retry_count = count, "operation will be retried");
                report.retrying += 1;
            }
            FailureDisposition::Exhausted(failed) => {
                warn!(
                    entity_id = %op.entity_id,
                    retries = failed.operation.retry_count,
                    error = %failed.error,
                    "retries exhausted"
                );
                self.mark_error(op).await;
                report.failed += 1;
            }
            FailureDisposition::Missing => {}
        }
        Ok(())
    }

    async fn mark_error(&self, op: &PendingOperation) {
        if op.target != EntityKind::Document {
            return;
        }
        if let Err(err) = self
            .orchestrator
            .update_meta(&op.entity_id, SyncMeta::mark_error)
            .await
        {
            warn!(entity_id = %op.entity_id, error = %err, "failed to mark document as errored");
        }
    }

    async fn attempt(&self, op: &PendingOperation) -> SyncResult<Attempt> {
        match op.target {
            EntityKind::Document => Ok(match self.orchestrator.push_document(&op.entity_id).await? {
                PushOutcome::Synced { .. } | PushOutcome::Deleted => Attempt::Synced,
                PushOutcome::Conflict(_) => Attempt::Conflict,
                PushOutcome::Failed(err) => Attempt::Failed(err),
                PushOutcome::InFlight => Attempt::InFlight,
            }),
            EntityKind::Workspace => {
                self.orchestrator.check_ready()?;
                Ok(self.settle(self.orchestrator.ensure_workspace(&op.entity_id).await))
            }
            EntityKind::Folder => {
                self.orchestrator.check_ready()?;
                if let Some(EntityPayload::Folder(payload)) = &op.payload {
                    debug!(entity_id = %op.entity_id, name = %payload.name, "syncing folder");
                }
                Ok(self.settle(self.orchestrator.ensure_folder(&op.entity_id).await))
            }
        }
    }

    fn settle(&self, result: SyncResult<String>) -> Attempt {
        match result {
            Ok(_) => Attempt::Synced,
            Err(err) => Attempt::Failed(err),
        }
    }

    /// Moves a failed operation back into the queue with a fresh retry
    /// budget. Returns false if nothing had failed for `id`.
    pub async fn retry_failed(&self, id: &str) -> SyncResult<bool> {
        let Some(failed) = self.pending.take_failed(id).await? else {
            return Ok(false);
        };
        let mut op = failed.operation;
        op.retry_count = 0;
        op.last_error = None;
        op.timestamp = Utc::now();
        let target = op.target;
        self.pending.upsert(op).await?;
        if target == EntityKind::Document {
            self.orchestrator
                .update_meta(id, SyncMeta::mark_dirty)
                .await?;
        }
        info!(id, "failed operation re-queued");
        Ok(true)
    }
}

impl Drop for SyncQueue {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

impl fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncQueue")
            .field("queued", &self.pending.len())
            .field("scheduled", &self.scheduled())
            .field("draining", &self.is_draining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::connection::ConnectionState;
    use crate::environment::{Platform, StaticAuth};
    use crate::events::EventBus;
    use crate::registry::DocumentRegistry;
    use crate::remote::{MockRemote, RemoteError};
    use crate::replica::YrsReplicaStore;
    use docsync_protocol::{DocumentRecord, SyncStatus, WorkspaceRecord};
    use docsync_storage::InMemoryStore;
    use std::time::Duration;

    struct Fixture {
        remote: Arc<MockRemote>,
        repository: Repository,
        environment: Arc<EnvironmentClassifier>,
        connection: Arc<ConnectionMachine>,
        queue: Arc<SyncQueue>,
    }

    fn fixture() -> Fixture {
        fixture_with(|queue| queue)
    }

    fn fixture_with(customize: impl FnOnce(SyncQueue) -> SyncQueue) -> Fixture {
        let config = SyncConfig::default().with_item_delay(Duration::ZERO);
        let store = Arc::new(InMemoryStore::new());
        let remote = Arc::new(MockRemote::new());
        let environment = Arc::new(EnvironmentClassifier::with_platform(
            Arc::new(StaticAuth::new(Some("token".into()))),
            Platform::Desktop,
        ));
        environment.set_online(true);
        let registry = Arc::new(DocumentRegistry::new(
            store.clone(),
            Arc::new(YrsReplicaStore::new()),
            environment.clone(),
        ));
        let mappings = Arc::new(MappingService::new(store.clone()));
        let pending = Arc::new(PendingStore::new(store.clone()));
        let connection = Arc::new(ConnectionMachine::new(BackoffConfig::default(), 50));
        connection.transition(ConnectionState::Connecting).unwrap();
        connection.transition(ConnectionState::Connected).unwrap();
        let repository = Repository::new(store);
        let orchestrator = Arc::new(SyncOrchestrator::new(
            remote.clone(),
            repository.clone(),
            mappings.clone(),
            registry,
            pending.clone(),
            connection.clone(),
            environment.clone(),
            EventBus::default(),
        ));
        let queue = Arc::new(customize(SyncQueue::new(
            config,
            pending,
            orchestrator,
            repository.clone(),
            mappings,
            connection.clone(),
            environment.clone(),
        )));
        Fixture {
            remote,
            repository,
            environment,
            connection,
            queue,
        }
    }

    async fn seed(fx: &Fixture) -> DocumentRecord {
        let ws = WorkspaceRecord::new("Personal");
        fx.repository.put_workspace(&ws).await.unwrap();
        let doc = DocumentRecord::new(ws.id, "Doc");
        fx.repository.put_document(&doc).await.unwrap();
        doc
    }

    #[tokio::test]
    async fn drain_syncs_and_empties_queue() {
        let fx = fixture();
        let doc = seed(&fx).await;
        assert!(fx.queue.enqueue_document(&doc.id, Priority::Normal).await.unwrap());
        assert!(!fx.queue.enqueue_document(&doc.id, Priority::Normal).await.unwrap());

        let report = fx.queue.drain(DrainTrigger::ForceSync).await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(report.is_clean());
        assert!(fx.queue.pending().is_empty());
        assert_eq!(fx.connection.state(), ConnectionState::Synced);
    }

    #[tokio::test]
    async fn offline_drain_is_skipped() {
        let fx = fixture();
        let doc = seed(&fx).await;
        fx.queue.enqueue_document(&doc.id, Priority::Normal).await.unwrap();
        fx.environment.set_online(false);

        let report = fx.queue.drain(DrainTrigger::ForceSync).await.unwrap();
        assert!(report.skipped);
        assert_eq!(fx.queue.pending().len(), 1);
        assert_eq!(fx.remote.total_calls(), 0);
    }

    #[tokio::test]
    async fn auth_failure_stops_and_keeps_items() {
        let fx = fixture();
        let a = seed(&fx).await;
        let b = DocumentRecord::new(a.workspace_id.clone(), "B");
        fx.repository.put_document(&b).await.unwrap();
        fx.queue.enqueue_document(&a.id, Priority::High).await.unwrap();
        fx.queue.enqueue_document(&b.id, Priority::Normal).await.unwrap();
        fx.remote.fail_next(RemoteError::Unauthorized("expired".into()));

        let report = fx.queue.drain(DrainTrigger::ForceSync).await.unwrap();
        assert_eq!(report.attempted, 1);
        assert!(report.stopped.is_some());
        assert_eq!(fx.queue.pending().len(), 2);
        assert_eq!(fx.queue.pending().get(&a.id).unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn rejected_operation_fails_immediately() {
        let fx = fixture();
        let doc = seed(&fx).await;
        fx.queue.enqueue_document(&doc.id, Priority::Normal).await.unwrap();
        fx.remote.fail_next(RemoteError::Rejected("bad title".into()));

        let report = fx.queue.drain(DrainTrigger::ForceSync).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(fx.queue.pending().is_empty());
        assert_eq!(fx.queue.pending().failed().len(), 1);
        let stored = fx.repository.require_document(&doc.id).await.unwrap();
        assert_eq!(stored.meta.status(), SyncStatus::Error);

        assert!(fx.queue.retry_failed(&doc.id).await.unwrap());
        assert!(!fx.queue.retry_failed(&doc.id).await.unwrap());
        let report = fx.queue.drain(DrainTrigger::ForceSync).await.unwrap();
        assert_eq!(report.synced, 1);
    }

    #[tokio::test]
    async fn network_failure_records_error_and_runs_hook() {
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        let fx = fixture_with(move |queue| {
            queue.with_network_error_hook(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        let a = seed(&fx).await;
        let b = DocumentRecord::new(a.workspace_id.clone(), "B");
        fx.repository.put_document(&b).await.unwrap();
        fx.queue.enqueue_document(&a.id, Priority::High).await.unwrap();
        fx.queue.enqueue_document(&b.id, Priority::Normal).await.unwrap();
        fx.remote.fail_next(RemoteError::Network("connection reset".into()));

        let report = fx.queue.drain(DrainTrigger::ForceSync).await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.retrying, 1);
        assert!(report.stopped.is_some());
        assert_eq!(fx.connection.state(), ConnectionState::Error);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(fx.queue.pending().len(), 2);
    }

    #[tokio::test]
    async fn missing_entity_is_dropped() {
        let fx = fixture();
        let doc = seed(&fx).await;
        fx.queue.enqueue_document(&doc.id, Priority::Normal).await.unwrap();
        fx.repository.delete_document(&doc.id).await.unwrap();

        let report = fx.queue.drain(DrainTrigger::ForceSync).await.unwrap();
        assert_eq!(report.attempted, 1);
        assert!(fx.queue.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_restarts_on_each_change() {
        let fx = fixture();
        let doc = seed(&fx).await;

        fx.queue.notify_change(&doc.id);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        fx.queue.notify_change(&doc.id);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(fx.remote.total_calls(), 0);
        assert_eq!(fx.queue.scheduled(), 1);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(fx.remote.calls("create_document"), 1);
        assert_eq!(fx.queue.scheduled(), 0);
    }

    #[tokio::test]
    async fn workspace_operations_are_drained() {
        let fx = fixture();
        let ws = WorkspaceRecord::new("Team");
        fx.repository.put_workspace(&ws).await.unwrap();
        let op = PendingOperation::new(
            docsync_protocol::OperationType::Create,
            EntityKind::Workspace,
            ws.id.clone(),
        )
        .with_payload(EntityPayload::from(&ws))
        .with_priority(Priority::High);
        fx.queue.enqueue(op).await.unwrap();

        let report = fx.queue.drain(DrainTrigger::Login).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(fx.remote.workspaces()[0].name, "Team");
    }
}
