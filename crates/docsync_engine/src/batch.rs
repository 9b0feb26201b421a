//! Bulk sync of a workspace.
//!
//! Every unsynced document of a workspace becomes one pending operation and
//! one [`BatchOperation`] tagged with a `batch-<uuid>` correlation id. The
//! operations are sent create, update, delete in chunks, and each result is
//! applied on its own: a failed operation never blocks the others unless the
//! request is atomic. A document that cannot be prepared, or whose result
//! cannot be recorded locally, is reported as `Error` and moved to the failed
//! list; the rest of the batch carries on.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::mapping::MappingService;
use crate::orchestrator::SyncOrchestrator;
use crate::pending::PendingStore;
use crate::remote::RemoteError;
use crate::repository::Repository;
use docsync_protocol::{
    BatchOperation, BatchOperationResult, BatchRequest, BatchStatus, Conflict, DocumentRecord,
    DocumentWrite, EntityKind, OperationType, PendingOperation, SyncMeta, WriteAck,
    MAX_BATCH_OPERATIONS,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of a batch sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    /// Local workspace id.
    pub workspace_id: String,
    /// One result per submitted operation.
    pub results: Vec<BatchOperationResult>,
    /// Requests sent.
    pub chunks: usize,
    /// Tombstones that were never pushed and were purged locally.
    pub purged: usize,
}

impl BatchReport {
    /// Number of results with the given status.
    pub fn count(&self, status: BatchStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

struct Planned {
    record: DocumentRecord,
    op: BatchOperation,
    write: Option<DocumentWrite>,
}

/// Builds and submits batch requests.
pub struct BatchAggregator {
    config: SyncConfig,
    orchestrator: Arc<SyncOrchestrator>,
    repository: Repository,
    mappings: Arc<MappingService>,
    pending: Arc<PendingStore>,
}

impl BatchAggregator {
    /// Creates an aggregator.
    pub fn new(
        config: SyncConfig,
        orchestrator: Arc<SyncOrchestrator>,
        repository: Repository,
        mappings: Arc<MappingService>,
        pending: Arc<PendingStore>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            repository,
            mappings,
            pending,
        }
    }

    fn chunk_size(&self) -> usize {
        self.config.batch_chunk_size.clamp(1, MAX_BATCH_OPERATIONS)
    }

    /// Syncs every unsynced document of a local workspace.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine cannot sync at all (no identity,
    /// halted) or the workspace cannot be mapped. Per-operation failures are
    /// reported in the [`BatchReport`].
    pub async fn sync_workspace(&self, workspace_id: &str) -> SyncResult<BatchReport> {
        self.orchestrator.check_ready()?;
        let workspace_remote = self.orchestrator.ensure_workspace(workspace_id).await?;

        let mut report = BatchReport {
            workspace_id: workspace_id.to_string(),
            ..BatchReport::default()
        };
        let mut planned = Vec::new();
        for record in self.repository.unsynced_documents(workspace_id).await? {
            let remote_id = self.mappings.resolve(EntityKind::Document, &record.id);
            if record.is_deleted() && remote_id.is_none() {
                self.orchestrator.purge_local(&record.id).await?;
                self.pending.remove(&record.id).await?;
                report.purged += 1;
                continue;
            }

            let client_id = format!("batch-{}", Uuid::new_v4());
            let pending = PendingOperation::for_document(&record, remote_id.clone())
                .with_id(client_id.clone());
            let operation = pending.operation;
            self.pending.upsert(pending).await?;
            let write = if record.is_deleted() {
                None
            } else {
                match self
                    .orchestrator
                    .prepare_write(&record, &workspace_remote)
                    .await
                {
                    Ok(write) => Some(write),
                    Err(err) => {
                        let result = self.fail_locally(&record.id, &client_id, &err).await;
                        report.results.push(result);
                        continue;
                    }
                }
            };
            let op = BatchOperation {
                operation,
                client_id,
                document_id: remote_id,
                data: write.clone(),
                expected_version: (operation == OperationType::Update)
                    .then(|| record.meta.version()),
            };
            planned.push(Planned { record, op, write });
        }

        planned.sort_by_key(|p| p.op.operation);
        info!(
            workspace_id,
            operations = planned.len(),
            purged = report.purged,
            "batch sync started"
        );

        let chunk_size = self.chunk_size();
        while !planned.is_empty() {
            let rest = planned.split_off(chunk_size.min(planned.len()));
            let chunk = std::mem::replace(&mut planned, rest);
            report.chunks += 1;
            let results = self.submit(&workspace_remote, &chunk).await;
            for (plan, result) in chunk.iter().zip(results) {
                let result = match self.apply_result(plan, &result).await {
                    Ok(()) => result,
                    Err(err) => {
                        self.fail_locally(&plan.record.id, &result.client_id, &err)
                            .await
                    }
                };
                report.results.push(result);
            }
        }

        info!(
            workspace_id,
            succeeded = report.count(BatchStatus::Success),
            conflicts = report.count(BatchStatus::Conflict),
            errors = report.count(BatchStatus::Error),
            skipped = report.count(BatchStatus::Skipped),
            "batch sync finished"
        );
        Ok(report)
    }

    /// Sends one chunk and returns one result per planned operation, in
    /// plan order.
    async fn submit(&self, workspace_remote: &str, chunk: &[Planned]) -> Vec<BatchOperationResult> {
        let request = BatchRequest {
            workspace_id: workspace_remote.to_string(),
            operations: chunk.iter().map(|p| p.op.clone()).collect(),
            atomic: self.config.batch_atomic,
        };
        match self.orchestrator.remote().batch(&request).await {
            Ok(response) => chunk
                .iter()
                .map(|p| {
                    response
                        .result_for(&p.op.client_id)
                        .cloned()
                        .unwrap_or_else(|| {
                            BatchOperationResult::status(&p.op.client_id, BatchStatus::Skipped)
                        })
                })
                .collect(),
            Err(err) => {
                warn!(error = %err, operations = chunk.len(), "batch request failed");
                chunk
                    .iter()
                    .map(|p| {
                        BatchOperationResult::failure(
                            &p.op.client_id,
                            BatchStatus::Error,
                            err.to_string(),
                        )
                    })
                    .collect()
            }
        }
    }

    async fn apply_result(&self, plan: &Planned, result: &BatchOperationResult) -> SyncResult<()> {
        let id = plan.record.id.as_str();
        match result.status {
            BatchStatus::Success => {
                match (&plan.write, &result.document_id, result.version) {
                    (None, _, _) => self.orchestrator.purge_local(id).await?,
                    (Some(write), Some(remote_id), Some(version)) => {
                        let ack = WriteAck {
                            id: remote_id.clone(),
                            version,
                            updated_at: chrono::Utc::now(),
                        };
                        self.orchestrator.apply_ack(&plan.record, &ack, write).await?;
                    }
                    (Some(_), None, _) => {
                        return Err(malformed(result, "success without document id"));
                    }
                    (Some(_), Some(_), None) => {
                        return Err(malformed(result, "success without version"));
                    }
                }
                self.pending.remove(id).await?;
            }
            BatchStatus::Conflict => {
                let local = plan.record.meta.version();
                let conflict = Conflict::content(id, local, result.version.unwrap_or(local));
                warn!(id, client_id = %result.client_id, "batch operation conflicted");
                self.orchestrator
                    .update_meta(id, SyncMeta::mark_conflict)
                    .await?;
                self.orchestrator.record_conflict(&conflict).await?;
            }
            BatchStatus::Error => {
                warn!(
                    id,
                    client_id = %result.client_id,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "batch operation failed"
                );
            }
            BatchStatus::Skipped => {
                debug!(id, client_id = %result.client_id, "batch operation skipped");
            }
        }
        Ok(())
    }

    /// Moves a document's operation to the failed list after a local error
    /// and returns the `Error` result reported for it.
    async fn fail_locally(
        &self,
        id: &str,
        client_id: &str,
        err: &SyncError,
    ) -> BatchOperationResult {
        warn!(id, client_id, error = %err, "batch operation could not be completed locally");
        if let Err(fail) = self.pending.fail(id, &err.to_string()).await {
            warn!(id, error = %fail, "failed to move operation to the failed list");
        }
        if let Err(mark) = self.orchestrator.update_meta(id, SyncMeta::mark_error).await {
            warn!(id, error = %mark, "failed to mark document as errored");
        }
        BatchOperationResult::failure(client_id, BatchStatus::Error, err.to_string())
    }
}

fn malformed(result: &BatchOperationResult, detail: &str) -> SyncError {
    SyncError::Remote(RemoteError::Malformed(format!(
        "{detail} for {}",
        result.client_id
    )))
}

impl std::fmt::Debug for BatchAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchAggregator")
            .field("chunk_size", &self.chunk_size())
            .field("atomic", &self.config.batch_atomic)
            .finish_non_exhaustive()
    }
}
