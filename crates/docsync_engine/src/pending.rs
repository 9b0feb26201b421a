//! Persistent pending-operation list.
//!
//! Holds at most one [`PendingOperation`] per entity plus the terminal
//! [`FailedOperation`] records. Every mutation is written through to the
//! local store under `pending/queue` and `pending/failed`, so the list
//! survives restarts. A mutation whose write fails is rolled back in memory
//! and on disk.

use crate::error::SyncResult;
use chrono::Utc;
use docsync_protocol::{from_cbor, to_cbor, FailedOperation, PendingOperation};
use docsync_storage::LocalStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const QUEUE_KEY: &str = "pending/queue";
const FAILED_KEY: &str = "pending/failed";

/// What happened to an operation after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    /// Still queued with the given retry count.
    Retrying(u32),
    /// Removed from the queue and recorded as failed.
    Exhausted(FailedOperation),
    /// No operation was queued for the entity.
    Missing,
}

#[derive(Clone, Default)]
struct Lists {
    ops: HashMap<String, PendingOperation>,
    failed: Vec<FailedOperation>,
}

impl Lists {
    fn to_stored(&self) -> (Vec<PendingOperation>, Vec<FailedOperation>) {
        let mut ops: Vec<_> = self.ops.values().cloned().collect();
        ops.sort_by(PendingOperation::queue_order);
        (ops, self.failed.clone())
    }
}

/// The pending-operation list shared by the queue, the orchestrator and the
/// batch aggregator.
pub struct PendingStore {
    store: Arc<dyn LocalStore>,
    lists: RwLock<Lists>,
    write_gate: Mutex<()>,
}

impl PendingStore {
    /// Creates an empty list. Call [`PendingStore::load`] to restore it.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            lists: RwLock::new(Lists::default()),
            write_gate: Mutex::new(()),
        }
    }

    /// Restores the lists from the local store. Returns the number of
    /// queued operations.
    pub async fn load(&self) -> SyncResult<usize> {
        let _gate = self.write_gate.lock().await;
        let ops: Vec<PendingOperation> = match self.store.read(QUEUE_KEY).await? {
            Some(bytes) => from_cbor(&bytes)?,
            None => Vec::new(),
        };
        let failed: Vec<FailedOperation> = match self.store.read(FAILED_KEY).await? {
            Some(bytes) => from_cbor(&bytes)?,
            None => Vec::new(),
        };
        let count = ops.len();
        *self.lists.write() = Lists {
            ops: ops
                .into_iter()
                .map(|op| (op.entity_id.clone(), op))
                .collect(),
            failed,
        };
        Ok(count)
    }

    /// Queued operations in drain order.
    pub fn ordered(&self) -> Vec<PendingOperation> {
        let mut ops: Vec<_> = self.lists.read().ops.values().cloned().collect();
        ops.sort_by(PendingOperation::queue_order);
        ops
    }

    /// The operation queued for an entity.
    pub fn get(&self, entity_id: &str) -> Option<PendingOperation> {
        self.lists.read().ops.get(entity_id).cloned()
    }

    /// Returns true if an operation is queued for the entity.
    pub fn contains(&self, entity_id: &str) -> bool {
        self.lists.read().ops.contains_key(entity_id)
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.lists.read().ops.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lists.read().ops.is_empty()
    }

    /// Terminal failure records.
    pub fn failed(&self) -> Vec<FailedOperation> {
        self.lists.read().failed.clone()
    }

    /// Queues an operation, or refreshes the one already queued for the
    /// same entity. Returns true if it was newly queued.
    pub async fn upsert(&self, op: PendingOperation) -> SyncResult<bool> {
        self.mutate(|lists| match lists.ops.get_mut(&op.entity_id) {
            Some(existing) => {
                existing.refresh_from(op);
                false
            }
            None => {
                lists.ops.insert(op.entity_id.clone(), op);
                true
            }
        })
        .await
    }

    /// Removes the operation queued for an entity.
    pub async fn remove(&self, entity_id: &str) -> SyncResult<Option<PendingOperation>> {
        if !self.contains(entity_id) {
            return Ok(None);
        }
        self.mutate(|lists| lists.ops.remove(entity_id)).await
    }

    /// Records a failed attempt. Once the retry count reaches `max_retries`
    /// the operation is moved to the failed list.
    pub async fn record_failure(
        &self,
        entity_id: &str,
        error: &str,
        max_retries: u32,
    ) -> SyncResult<FailureDisposition> {
        self.mutate(|lists| {
            let Some(op) = lists.ops.get_mut(entity_id) else {
                return FailureDisposition::Missing;
            };
            let count = op.record_failure(error);
            if count < max_retries {
                return FailureDisposition::Retrying(count);
            }
            let Some(op) = lists.ops.remove(entity_id) else {
                return FailureDisposition::Missing;
            };
            let failed = FailedOperation {
                operation: op,
                failed_at: Utc::now(),
                error: error.to_string(),
            };
            lists.failed.retain(|f| f.operation.entity_id != entity_id);
            lists.failed.push(failed.clone());
            FailureDisposition::Exhausted(failed)
        })
        .await
    }

    /// Moves an operation straight to the failed list.
    pub async fn fail(&self, entity_id: &str, error: &str) -> SyncResult<Option<FailedOperation>> {
        self.mutate(|lists| {
            let mut op = lists.ops.remove(entity_id)?;
            op.record_failure(error);
            let failed = FailedOperation {
                operation: op,
                failed_at: Utc::now(),
                error: error.to_string(),
            };
            lists.failed.retain(|f| f.operation.entity_id != entity_id);
            lists.failed.push(failed.clone());
            Some(failed)
        })
        .await
    }

    /// Removes and returns the failure record for an entity.
    pub async fn take_failed(&self, entity_id: &str) -> SyncResult<Option<FailedOperation>> {
        self.mutate(|lists| {
            let index = lists
                .failed
                .iter()
                .position(|f| f.operation.entity_id == entity_id)?;
            Some(lists.failed.remove(index))
        })
        .await
    }

    /// Rewrites queued operations that target `old_remote_id` to target
    /// `new_remote_id`. Returns the number rewritten.
    pub async fn migrate_remote_id(&self, old_remote_id: &str, new_remote_id: &str) -> SyncResult<usize> {
        let count = self
            .mutate(|lists| {
                let mut count = 0;
                for op in lists.ops.values_mut() {
                    if op.remote_id.as_deref() == Some(old_remote_id) {
                        op.remote_id = Some(new_remote_id.to_string());
                        count += 1;
                    }
                }
                count
            })
            .await?;
        if count > 0 {
            debug!(old_remote_id, new_remote_id, count, "migrated queued operations");
        }
        Ok(count)
    }

    async fn mutate<T>(&self, change: impl FnOnce(&mut Lists) -> T) -> SyncResult<T> {
        let _gate = self.write_gate.lock().await;
        let (result, previous, stored) = {
            let mut lists = self.lists.write();
            let previous = lists.clone();
            let result = change(&mut lists);
            (result, previous, lists.to_stored())
        };
        if let Err(err) = self.write_stored(&stored).await {
            warn!(error = %err, "pending list write failed, rolling back");
            if let Err(restore) = self.write_stored(&previous.to_stored()).await {
                warn!(error = %restore, "failed to restore persisted pending list");
            }
            *self.lists.write() = previous;
            return Err(err);
        }
        Ok(result)
    }

    async fn write_stored(
        &self,
        (ops, failed): &(Vec<PendingOperation>, Vec<FailedOperation>),
    ) -> SyncResult<()> {
        self.store.write(QUEUE_KEY, &to_cbor(ops)?).await?;
        self.store.write(FAILED_KEY, &to_cbor(failed)?).await?;
        Ok(())
    }
}

impl std::fmt::Debug for PendingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lists = self.lists.read();
        f.debug_struct("PendingStore")
            .field("queued", &lists.ops.len())
            .field("failed", &lists.failed.len())
            .finish()
    }
}
