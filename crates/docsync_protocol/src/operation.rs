//! Pending sync operations.

use crate::entity::{new_id, DocumentRecord, EntityKind, FolderRecord, WorkspaceRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Type of sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Entity has no remote counterpart yet.
    Create,
    /// Entity exists remotely and changed locally.
    Update,
    /// Entity was deleted locally.
    Delete,
}

impl OperationType {
    /// Returns the lowercase name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

/// Drain priority. Variants are ordered so that sorting ascending yields
/// `High` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// User-initiated or blocking work.
    High,
    /// Regular edits.
    Normal,
    /// Background work.
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Payload for a workspace operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspacePayload {
    /// Workspace name.
    pub name: String,
}

/// Payload for a folder operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderPayload {
    /// Folder name.
    pub name: String,
    /// Local workspace id.
    pub workspace_id: String,
    /// Local parent folder id.
    pub parent_id: Option<String>,
}

/// Payload for a document operation. Content is deliberately absent: it is
/// read from the replica at push time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPayload {
    /// Document title.
    pub title: String,
    /// Local workspace id.
    pub workspace_id: String,
    /// Local folder id.
    pub folder_id: Option<String>,
}

/// Strongly-typed operation payload, one variant per entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EntityPayload {
    /// Workspace payload.
    Workspace(WorkspacePayload),
    /// Folder payload.
    Folder(FolderPayload),
    /// Document payload.
    Document(DocumentPayload),
}

impl EntityPayload {
    /// Entity kind this payload describes.
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityPayload::Workspace(_) => EntityKind::Workspace,
            EntityPayload::Folder(_) => EntityKind::Folder,
            EntityPayload::Document(_) => EntityKind::Document,
        }
    }
}

impl From<&WorkspaceRecord> for EntityPayload {
    fn from(record: &WorkspaceRecord) -> Self {
        EntityPayload::Workspace(WorkspacePayload {
            name: record.name.clone(),
        })
    }
}

impl From<&FolderRecord> for EntityPayload {
    fn from(record: &FolderRecord) -> Self {
        EntityPayload::Folder(FolderPayload {
            name: record.name.clone(),
            workspace_id: record.workspace_id.clone(),
            parent_id: record.parent_id.clone(),
        })
    }
}

impl From<&DocumentRecord> for EntityPayload {
    fn from(record: &DocumentRecord) -> Self {
        EntityPayload::Document(DocumentPayload {
            title: record.title.clone(),
            workspace_id: record.workspace_id.clone(),
            folder_id: record.folder_id.clone(),
        })
    }
}

/// A local mutation waiting to be pushed.
///
/// There is at most one pending operation per entity; re-enqueueing the
/// same entity refreshes `timestamp` and `operation` in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Correlation id.
    pub id: String,
    /// What to do remotely.
    pub operation: OperationType,
    /// Kind of entity targeted.
    pub target: EntityKind,
    /// Local entity id.
    pub entity_id: String,
    /// Typed payload (absent for deletes).
    pub payload: Option<EntityPayload>,
    /// Remote id known when the operation was queued.
    pub remote_id: Option<String>,
    /// Drain priority.
    pub priority: Priority,
    /// Enqueue (or last refresh) time.
    pub timestamp: DateTime<Utc>,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Error from the last failed attempt.
    pub last_error: Option<String>,
}

impl PendingOperation {
    /// Creates an operation with normal priority, timestamped now.
    pub fn new(operation: OperationType, target: EntityKind, entity_id: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            operation,
            target,
            entity_id: entity_id.into(),
            payload: None,
            remote_id: None,
            priority: Priority::Normal,
            timestamp: Utc::now(),
            retry_count: 0,
            last_error: None,
        }
    }

    /// Builds the operation that brings a document record to the remote
    /// store, given its currently mapped remote id.
    pub fn for_document(record: &DocumentRecord, remote_id: Option<String>) -> Self {
        let operation = match (record.is_deleted(), remote_id.is_some()) {
            (true, _) => OperationType::Delete,
            (false, true) => OperationType::Update,
            (false, false) => OperationType::Create,
        };
        let payload = (!record.is_deleted()).then(|| EntityPayload::from(record));
        Self {
            payload,
            remote_id,
            ..Self::new(operation, EntityKind::Document, record.id.clone())
        }
    }

    /// Sets the correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the payload.
    pub fn with_payload(mut self, payload: EntityPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Records a failed attempt and returns the new retry count.
    pub fn record_failure(&mut self, error: impl Into<String>) -> u32 {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.retry_count
    }

    /// Merges a newer enqueue of the same entity into this one.
    ///
    /// Keeps the correlation id and retry history; takes the newer
    /// operation, payload and timestamp, and the more urgent priority.
    pub fn refresh_from(&mut self, newer: PendingOperation) {
        self.operation = newer.operation;
        self.payload = newer.payload.or(self.payload.take());
        self.remote_id = newer.remote_id.or(self.remote_id.take());
        self.priority = self.priority.min(newer.priority);
        self.timestamp = newer.timestamp;
    }

    /// Queue order: priority, then timestamp, then correlation id.
    pub fn queue_order(a: &PendingOperation, b: &PendingOperation) -> Ordering {
        a.priority
            .cmp(&b.priority)
            .then(a.timestamp.cmp(&b.timestamp))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Terminal record of an operation that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOperation {
    /// The operation as it was when it gave up.
    pub operation: PendingOperation,
    /// Time it was moved out of the queue.
    pub failed_at: DateTime<Utc>,
    /// Final error.
    pub error: String,
}
