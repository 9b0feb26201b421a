//! Remote entity API abstraction.
//!
//! [`RemoteApi`] is the engine's only view of the authoritative store.
//! [`crate::HttpRemote`] talks to the real backend; [`MockRemote`] keeps the
//! whole store in memory for tests and local development.

use crate::environment::ConnectivityProbe;
use crate::error::ErrorKind;
use async_trait::async_trait;
use chrono::Utc;
use docsync_protocol::{
    BatchOperation, BatchOperationResult, BatchRequest, BatchResponse, BatchStatus, DocumentWrite,
    NewFolder, NewWorkspace, OperationType, Page, RemoteDocument, RemoteFolder, RemoteWorkspace,
    WriteAck,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;
use thiserror::Error;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failure signals from the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Expected version did not match.
    #[error("version conflict (current version {current_version:?})")]
    Conflict {
        /// Version the remote currently holds, when reported.
        current_version: Option<u64>,
    },

    /// The target does not exist remotely.
    #[error("not found: {0}")]
    NotFound(String),

    /// A create collided with an existing entity.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Credentials missing, expired or insufficient.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Transport failure before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// The remote failed to process the request.
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response message.
        message: String,
    },

    /// The request was refused as invalid.
    #[error("rejected: {0}")]
    Rejected(String),

    /// A response arrived but lacked required fields.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// Creates a server error.
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        RemoteError::Server {
            status,
            message: message.into(),
        }
    }

    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Conflict { .. } => ErrorKind::Conflict,
            RemoteError::Unauthorized(_) => ErrorKind::Auth,
            RemoteError::Network(_) | RemoteError::Server { .. } => ErrorKind::Network,
            RemoteError::NotFound(_)
            | RemoteError::AlreadyExists(_)
            | RemoteError::Rejected(_)
            | RemoteError::Malformed(_) => ErrorKind::Invalid,
        }
    }
}

/// The remote entity API.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Creates a workspace.
    async fn create_workspace(&self, body: &NewWorkspace) -> RemoteResult<WriteAck>;

    /// Lists the caller's workspaces.
    async fn list_workspaces(&self) -> RemoteResult<Page<RemoteWorkspace>>;

    /// Deletes a workspace and everything in it.
    async fn delete_workspace(&self, id: &str) -> RemoteResult<()>;

    /// Creates a folder.
    async fn create_folder(&self, body: &NewFolder) -> RemoteResult<WriteAck>;

    /// Lists the folders of a workspace.
    async fn list_folders(&self, workspace_id: &str) -> RemoteResult<Page<RemoteFolder>>;

    /// Creates a document.
    async fn create_document(&self, body: &DocumentWrite) -> RemoteResult<WriteAck>;

    /// Updates a document if its version equals `expected_version`.
    async fn update_document(
        &self,
        id: &str,
        body: &DocumentWrite,
        expected_version: u64,
    ) -> RemoteResult<WriteAck>;

    /// Fetches a document.
    async fn get_document(&self, id: &str) -> RemoteResult<RemoteDocument>;

    /// Lists the documents of a workspace.
    async fn list_documents(&self, workspace_id: &str) -> RemoteResult<Page<RemoteDocument>>;

    /// Deletes a document.
    async fn delete_document(&self, id: &str) -> RemoteResult<()>;

    /// Applies a batch of document operations.
    async fn batch(&self, request: &BatchRequest) -> RemoteResult<BatchResponse>;
}

#[derive(Debug, Clone, Default)]
struct MockState {
    workspaces: BTreeMap<String, RemoteWorkspace>,
    folders: BTreeMap<String, RemoteFolder>,
    documents: BTreeMap<String, RemoteDocument>,
    next_id: u64,
}

impl MockState {
    fn allocate(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn insert_document(&mut self, body: &DocumentWrite) -> RemoteResult<WriteAck> {
        if !self.workspaces.contains_key(&body.workspace_id) {
            return Err(RemoteError::NotFound(format!("workspace {}", body.workspace_id)));
        }
        let id = self.allocate("doc");
        let now = Utc::now();
        self.documents.insert(
            id.clone(),
            RemoteDocument {
                id: id.clone(),
                workspace_id: body.workspace_id.clone(),
                folder_id: body.folder_id.clone(),
                title: body.title.clone(),
                content: body.content.clone(),
                version: 1,
                updated_at: now,
                replica_state: body.replica_state.clone(),
            },
        );
        Ok(WriteAck {
            id,
            version: 1,
            updated_at: now,
        })
    }

    fn write_document(
        &mut self,
        id: &str,
        body: &DocumentWrite,
        expected_version: Option<u64>,
    ) -> RemoteResult<WriteAck> {
        let doc = self
            .documents
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(format!("document {id}")))?;
        if let Some(expected) = expected_version {
            if expected != doc.version {
                return Err(RemoteError::Conflict {
                    current_version: Some(doc.version),
                });
            }
        }
        doc.version += 1;
        doc.updated_at = Utc::now();
        doc.title = body.title.clone();
        doc.content = body.content.clone();
        doc.folder_id = body.folder_id.clone();
        if body.replica_state.is_some() {
            doc.replica_state = body.replica_state.clone();
        }
        Ok(WriteAck {
            id: doc.id.clone(),
            version: doc.version,
            updated_at: doc.updated_at,
        })
    }

    fn remove_document(&mut self, id: &str) -> RemoteResult<()> {
        self.documents
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(format!("document {id}")))
    }

    fn apply_batch_op(&mut self, op: &BatchOperation) -> BatchOperationResult {
        let outcome = match op.operation {
            OperationType::Create => match &op.data {
                Some(body) => self.insert_document(body),
                None => Err(RemoteError::Rejected("missing document data".into())),
            },
            OperationType::Update => match (&op.document_id, &op.data) {
                (Some(id), Some(body)) => self.write_document(id, body, op.expected_version),
                _ => Err(RemoteError::Rejected("missing document_id or data".into())),
            },
            OperationType::Delete => match &op.document_id {
                Some(id) => self.remove_document(id).map(|()| WriteAck {
                    id: id.clone(),
                    version: 0,
                    updated_at: Utc::now(),
                }),
                None => Err(RemoteError::Rejected("missing document_id".into())),
            },
        };

        match outcome {
            Ok(ack) => {
                let mut result = BatchOperationResult::success(&op.client_id, ack.id, ack.version);
                if op.operation == OperationType::Delete {
                    result.version = None;
                }
                result
            }
            Err(err @ RemoteError::Conflict { .. }) => {
                BatchOperationResult::failure(&op.client_id, BatchStatus::Conflict, err.to_string())
            }
            Err(err) => {
                let mut result =
                    BatchOperationResult::failure(&op.client_id, BatchStatus::Error, err.to_string());
                result.document_id = op.document_id.clone();
                result
            }
        }
    }
}

/// An in-memory remote store.
///
/// Behaves like the real service for the engine's purposes: versions start
/// at 1 and increase on every update, duplicate workspace names are
/// refused, and batches are applied create → update → delete. Failures can
/// be injected with [`MockRemote::fail_next`] and [`MockRemote::set_reachable`].
#[derive(Debug)]
pub struct MockRemote {
    state: Mutex<MockState>,
    faults: Mutex<VecDeque<RemoteError>>,
    reachable: Mutex<bool>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    /// Creates an empty, reachable remote.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            faults: Mutex::new(VecDeque::new()),
            reachable: Mutex::new(true),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Queues an error returned by the next call, whichever it is.
    pub fn fail_next(&self, error: RemoteError) {
        self.faults.lock().push_back(error);
    }

    /// Makes every call fail with a network error while false.
    pub fn set_reachable(&self, reachable: bool) {
        *self.reachable.lock() = reachable;
    }

    /// Number of calls made to `method`.
    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().get(method).copied().unwrap_or(0)
    }

    /// Total number of calls.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Creates a workspace directly, bypassing fault injection.
    pub fn seed_workspace(&self, name: &str) -> String {
        let mut state = self.state.lock();
        let id = state.allocate("ws");
        state.workspaces.insert(
            id.clone(),
            RemoteWorkspace {
                id: id.clone(),
                name: name.to_string(),
                version: 1,
                updated_at: Utc::now(),
            },
        );
        id
    }

    /// Overwrites a document as another client would, returning the new
    /// version.
    pub fn overwrite_document(
        &self,
        id: &str,
        content: &str,
        replica_state: Option<Vec<u8>>,
    ) -> Option<u64> {
        let mut state = self.state.lock();
        let doc = state.documents.get_mut(id)?;
        doc.version += 1;
        doc.content = content.to_string();
        doc.updated_at = Utc::now();
        if replica_state.is_some() {
            doc.replica_state = replica_state;
        }
        Some(doc.version)
    }

    /// Removes a document as another client would.
    pub fn drop_document(&self, id: &str) -> bool {
        self.state.lock().documents.remove(id).is_some()
    }

    /// Returns a stored document.
    pub fn document(&self, id: &str) -> Option<RemoteDocument> {
        self.state.lock().documents.get(id).cloned()
    }

    /// Returns every stored document.
    pub fn documents(&self) -> Vec<RemoteDocument> {
        self.state.lock().documents.values().cloned().collect()
    }

    /// Returns every stored workspace.
    pub fn workspaces(&self) -> Vec<RemoteWorkspace> {
        self.state.lock().workspaces.values().cloned().collect()
    }

    /// Returns every stored folder.
    pub fn folders(&self) -> Vec<RemoteFolder> {
        self.state.lock().folders.values().cloned().collect()
    }

    fn enter(&self, method: &'static str) -> RemoteResult<()> {
        *self.calls.lock().entry(method).or_insert(0) += 1;
        if !*self.reachable.lock() {
            return Err(RemoteError::Network("remote unreachable".into()));
        }
        match self.faults.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn create_workspace(&self, body: &NewWorkspace) -> RemoteResult<WriteAck> {
        self.enter("create_workspace")?;
        let mut state = self.state.lock();
        if state.workspaces.values().any(|ws| ws.name == body.name) {
            return Err(RemoteError::AlreadyExists(format!("workspace {}", body.name)));
        }
        let id = state.allocate("ws");
        let now = Utc::now();
        state.workspaces.insert(
            id.clone(),
            RemoteWorkspace {
                id: id.clone(),
                name: body.name.clone(),
                version: 1,
                updated_at: now,
            },
        );
        Ok(WriteAck {
            id,
            version: 1,
            updated_at: now,
        })
    }

    async fn list_workspaces(&self) -> RemoteResult<Page<RemoteWorkspace>> {
        self.enter("list_workspaces")?;
        Ok(Page::complete(self.workspaces()))
    }

    async fn delete_workspace(&self, id: &str) -> RemoteResult<()> {
        self.enter("delete_workspace")?;
        let mut state = self.state.lock();
        state
            .workspaces
            .remove(id)
            .ok_or_else(|| RemoteError::NotFound(format!("workspace {id}")))?;
        state.folders.retain(|_, f| f.workspace_id != id);
        state.documents.retain(|_, d| d.workspace_id != id);
        Ok(())
    }

    async fn create_folder(&self, body: &NewFolder) -> RemoteResult<WriteAck> {
        self.enter("create_folder")?;
        let mut state = self.state.lock();
        if !state.workspaces.contains_key(&body.workspace_id) {
            return Err(RemoteError::NotFound(format!("workspace {}", body.workspace_id)));
        }
        if let Some(parent) = &body.parent_id {
            if !state.folders.contains_key(parent) {
                return Err(RemoteError::NotFound(format!("folder {parent}")));
            }
        }
        let duplicate = state.folders.values().any(|f| {
            f.workspace_id == body.workspace_id && f.parent_id == body.parent_id && f.name == body.name
        });
        if duplicate {
            return Err(RemoteError::AlreadyExists(format!("folder {}", body.name)));
        }
        let id = state.allocate("folder");
        let now = Utc::now();
        state.folders.insert(
            id.clone(),
            RemoteFolder {
                id: id.clone(),
                workspace_id: body.workspace_id.clone(),
                parent_id: body.parent_id.clone(),
                name: body.name.clone(),
                version: 1,
                updated_at: now,
            },
        );
        Ok(WriteAck {
            id,
            version: 1,
            updated_at: now,
        })
    }

    async fn list_folders(&self, workspace_id: &str) -> RemoteResult<Page<RemoteFolder>> {
        self.enter("list_folders")?;
        let items = self
            .state
            .lock()
            .folders
            .values()
            .filter(|f| f.workspace_id == workspace_id)
            .cloned()
            .collect();
        Ok(Page::complete(items))
    }

    async fn create_document(&self, body: &DocumentWrite) -> RemoteResult<WriteAck> {
        self.enter("create_document")?;
        self.state.lock().insert_document(body)
    }

    async fn update_document(
        &self,
        id: &str,
        body: &DocumentWrite,
        expected_version: u64,
    ) -> RemoteResult<WriteAck> {
        self.enter("update_document")?;
        self.state
            .lock()
            .write_document(id, body, Some(expected_version))
    }

    async fn get_document(&self, id: &str) -> RemoteResult<RemoteDocument> {
        self.enter("get_document")?;
        self.document(id)
            .ok_or_else(|| RemoteError::NotFound(format!("document {id}")))
    }

    async fn list_documents(&self, workspace_id: &str) -> RemoteResult<Page<RemoteDocument>> {
        self.enter("list_documents")?;
        let items = self
            .state
            .lock()
            .documents
            .values()
            .filter(|d| d.workspace_id == workspace_id)
            .cloned()
            .collect();
        Ok(Page::complete(items))
    }

    async fn delete_document(&self, id: &str) -> RemoteResult<()> {
        self.enter("delete_document")?;
        self.state.lock().remove_document(id)
    }

    async fn batch(&self, request: &BatchRequest) -> RemoteResult<BatchResponse> {
        self.enter("batch")?;
        let started = Instant::now();
        if request.operations.is_empty()
            || request.operations.len() > docsync_protocol::MAX_BATCH_OPERATIONS
        {
            return Err(RemoteError::Rejected(format!(
                "batch must hold 1..={} operations",
                docsync_protocol::MAX_BATCH_OPERATIONS
            )));
        }

        let mut ordered: Vec<&BatchOperation> = request.operations.iter().collect();
        ordered.sort_by_key(|op| op.operation);

        let mut state = self.state.lock();
        let checkpoint = state.clone();
        let mut results = Vec::with_capacity(ordered.len());
        for op in ordered {
            let mut op = op.clone();
            if let Some(data) = op.data.as_mut() {
                data.workspace_id = request.workspace_id.clone();
            }
            let result = state.apply_batch_op(&op);
            if request.atomic && result.status != BatchStatus::Success {
                *state = checkpoint;
                return Err(RemoteError::Rejected(format!(
                    "operation {} failed: {}",
                    op.client_id,
                    result.error.unwrap_or_default()
                )));
            }
            results.push(result);
        }

        Ok(BatchResponse::from_results(
            results,
            started.elapsed().as_millis() as u64,
        ))
    }
}

#[async_trait]
impl ConnectivityProbe for MockRemote {
    async fn check(&self) -> bool {
        *self.reachable.lock()
    }
}
