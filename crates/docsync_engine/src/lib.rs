//! # docsync engine
//!
//! Offline-first sync engine for workspaces, folders and collaboratively
//! edited documents.
//!
//! This crate provides:
//! - Connection state machine with bounded, jittered backoff
//! - Environment classification (reachability, auth mode, platform)
//! - Bidirectional local/remote identifier mapping
//! - Document push/pull with a single merge-and-retry on version conflicts
//! - Debounced, persistent retry queue
//! - Bulk workspace sync
//! - Reference-counted registry of open documents
//! - HTTP remote over an injectable client
//!
//! ## Architecture
//!
//! Local writes always succeed and are pushed later. Each document carries
//! a version number assigned by the remote; every write sends the last
//! acknowledged version, so a stale write is refused instead of silently
//! overwriting remote changes. Content merges happen in the document
//! replica, never by comparing text.
//!
//! ## Key Invariants
//!
//! - The remote is authoritative for versions
//! - At most one queued operation per entity
//! - At most one push or pull per document at a time
//! - A conflicting push is retried exactly once after merging
//! - Identifier mappings are one-to-one in both directions
//! - Connection states never leave the transition table

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod config;
mod connection;
mod environment;
mod error;
mod events;
mod http;
mod mapping;
mod orchestrator;
mod pending;
mod queue;
mod registry;
mod remote;
mod replica;
mod repository;
mod session;

pub use batch::{BatchAggregator, BatchReport};
pub use config::{BackoffConfig, SyncConfig};
pub use connection::{ConnectionMachine, ConnectionState, ConnectionStateInfo, SubscriptionId};
pub use environment::{
    AuthMode, AuthProvider, ConnectivityProbe, EnvironmentClassifier, EnvironmentSnapshot,
    Platform, StaticAuth,
};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use events::{EventBus, SyncEvent};
pub use http::{HttpClient, HttpRemote, HttpRequest, HttpResponse, Method, ReqwestClient};
pub use mapping::MappingService;
pub use orchestrator::{PullOutcome, PushOutcome, SyncOrchestrator};
pub use pending::{FailureDisposition, PendingStore};
pub use queue::{DrainReport, DrainTrigger, SyncQueue};
pub use registry::{replica_key, DocumentRegistry, NetworkAdapter, OpenDocument};
pub use remote::{MockRemote, RemoteApi, RemoteError, RemoteResult};
pub use replica::{ReplicaStore, YrsReplicaStore};
pub use repository::Repository;
pub use session::{LoadSummary, SyncSession};
