//! # docsync Protocol
//!
//! Entity, operation and wire types shared by the docsync engine and its
//! collaborators.
//!
//! This crate provides:
//! - `SyncMeta` and the workspace/folder/document records it decorates
//! - `PendingOperation` with a typed `EntityPayload` per entity kind
//! - `Conflict` for divergent versions
//! - `IdentifierMapping` rows for local → remote ids
//! - Remote API messages, including the bulk batch request/response
//! - CBOR (local persistence) and JSON (wire) codecs
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod conflict;
mod entity;
mod mapping;
mod messages;
mod operation;

pub use codec::{from_cbor, from_json, to_cbor, to_json, ProtocolError, ProtocolResult};
pub use conflict::{Conflict, ConflictKind, ConflictResolution};
pub use entity::{
    new_id, DocumentRecord, EntityKind, FolderRecord, SyncMeta, SyncStatus, WorkspaceRecord,
};
pub use mapping::{IdentifierMapping, MappingOutcome};
pub use messages::{
    BatchOperation, BatchOperationResult, BatchRequest, BatchResponse, BatchStatus,
    DocumentWrite, NewFolder, NewWorkspace, Page, RemoteDocument, RemoteFolder, RemoteWorkspace,
    WriteAck, MAX_BATCH_OPERATIONS,
};
pub use operation::{
    DocumentPayload, EntityPayload, FailedOperation, FolderPayload, OperationType,
    PendingOperation, Priority, WorkspacePayload,
};
