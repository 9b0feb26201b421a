//! Error types for the sync engine.

use crate::connection::ConnectionState;
use crate::remote::RemoteError;
use docsync_protocol::{EntityKind, ProtocolError};
use docsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Coarse classification of a [`SyncError`], used to decide how the engine
/// reacts to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transient transport failure; retried with backoff.
    Network,
    /// No valid identity; not retried until login.
    Auth,
    /// Version mismatch; pull-merged once, then surfaced.
    Conflict,
    /// Local persistence failure; bounded retries.
    Storage,
    /// The request can never succeed as sent.
    Invalid,
    /// Illegal transition or halted engine; requires a reset.
    Fatal,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote store failed or refused a request.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// No authenticated identity is available.
    #[error("not authenticated: {0}")]
    Auth(String),

    /// Local and remote versions diverged.
    #[error("version conflict on {entity_id}: local={local_version}, remote={remote_version}")]
    Conflict {
        /// Local entity id.
        entity_id: String,
        /// Version the local side expected.
        local_version: u64,
        /// Version the remote reported.
        remote_version: u64,
    },

    /// Local store error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Local record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The replica rejected an update.
    #[error("replica error: {0}")]
    Replica(String),

    /// A local entity referenced by an operation does not exist.
    #[error("unknown {kind} {id}")]
    UnknownEntity {
        /// Entity kind.
        kind: EntityKind,
        /// Local id.
        id: String,
    },

    /// Connection state transition outside the transition table.
    #[error("illegal connection transition from {from} to {to}")]
    IllegalTransition {
        /// Current state.
        from: ConnectionState,
        /// Attempted target state.
        to: ConnectionState,
    },

    /// The connection machine is in the fatal state.
    #[error("sync engine halted; reset required")]
    Halted,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
}

impl SyncError {
    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Remote(err) => err.kind(),
            SyncError::Auth(_) => ErrorKind::Auth,
            SyncError::Conflict { .. } => ErrorKind::Conflict,
            SyncError::Storage(_) | SyncError::Protocol(_) | SyncError::Replica(_) => {
                ErrorKind::Storage
            }
            SyncError::UnknownEntity { .. } => ErrorKind::Invalid,
            SyncError::IllegalTransition { .. } | SyncError::Halted => ErrorKind::Fatal,
            SyncError::Timeout => ErrorKind::Network,
        }
    }

    /// Returns true if the retry queue should try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Storage)
    }

    /// Returns true if this is an authentication failure.
    pub fn is_auth(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }

    /// Creates an unauthenticated error.
    pub fn unauthenticated() -> Self {
        SyncError::Auth("no authenticated session".into())
    }
}
