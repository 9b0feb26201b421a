//! Local → remote identifier mapping rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of an identifier mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierMapping {
    /// Local id.
    pub local_id: String,
    /// Remote id.
    pub remote_id: String,
    /// Name at the time of mapping, for diagnostics.
    pub display_name: String,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

impl IdentifierMapping {
    /// Creates a mapping row timestamped now.
    pub fn new(
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            display_name: display_name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Outcome of recording a mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingOutcome {
    /// A new row was written.
    Inserted,
    /// The local id was remapped to a new remote id.
    Refreshed {
        /// Remote id it pointed to before.
        previous_remote_id: String,
    },
    /// The row already existed as given.
    Unchanged,
    /// The remote id is owned by another local id; nothing was written.
    Rejected {
        /// Local id that owns the remote id.
        existing_local_id: String,
    },
}

impl MappingOutcome {
    /// Returns true if the local id now maps to the requested remote id.
    pub fn is_mapped(&self) -> bool {
        !matches!(self, MappingOutcome::Rejected { .. })
    }
}
