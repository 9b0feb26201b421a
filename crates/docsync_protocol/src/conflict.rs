//! Conflict detection records and resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides changed the content.
    Content,
    /// One side deleted the entity while the other changed it.
    Deletion,
}

/// Resolution for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Keep the local version and push it over the remote one.
    KeepLocal,
    /// Discard local changes and adopt the remote version.
    AcceptRemote,
    /// Keep the replica merge of both sides and push it.
    Merge,
}

impl ConflictResolution {
    /// Returns true if resolving this way requires another push.
    pub fn requires_push(&self) -> bool {
        matches!(self, ConflictResolution::KeepLocal | ConflictResolution::Merge)
    }
}

/// A divergence between local and remote versions of an entity.
///
/// Conflicts are only consumed by an explicit resolution; the engine never
/// drops one on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Local entity id.
    pub entity_id: String,
    /// Version the local side expected.
    pub local_version: u64,
    /// Version the remote side reported.
    pub remote_version: u64,
    /// What diverged.
    pub kind: ConflictKind,
    /// Detection time.
    pub detected_at: DateTime<Utc>,
    /// Resolution, once chosen.
    pub resolution: Option<ConflictResolution>,
}

impl Conflict {
    /// Creates a new unresolved conflict.
    pub fn new(
        entity_id: impl Into<String>,
        local_version: u64,
        remote_version: u64,
        kind: ConflictKind,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            local_version,
            remote_version,
            kind,
            detected_at: Utc::now(),
            resolution: None,
        }
    }

    /// Creates a content conflict.
    pub fn content(entity_id: impl Into<String>, local_version: u64, remote_version: u64) -> Self {
        Self::new(entity_id, local_version, remote_version, ConflictKind::Content)
    }

    /// Creates a deletion conflict.
    pub fn deletion(entity_id: impl Into<String>, local_version: u64) -> Self {
        Self::new(entity_id, local_version, 0, ConflictKind::Deletion)
    }

    /// Resolves the conflict with the given resolution.
    pub fn resolve(&mut self, resolution: ConflictResolution) {
        self.resolution = Some(resolution);
    }

    /// Returns true if the conflict has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_kinds() {
        let content = Conflict::content("doc", 1, 2);
        assert_eq!(content.kind, ConflictKind::Content);
        assert_eq!(content.remote_version, 2);

        let deletion = Conflict::deletion("doc", 3);
        assert_eq!(deletion.kind, ConflictKind::Deletion);
        assert_eq!(deletion.local_version, 3);
    }

    #[test]
    fn resolution() {
        let mut conflict = Conflict::content("doc", 1, 2);
        assert!(!conflict.is_resolved());

        conflict.resolve(ConflictResolution::AcceptRemote);
        assert!(conflict.is_resolved());
        assert!(!ConflictResolution::AcceptRemote.requires_push());
        assert!(ConflictResolution::Merge.requires_push());
        assert!(ConflictResolution::KeepLocal.requires_push());
    }
}
