//! Remote API messages.
//!
//! These mirror the JSON bodies of the document service. Replica snapshots
//! travel base64 encoded in `replica_state_b64`.

use crate::operation::OperationType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of operations the remote accepts in one batch request.
pub const MAX_BATCH_OPERATIONS: usize = 100;

mod replica_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|text| STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// A workspace as stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteWorkspace {
    /// Remote id.
    pub id: String,
    /// Name.
    pub name: String,
    /// Remote version.
    #[serde(default)]
    pub version: u64,
    /// Last remote modification.
    pub updated_at: DateTime<Utc>,
}

/// A folder as stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFolder {
    /// Remote id.
    pub id: String,
    /// Remote workspace id.
    pub workspace_id: String,
    /// Remote parent folder id.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Name.
    pub name: String,
    /// Remote version.
    #[serde(default)]
    pub version: u64,
    /// Last remote modification.
    pub updated_at: DateTime<Utc>,
}

/// A document as stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    /// Remote id.
    pub id: String,
    /// Remote workspace id.
    pub workspace_id: String,
    /// Remote folder id.
    #[serde(default)]
    pub folder_id: Option<String>,
    /// Title.
    pub title: String,
    /// Rendered content.
    #[serde(default)]
    pub content: String,
    /// Remote version.
    pub version: u64,
    /// Last remote modification.
    pub updated_at: DateTime<Utc>,
    /// Replica snapshot.
    #[serde(
        default,
        rename = "replica_state_b64",
        with = "replica_b64",
        skip_serializing_if = "Option::is_none"
    )]
    pub replica_state: Option<Vec<u8>>,
}

/// Acknowledgement of a create or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    /// Remote id of the written entity.
    pub id: String,
    /// Version after the write.
    pub version: u64,
    /// Remote modification time after the write.
    pub updated_at: DateTime<Utc>,
}

/// One page of a list response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Total number of items.
    #[serde(default)]
    pub total: u64,
    /// Whether more pages follow.
    #[serde(default)]
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Creates a single, complete page.
    pub fn complete(items: Vec<T>) -> Self {
        let total = items.len() as u64;
        Self {
            items,
            total,
            has_more: false,
        }
    }
}

/// Workspace creation body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWorkspace {
    /// Name.
    pub name: String,
}

/// Folder creation body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFolder {
    /// Remote workspace id.
    pub workspace_id: String,
    /// Remote parent folder id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Name.
    pub name: String,
}

/// Document create/update body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentWrite {
    /// Remote workspace id.
    pub workspace_id: String,
    /// Remote folder id.
    #[serde(default)]
    pub folder_id: Option<String>,
    /// Title.
    pub title: String,
    /// Rendered content, taken from the replica.
    pub content: String,
    /// Replica snapshot.
    #[serde(
        default,
        rename = "replica_state_b64",
        with = "replica_b64",
        skip_serializing_if = "Option::is_none"
    )]
    pub replica_state: Option<Vec<u8>>,
}

/// Result status of one batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Applied.
    Success,
    /// Expected version did not match.
    Conflict,
    /// Failed for another reason.
    Error,
    /// Not attempted.
    Skipped,
}

/// One operation of a batch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOperation {
    /// Operation type.
    pub operation: OperationType,
    /// Correlation id echoed back in the result.
    pub client_id: String,
    /// Remote document id (updates and deletes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    /// Document body (creates and updates).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DocumentWrite>,
    /// Expected version for optimistic locking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

/// Bulk request; all operations target one workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Remote workspace id.
    pub workspace_id: String,
    /// Operations, `1..=MAX_BATCH_OPERATIONS`.
    pub operations: Vec<BatchOperation>,
    /// All-or-nothing when true, best effort otherwise.
    #[serde(default)]
    pub atomic: bool,
}

/// Result of one batch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOperationResult {
    /// Correlation id from the request.
    pub client_id: String,
    /// Outcome.
    pub status: BatchStatus,
    /// Remote document id.
    #[serde(default)]
    pub document_id: Option<String>,
    /// Version after a successful write.
    #[serde(default)]
    pub version: Option<u64>,
    /// Error message for conflicts and errors.
    #[serde(default)]
    pub error: Option<String>,
}

impl BatchOperationResult {
    /// Creates a result with only a status.
    pub fn status(client_id: impl Into<String>, status: BatchStatus) -> Self {
        Self {
            client_id: client_id.into(),
            status,
            document_id: None,
            version: None,
            error: None,
        }
    }

    /// Creates a success result.
    pub fn success(client_id: impl Into<String>, document_id: impl Into<String>, version: u64) -> Self {
        Self {
            document_id: Some(document_id.into()),
            version: Some(version),
            ..Self::status(client_id, BatchStatus::Success)
        }
    }

    /// Creates an error or conflict result.
    pub fn failure(client_id: impl Into<String>, status: BatchStatus, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::status(client_id, status)
        }
    }
}

/// Bulk response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    /// Number of operations received.
    pub total: usize,
    /// Number applied.
    pub successful: usize,
    /// Number of errors and conflicts.
    pub failed: usize,
    /// Per-operation results.
    pub results: Vec<BatchOperationResult>,
    /// Server-side processing time.
    #[serde(default)]
    pub processing_time_ms: u64,
}

impl BatchResponse {
    /// Builds a response from results, deriving the counters.
    pub fn from_results(results: Vec<BatchOperationResult>, processing_time_ms: u64) -> Self {
        let successful = results
            .iter()
            .filter(|r| r.status == BatchStatus::Success)
            .count();
        let failed = results
            .iter()
            .filter(|r| matches!(r.status, BatchStatus::Error | BatchStatus::Conflict))
            .count();
        Self {
            total: results.len(),
            successful,
            failed,
            results,
            processing_time_ms,
        }
    }

    /// Finds the result for a correlation id.
    pub fn result_for(&self, client_id: &str) -> Option<&BatchOperationResult> {
        self.results.iter().find(|r| r.client_id == client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{from_json, to_json};

    #[test]
    fn replica_state_is_base64_on_the_wire() {
        let write = DocumentWrite {
            workspace_id: "ws".into(),
            folder_id: None,
            title: "T".into(),
            content: "body".into(),
            replica_state: Some(vec![1, 2, 3, 250]),
        };

        let json = String::from_utf8(to_json(&write).unwrap()).unwrap();
        assert!(json.contains("\"replica_state_b64\":\"AQID+g==\""));

        let decoded: DocumentWrite = from_json(json.as_bytes()).unwrap();
        assert_eq!(decoded.replica_state, Some(vec![1, 2, 3, 250]));
    }

    #[test]
    fn missing_replica_state_decodes_to_none() {
        let json = br#"{"id":"r1","workspace_id":"w","title":"T","version":2,"updated_at":"2025-12-24T10:00:00Z"}"#;
        let doc: RemoteDocument = from_json(json).unwrap();
        assert_eq!(doc.replica_state, None);
        assert_eq!(doc.content, "");
        assert_eq!(doc.version, 2);
    }

    #[test]
    fn batch_response_counters() {
        let response = BatchResponse::from_results(
            vec![
                BatchOperationResult::success("op_1", "doc_a", 1),
                BatchOperationResult::failure("op_2", BatchStatus::Conflict, "version mismatch"),
                BatchOperationResult::failure("op_3", BatchStatus::Error, "not found"),
                BatchOperationResult::status("op_4", BatchStatus::Skipped),
            ],
            12,
        );

        assert_eq!(response.total, 4);
        assert_eq!(response.successful, 1);
        assert_eq!(response.failed, 2);
        assert_eq!(
            response.result_for("op_2").map(|r| r.status),
            Some(BatchStatus::Conflict)
        );
        assert!(response.result_for("op_9").is_none());
    }

    #[test]
    fn batch_operation_wire_names() {
        let op = BatchOperation {
            operation: OperationType::Delete,
            client_id: "op_9012".into(),
            document_id: Some("doc_xyz789".into()),
            data: None,
            expected_version: None,
        };
        let json = String::from_utf8(to_json(&op).unwrap()).unwrap();
        assert!(json.contains("\"operation\":\"delete\""));
        assert!(!json.contains("expected_version"));
    }
}
