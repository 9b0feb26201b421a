//! Status command implementation.

use super::open_store;
use docsync_engine::{PendingStore, Repository};
use docsync_protocol::SyncStatus;
use docsync_storage::LocalStore;
use serde::Serialize;
use std::path::Path;

/// Data directory summary.
#[derive(Debug, Serialize)]
pub struct StatusResult {
    /// Data directory.
    pub path: String,
    /// Number of stored keys.
    pub entries: usize,
    /// Total value size in bytes.
    pub bytes: u64,
    /// Number of workspaces.
    pub workspaces: usize,
    /// Number of documents.
    pub documents: usize,
    /// Documents per sync status.
    pub by_status: Vec<StatusCount>,
    /// Queued operations.
    pub pending: usize,
    /// Operations that exhausted their retries.
    pub failed: usize,
}

/// Document count for one status.
#[derive(Debug, Serialize)]
pub struct StatusCount {
    /// Sync status.
    pub status: SyncStatus,
    /// Number of documents.
    pub count: usize,
}

/// Runs the status command.
pub async fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path).await?;
    let info = store.info().await?;
    let repository = Repository::new(store.clone());
    let pending = PendingStore::new(store);
    pending.load().await?;

    let documents = repository.documents(None).await?;
    let by_status = [
        SyncStatus::Local,
        SyncStatus::Pending,
        SyncStatus::Syncing,
        SyncStatus::Synced,
        SyncStatus::Conflict,
        SyncStatus::Error,
    ]
    .into_iter()
    .map(|status| StatusCount {
        status,
        count: documents
            .iter()
            .filter(|d| d.meta.status() == status)
            .count(),
    })
    .collect();

    let result = StatusResult {
        path: path.display().to_string(),
        entries: info.entries,
        bytes: info.bytes,
        workspaces: repository.workspaces().await?.len(),
        documents: documents.len(),
        by_status,
        pending: pending.len(),
        failed: pending.failed().len(),
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &StatusResult) {
    println!("docsync data directory: {}", result.path);
    println!();
    println!("Store:");
    println!("  Entries:    {}", result.entries);
    println!("  Size:       {} bytes", result.bytes);
    println!();
    println!("Entities:");
    println!("  Workspaces: {}", result.workspaces);
    println!("  Documents:  {}", result.documents);
    for entry in &result.by_status {
        if entry.count > 0 {
            println!("    {:<10} {}", entry.status.as_str(), entry.count);
        }
    }
    println!();
    println!("Queue:");
    println!("  Pending:    {}", result.pending);
    println!("  Failed:     {}", result.failed);
}
