//! Pending command implementation.

use super::open_store;
use docsync_engine::PendingStore;
use docsync_protocol::{FailedOperation, PendingOperation};
use serde::Serialize;
use std::path::Path;

/// Queue contents.
#[derive(Debug, Serialize)]
pub struct PendingResult {
    /// Queued operations in drain order.
    pub queued: Vec<PendingOperation>,
    /// Operations that exhausted their retries.
    pub failed: Vec<FailedOperation>,
}

/// Runs the pending command.
pub async fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path).await?;
    let pending = PendingStore::new(store);
    pending.load().await?;
    let result = PendingResult {
        queued: pending.ordered(),
        failed: pending.failed(),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => {
            println!("Queued ({}):", result.queued.len());
            for op in &result.queued {
                println!(
                    "  {:<8} {:<9} {}  priority={:?} retries={}{}",
                    op.operation.as_str(),
                    op.target.as_str(),
                    op.entity_id,
                    op.priority,
                    op.retry_count,
                    op.last_error
                        .as_deref()
                        .map(|e| format!(" last_error={e}"))
                        .unwrap_or_default()
                );
            }
            println!("Failed ({}):", result.failed.len());
            for failed in &result.failed {
                println!(
                    "  {:<8} {:<9} {}  at {}: {}",
                    failed.operation.operation.as_str(),
                    failed.operation.target.as_str(),
                    failed.operation.entity_id,
                    failed.failed_at.to_rfc3339(),
                    failed.error
                );
            }
        }
    }

    Ok(())
}
