//! Conflicts command implementation.

use super::open_store;
use docsync_engine::Repository;
use std::path::Path;

/// Runs the conflicts command.
pub async fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path).await?;
    let conflicts = Repository::new(store).conflicts().await?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&conflicts)?),
        _ => {
            if conflicts.is_empty() {
                println!("No unresolved conflicts");
            }
            for conflict in &conflicts {
                println!(
                    "{}  {:?}  local v{} / remote v{}  detected {}",
                    conflict.entity_id,
                    conflict.kind,
                    conflict.local_version,
                    conflict.remote_version,
                    conflict.detected_at.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}
