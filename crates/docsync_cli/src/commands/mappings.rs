//! Mappings command implementation.

use super::open_store;
use docsync_engine::MappingService;
use docsync_protocol::{EntityKind, IdentifierMapping};
use serde::Serialize;
use std::path::Path;

/// Mapping rows of one entity kind.
#[derive(Debug, Serialize)]
pub struct MappingTable {
    /// Entity kind.
    pub kind: EntityKind,
    /// Rows.
    pub rows: Vec<IdentifierMapping>,
}

/// Runs the mappings command.
pub async fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path).await?;
    let mappings = MappingService::new(store);
    mappings.load().await?;
    let tables: Vec<MappingTable> = [EntityKind::Workspace, EntityKind::Folder, EntityKind::Document]
        .into_iter()
        .map(|kind| MappingTable {
            kind,
            rows: mappings.entries(kind),
        })
        .collect();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&tables)?),
        _ => {
            for table in &tables {
                println!("{} ({}):", table.kind, table.rows.len());
                for row in &table.rows {
                    println!("  {} -> {}  {}", row.local_id, row.remote_id, row.display_name);
                }
            }
        }
    }

    Ok(())
}
