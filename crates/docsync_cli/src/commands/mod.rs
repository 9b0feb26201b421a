//! CLI command implementations.

pub mod conflicts;
pub mod mappings;
pub mod pending;
pub mod probe;
pub mod status;
pub mod sync;

use docsync_storage::{FileStore, LocalStore};
use std::path::Path;
use std::sync::Arc;

/// Opens the file store at `path`, failing if the directory does not exist.
pub async fn open_store(path: &Path) -> Result<Arc<FileStore>, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No data directory found at {:?}", path).into());
    }
    let store = Arc::new(FileStore::new(path));
    store.init().await?;
    Ok(store)
}
