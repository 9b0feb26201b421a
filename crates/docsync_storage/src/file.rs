//! File-based store for persistent storage.

use crate::backend::{validate_key, LocalStore, StoreInfo};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tracing::debug;

/// A directory-backed store with one file per key.
///
/// Key segments map to path components, so `documents/abc` lives at
/// `<root>/documents/abc`.
///
/// # Durability
///
/// Writes go to a hidden sibling temp file which is synced and then renamed
/// over the target, so a crash leaves either the old or the new value.
///
/// # Example
///
/// ```no_run
/// use docsync_storage::{FileStore, LocalStore};
///
/// # async fn demo() -> docsync_storage::StorageResult<()> {
/// let store = FileStore::new("/var/lib/docsync");
/// store.init().await?;
/// store.write("documents/abc", b"persistent data").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    initialized: AtomicBool,
}

impl FileStore {
    /// Creates a store rooted at `root`. Call [`LocalStore::init`] before use.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            initialized: AtomicBool::new(false),
        }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_initialized(&self) -> StorageResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::NotInitialized)
        }
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, seg| path.join(seg)))
    }

    /// Walks the tree under the root and returns every key with its size.
    async fn walk(&self) -> StorageResult<Vec<(String, u64)>> {
        let mut found = Vec::new();
        let mut stack = vec![(self.root.clone(), String::new())];

        while let Some((dir, prefix)) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let key = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}/{name}")
                };
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    stack.push((entry.path(), key));
                } else {
                    found.push((key, meta.len()));
                }
            }
        }

        found.sort();
        Ok(found)
    }
}

#[async_trait]
impl LocalStore for FileStore {
    async fn init(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.root).await?;
        self.initialized.store(true, Ordering::Release);
        debug!(root = %self.root.display(), "file store initialized");
        Ok(())
    }

    async fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.ensure_initialized()?;
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.ensure_initialized()?;
        let path = self.path_for(key)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{file_name}.tmp"));

        let mut file = fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, value).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.ensure_initialized()?;
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.ensure_initialized()?;
        Ok(self
            .walk()
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(prefix))
            .collect())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.ensure_initialized()?;
        let path = self.path_for(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn clear(&self) -> StorageResult<()> {
        self.ensure_initialized()?;
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn info(&self) -> StorageResult<StoreInfo> {
        self.ensure_initialized()?;
        let entries = self.walk().await?;
        Ok(StoreInfo {
            backend: "file",
            entries: entries.len(),
            bytes: entries.iter().map(|(_, size)| size).sum(),
        })
    }
}
