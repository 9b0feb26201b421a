//! # docsync storage
//!
//! Local durable store for the docsync engine.
//!
//! Stores are **opaque key-value stores**: keys are `/`-separated strings
//! (`documents/<id>`, `replica/<id>`, `mappings/workspace`), values are
//! byte blobs. The engine owns all encoding.
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral sessions
//! - [`FileStore`] - One file per key under a root directory
//!
//! ## Example
//!
//! ```rust
//! use docsync_storage::{InMemoryStore, LocalStore};
//!
//! # tokio_test_block_on(async {
//! let store = InMemoryStore::new();
//! store.write("documents/a", b"hello").await.unwrap();
//! assert_eq!(store.read("documents/a").await.unwrap(), Some(b"hello".to_vec()));
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::{validate_key, LocalStore, StoreInfo};
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
