//! Behaviour shared by every `LocalStore` implementation.

use docsync_storage::{FileStore, InMemoryStore, LocalStore};
use proptest::prelude::*;
use std::collections::BTreeMap;

async fn exercise(store: &dyn LocalStore) {
    store.init().await.unwrap();
    store.init().await.unwrap();

    store.write("workspaces/w1", b"ws").await.unwrap();
    store.write("documents/d1", b"doc-1").await.unwrap();
    store.write("documents/d2", b"doc-2").await.unwrap();
    store.write("mappings/document", b"rows").await.unwrap();

    assert_eq!(
        store.list("documents/").await.unwrap(),
        vec!["documents/d1".to_string(), "documents/d2".to_string()]
    );
    assert_eq!(store.read("documents/d2").await.unwrap(), Some(b"doc-2".to_vec()));
    assert!(store.exists("mappings/document").await.unwrap());

    assert!(store.delete("documents/d1").await.unwrap());
    assert_eq!(store.list("documents/").await.unwrap().len(), 1);

    let info = store.info().await.unwrap();
    assert_eq!(info.entries, 3);
    assert_eq!(info.bytes, 2 + 5 + 4);

    store.clear().await.unwrap();
    assert!(store.list("").await.unwrap().is_empty());
}

#[tokio::test]
async fn memory_store_conformance() {
    exercise(&InMemoryStore::new()).await;
}

#[tokio::test]
async fn file_store_conformance() {
    let dir = tempfile::tempdir().unwrap();
    exercise(&FileStore::new(dir.path().join("data"))).await;
}

#[derive(Debug, Clone)]
enum Op {
    Write(String, Vec<u8>),
    Delete(String),
}

fn key() -> impl Strategy<Value = String> {
    prop_oneof![Just("documents"), Just("replica"), Just("pending")]
        .prop_flat_map(|ns| "[a-z0-9]{1,4}".prop_map(move |id| format!("{ns}/{id}")))
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (key(), proptest::collection::vec(any::<u8>(), 0..16)).prop_map(|(k, v)| Op::Write(k, v)),
        key().prop_map(Op::Delete),
    ]
}

proptest! {
    #[test]
    fn memory_store_matches_model(ops in proptest::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let store = InMemoryStore::new();
            let mut model = BTreeMap::new();

            for op in ops {
                match op {
                    Op::Write(k, v) => {
                        store.write(&k, &v).await.unwrap();
                        model.insert(k, v);
                    }
                    Op::Delete(k) => {
                        let existed = store.delete(&k).await.unwrap();
                        assert_eq!(existed, model.remove(&k).is_some());
                    }
                }
            }

            let keys: Vec<String> = model.keys().cloned().collect();
            assert_eq!(store.list("").await.unwrap(), keys);
            for (k, v) in &model {
                assert_eq!(store.read(k).await.unwrap().as_ref(), Some(v));
            }
        });
    }
}
