//! The same contract checks run against every local backend.

use shipyard_store::fakes::MemoryObjectStore;
use shipyard_store::{FsObjectStore, ObjectStore, StorageError};

async fn exercise(store: &dyn ObjectStore) {
    let slot = "sboms/release/lite/quay.io/mongodb/operator/1.2.0/linux-amd64/";
    assert!(!store.exists(slot).await.unwrap());

    let key = format!("{slot}sha256:0a1b");
    store.put(&key, br#"{"bomFormat":"CycloneDX"}"#).await.unwrap();

    assert!(store.exists(slot).await.unwrap());
    assert_eq!(store.find_first(slot).await.unwrap(), Some(key.clone()));
    assert_eq!(
        store.get(&key).await.unwrap(),
        br#"{"bomFormat":"CycloneDX"}"#.to_vec()
    );

    // A sibling tag sharing a textual prefix is a different slot.
    assert!(!store
        .exists("sboms/release/lite/quay.io/mongodb/operator/1.2.0-rc1/")
        .await
        .unwrap());

    assert!(matches!(
        store.get("sboms/missing").await,
        Err(StorageError::NotFound { .. })
    ));
}

#[tokio::test]
async fn memory_store_contract() {
    exercise(&MemoryObjectStore::new()).await;
}

#[tokio::test]
async fn fs_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsObjectStore::new(dir.path()).unwrap();
    exercise(&store).await;
}
