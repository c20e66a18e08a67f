// Create-if-absent must have exactly one winner no matter how many writers race.

mod common;

use common::{metadata, seeded_bytes, source, test_store};
use futures::TryStreamExt;
use modproxy_storage::{ObjectStore, ObjectStoreExt, StorageError};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_create_has_single_winner() {
    let store = test_store().await;
    let key = "concat/example.com/race@v1.0.0";

    let mut handles = Vec::new();
    for seed in 0..16u64 {
        let backend = store.backend.clone();
        handles.push(tokio::spawn(async move {
            let data = seeded_bytes(seed, 64 * 1024);
            let result = backend
                .create_exclusive(key, metadata(&[("seed", &seed.to_string())]), source(data))
                .await;
            (seed, result)
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        let (seed, result) = handle.await.unwrap();
        match result {
            Ok(()) => winners.push(seed),
            Err(StorageError::PreconditionFailed(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(winners.len(), 1, "winners: {winners:?}");

    // The stored bytes and metadata belong to the single winner.
    let winner = winners[0];
    let stored = store.backend.get_bytes(key).await.unwrap();
    assert_eq!(stored, seeded_bytes(winner, 64 * 1024));
    let meta = store.backend.get_metadata(key).await.unwrap();
    assert_eq!(meta.get("seed"), Some(&winner.to_string()));

    // Losers leave no data files behind.
    let dir = store.dir.path().join("concat/example.com");
    let files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(files.len(), 2, "files: {files:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_delete_has_single_winner() {
    let store = test_store().await;
    let key = "gomod/example.com/a@v1.0.0";
    store
        .backend
        .create_exclusive(key, metadata(&[]), source(seeded_bytes(1, 10)))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let backend = store.backend.clone();
        handles.push(tokio::spawn(async move { backend.delete(key).await }));
    }

    let mut deleted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => deleted += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }
    assert_eq!(deleted, 1);
}

#[tokio::test]
async fn test_listing_during_concurrent_creates() {
    let store = test_store().await;
    for i in 0..20 {
        store
            .backend
            .create_exclusive(&format!("test/{i:03}"), metadata(&[]), source(seeded_bytes(i, 8)))
            .await
            .unwrap();
    }

    let backend = store.backend.clone();
    let creator = tokio::spawn(async move {
        for i in 20..40 {
            backend
                .create_exclusive(&format!("test/{i:03}"), metadata(&[]), source(seeded_bytes(i, 8)))
                .await
                .unwrap();
        }
    });

    let keys: Vec<String> = store.backend.list_stream("test/").try_collect().await.unwrap();
    creator.await.unwrap();

    assert!(keys.len() >= 20 && keys.len() <= 40, "got {}", keys.len());
    let mut sorted = keys.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), keys.len(), "listing returned duplicates");
}
