//! Snapshot persistence through RocksDB across process restarts.

use std::sync::Arc;

use quill_collab::{
    DocumentId, DocumentRegistry, DocumentStore, Lineage, RegistryConfig, ReplicaId, ReplicaState,
    RocksStore, SnapshotConfig, SnapshotCoordinator, StoreConfig, StoreError,
};

struct Process {
    store: Arc<RocksStore>,
    registry: Arc<DocumentRegistry>,
    snapshots: SnapshotCoordinator,
}

fn boot(path: &std::path::Path, replica: u64) -> Process {
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap());
    let registry = Arc::new(DocumentRegistry::new(
        ReplicaId(replica),
        store.clone(),
        RegistryConfig::for_testing(),
    ));
    let snapshots = SnapshotCoordinator::new(registry.clone(), store.clone(), SnapshotConfig::for_testing());
    Process { store, registry, snapshots }
}

#[tokio::test]
async fn test_edits_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let doc = DocumentId::from("journal");

    {
        let process = boot(dir.path(), 1);
        let handle = process.registry.get_or_create(&doc).await.unwrap();
        handle.edit("Dear diary,".into()).await.unwrap();
        handle.edit("Dear diary, today".into()).await.unwrap();
        process.snapshots.mark_dirty(&doc).await;

        let report = process.snapshots.flush().await;
        assert_eq!(report.saved, 1);
        process.store.sync().unwrap();
    }

    let process = boot(dir.path(), 2);
    let handle = process.registry.get_or_create(&doc).await.unwrap();
    assert_eq!(handle.materialize().await.unwrap(), "Dear diary, today");

    let versions = process.store.versions(&doc).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].content, "Dear diary, today");
}

#[tokio::test]
async fn test_hydrations_of_same_version_agree_on_ids() {
    let dir = tempfile::tempdir().unwrap();
    let doc = DocumentId::from("shared");
    let process = boot(dir.path(), 1);
    process.store.save(&doc, "common base", &ReplicaState::default()).await.unwrap();

    // A second registry on the same store stands in for another instance.
    let other = DocumentRegistry::new(ReplicaId(2), process.store.clone(), RegistryConfig::for_testing());

    let mine = process.registry.get_or_create(&doc).await.unwrap();
    let theirs = other.get_or_create(&doc).await.unwrap();

    let outcome = mine.edit("common database".into()).await.unwrap();
    let remote = theirs.apply_remote(outcome.lineage, outcome.ops).await.unwrap();
    assert!(remote.applied > 0);
    assert_eq!(remote.content, "common database");
}

#[tokio::test]
async fn test_registry_opened_after_a_flush_merges_with_the_writer() {
    let dir = tempfile::tempdir().unwrap();
    let doc = DocumentId::from("shared");
    let process = boot(dir.path(), 1);
    let writer = process.registry.get_or_create(&doc).await.unwrap();
    writer.edit("saved".into()).await.unwrap();
    process.snapshots.mark_dirty(&doc).await;
    assert_eq!(process.snapshots.flush().await.saved, 1);

    // Opened only now: it must rebuild the writer's element ids, not mint its own.
    let other = DocumentRegistry::new(ReplicaId(2), process.store.clone(), RegistryConfig::for_testing());
    let late = other.get_or_create(&doc).await.unwrap();
    assert_eq!(late.materialize().await.unwrap(), "saved");

    let from_writer = writer.edit("saved!".into()).await.unwrap();
    let from_late = late.edit(">saved".into()).await.unwrap();
    let at_late = late.apply_remote(from_writer.lineage, from_writer.ops).await.unwrap();
    let at_writer = writer.apply_remote(from_late.lineage, from_late.ops).await.unwrap();
    assert_eq!(at_writer.content, ">saved!");
    assert_eq!(at_late.content, ">saved!");
}

#[tokio::test]
async fn test_rollback_lineage_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let doc = DocumentId::from("journal");
    let rolled_back = {
        let process = boot(dir.path(), 1);
        let handle = process.registry.get_or_create(&doc).await.unwrap();
        for text in ["one", "two"] {
            handle.edit(text.into()).await.unwrap();
            process.snapshots.mark_dirty(&doc).await;
            process.snapshots.flush().await;
        }
        let head = process.store.rollback(&doc, 1, ReplicaId(7)).await.unwrap();
        process.store.sync().unwrap();
        head.state.lineage
    };
    assert_eq!(rolled_back, Lineage::ORIGIN.next(ReplicaId(7)));

    let process = boot(dir.path(), 2);
    let handle = process.registry.get_or_create(&doc).await.unwrap();
    assert_eq!(handle.materialize().await.unwrap(), "one");
    assert_eq!(handle.lineage().await.unwrap(), rolled_back);
}

#[tokio::test]
async fn test_versions_accumulate_across_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let doc = DocumentId::from("log");
    let process = boot(dir.path(), 1);
    let handle = process.registry.get_or_create(&doc).await.unwrap();

    for text in ["a", "ab", "abc"] {
        handle.edit(text.into()).await.unwrap();
        process.snapshots.mark_dirty(&doc).await;
        process.snapshots.flush().await;
    }

    let versions: Vec<u64> = process
        .store
        .versions(&doc)
        .await
        .unwrap()
        .iter()
        .map(|r| r.version)
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);

    assert_eq!(process.store.rollback(&doc, 2, ReplicaId(3)).await.unwrap().content, "ab");
    assert!(matches!(
        process.store.rollback(&doc, 4, ReplicaId(3)).await,
        Err(StoreError::VersionNotFound { version: 4, .. })
    ));
}
