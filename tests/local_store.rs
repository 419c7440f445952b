use std::fs;
use std::path::Path;
use std::sync::Arc;

use blobsync::config::{StoreConfig, StoreType};
use blobsync::core::{RunStatus, SyncEngine};
use blobsync::storage::{create_store, EnsureOutcome, ListedObject, LocalStorage, ObjectStore};
use blobsync::{FingerprintSource, SyncError};
use futures::TryStreamExt;
use tempfile::TempDir;

fn write_file(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn local(dir: &TempDir) -> Arc<LocalStorage> {
    Arc::new(LocalStorage::new(dir.path().to_str().unwrap()).unwrap())
}

#[tokio::test]
async fn test_local_to_local_sync() {
    let src_dir = TempDir::new().unwrap();
    let dst_dir = TempDir::new().unwrap();
    write_file(src_dir.path(), "photos/2024/a.jpg", "jpeg bytes");
    write_file(src_dir.path(), "photos/b.jpg", "more bytes");
    write_file(src_dir.path(), "docs/readme.md", "# readme");
    // 顶层文件不属于任何容器
    write_file(src_dir.path(), "stray.txt", "ignored");

    let src = local(&src_dir);
    let dst = local(&dst_dir);

    let summary = SyncEngine::new(src.clone(), dst.clone()).run_sync().await;
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.containers_processed, 2);
    assert_eq!(summary.objects_copied, 3);
    assert_eq!(
        fs::read_to_string(dst_dir.path().join("photos/2024/a.jpg")).unwrap(),
        "jpeg bytes"
    );
    assert!(!dst_dir.path().join("stray.txt").exists());

    // 第二次运行不复制任何内容
    let summary = SyncEngine::new(src.clone(), dst.clone()).run_sync().await;
    assert_eq!(summary.objects_copied, 0);
    assert_eq!(summary.objects_skipped, 3);

    // 修改一个文件后只复制它
    write_file(src_dir.path(), "docs/readme.md", "# readme v2");
    let summary = SyncEngine::new(src, dst).run_sync().await;
    assert_eq!(summary.objects_copied, 1);
    assert_eq!(
        fs::read_to_string(dst_dir.path().join("docs/readme.md")).unwrap(),
        "# readme v2"
    );
}

#[tokio::test]
async fn test_local_ensure_container_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = local(&dir);

    assert_eq!(
        store.ensure_container("backup").await.unwrap(),
        EnsureOutcome::Created
    );
    assert_eq!(
        store.ensure_container("backup").await.unwrap(),
        EnsureOutcome::AlreadyExists
    );
    assert!(store.ensure_container("../escape").await.is_err());
}

#[tokio::test]
async fn test_local_metadata_and_listing() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path(), "c/x.txt", "abc");
    write_file(dir.path(), "c/x.txt.blobsync-tmp", "partial");
    let store = local(&dir);

    assert!(store.get_object_metadata("c", "missing").await.unwrap().is_none());
    let meta = store.get_object_metadata("c", "x.txt").await.unwrap().unwrap();
    assert_eq!(meta.size, Some(3));

    let objects: Vec<_> = store
        .list_objects("c")
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].name(), "x.txt");
    match &objects[0] {
        ListedObject::Found(listed) => assert_eq!(listed.fingerprint, meta.fingerprint),
        other => panic!("unexpected listing entry: {:?}", other),
    }
}

fn local_config(path: &Path) -> StoreConfig {
    StoreConfig {
        typ: StoreType::Local,
        url: path.to_str().unwrap().to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_missing_source_root_aborts_run() {
    let dir = TempDir::new().unwrap();
    let typo = dir.path().join("sourse");
    let dst_dir = TempDir::new().unwrap();

    let src = create_store(&local_config(&typo), FingerprintSource::ETag)
        .await
        .unwrap();
    let summary = SyncEngine::new(src, local(&dst_dir)).run_sync().await;

    assert_eq!(summary.status, RunStatus::Aborted);
    assert!(matches!(
        summary.abort_reason,
        Some(SyncError::Connectivity(_))
    ));
    assert!(!typo.exists());
}

#[tokio::test]
async fn test_destination_root_is_created_on_first_container() {
    let src_dir = TempDir::new().unwrap();
    write_file(src_dir.path(), "photos/a.jpg", "jpeg bytes");
    let dir = TempDir::new().unwrap();
    let dst_root = dir.path().join("replica");

    let dst = Arc::new(LocalStorage::new(dst_root.to_str().unwrap()).unwrap());
    let summary = SyncEngine::new(local(&src_dir), dst).run_sync().await;

    assert!(summary.is_completed());
    assert_eq!(summary.objects_copied, 1);
    assert!(dst_root.join("photos/a.jpg").is_file());
}
