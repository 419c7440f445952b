//! 单个对象的同步：比较指纹，必要时流式复制

use crate::core::comparator::{compare, ObjectRelation};
use crate::core::report::{FailureKind, SyncOutcome};
use crate::storage::{ObjectDescriptor, ObjectStore};
use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// 同步一个对象，所有错误都转换为 `Failed`，不会向上传播
pub async fn sync_object(
    source: &dyn ObjectStore,
    dest: &dyn ObjectStore,
    container: &str,
    object: &ObjectDescriptor,
) -> SyncOutcome {
    let name = object.name.as_str();

    let dest_meta = match dest.get_object_metadata(container, name).await {
        Ok(meta) => meta,
        Err(e) => {
            warn!("获取目标元数据失败: {}/{} - {:#}", container, name, e);
            return SyncOutcome::failed(FailureKind::ObjectMetadata, &e);
        }
    };

    match compare(&object.fingerprint, dest_meta.as_ref().map(|m| &m.fingerprint)) {
        ObjectRelation::Unchanged => {
            debug!("跳过未变化对象: {}/{}", container, name);
            return SyncOutcome::SkippedUnchanged;
        }
        ObjectRelation::Missing => debug!("目标不存在: {}/{}", container, name),
        ObjectRelation::Changed => debug!(
            "指纹不同: {}/{} ({} -> {})",
            container,
            name,
            dest_meta.as_ref().map(|m| m.fingerprint.as_str()).unwrap_or_default(),
            object.fingerprint
        ),
    }

    match copy_object(source, dest, container, name).await {
        Ok(bytes) => {
            info!("已复制: {}/{} ({} 字节)", container, name, bytes);
            SyncOutcome::Copied { bytes }
        }
        Err(e) => {
            warn!("复制失败: {}/{} - {:#}", container, name, e);
            SyncOutcome::failed(FailureKind::ObjectCopy, &e)
        }
    }
}

/// 从源流式复制到目标（覆盖写入）
///
/// 读取流在写入结束后（无论成功与否）随 `write_from_stream` 一起释放。
pub async fn copy_object(
    source: &dyn ObjectStore,
    dest: &dyn ObjectStore,
    container: &str,
    object: &str,
) -> Result<u64> {
    let stream = source
        .open_read(container, object)
        .await
        .with_context(|| format!("打开 {} 读取流失败", source.name()))?;

    dest.write_from_stream(container, object, stream)
        .await
        .with_context(|| format!("写入 {} 失败", dest.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn descriptor(store: &MemoryStore, container: &str, object: &str) -> ObjectDescriptor {
        ObjectDescriptor {
            name: object.to_string(),
            fingerprint: store.fingerprint(container, object).unwrap(),
            size: None,
        }
    }

    #[tokio::test]
    async fn test_missing_object_is_copied() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        src.put_object("a", "x.txt", "hello world");
        dst.create_container("a");

        let outcome = sync_object(&src, &dst, "a", &descriptor(&src, "a", "x.txt")).await;

        assert_eq!(outcome, SyncOutcome::Copied { bytes: 11 });
        assert_eq!(dst.object_data("a", "x.txt").unwrap(), "hello world");
        assert_eq!(src.open_stream_count(), 0);
    }

    #[tokio::test]
    async fn test_unchanged_object_is_not_read() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        src.put_object("a", "x.txt", "same");
        dst.put_object("a", "x.txt", "same");

        let outcome = sync_object(&src, &dst, "a", &descriptor(&src, "a", "x.txt")).await;

        assert_eq!(outcome, SyncOutcome::SkippedUnchanged);
        assert_eq!(src.read_count(), 0);
        assert_eq!(dst.write_count(), 0);
    }

    #[tokio::test]
    async fn test_metadata_error_is_isolated() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        src.put_object("a", "x.txt", "data");
        dst.create_container("a");
        dst.fail_metadata("a", "x.txt");

        let outcome = sync_object(&src, &dst, "a", &descriptor(&src, "a", "x.txt")).await;

        assert!(matches!(
            outcome,
            SyncOutcome::Failed { kind: FailureKind::ObjectMetadata, .. }
        ));
        assert_eq!(src.read_count(), 0);
    }

    #[tokio::test]
    async fn test_read_failure_releases_stream() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        src.put_object("a", "x.txt", "0123456789");
        dst.create_container("a");
        src.fail_read("a", "x.txt");

        let outcome = sync_object(&src, &dst, "a", &descriptor(&src, "a", "x.txt")).await;

        assert!(matches!(
            outcome,
            SyncOutcome::Failed { kind: FailureKind::ObjectCopy, .. }
        ));
        assert_eq!(src.open_stream_count(), 0);
        assert!(dst.object_data("a", "x.txt").is_none());
    }
}
