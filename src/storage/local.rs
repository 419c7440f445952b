//! 本地目录存储：根目录下的一级子目录视为容器
//!
//! 本地文件系统没有 ETag，指纹使用 blake3 内容哈希，
//! 因此复制后源和目标的指纹一致。

use super::{
    ByteStream, ContainerDescriptor, EnsureOutcome, Fingerprint, ListedObject, ObjectDescriptor,
    ObjectStore,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_stream::wrappers::ReadDirStream;
use tokio_util::io::ReaderStream;
use walkdir::WalkDir;

/// 写入过程中的临时文件后缀，列出对象时跳过
const TEMP_SUFFIX: &str = ".blobsync-tmp";

pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

/// 计算文件的 blake3 哈希
async fn hash_file(path: PathBuf) -> Result<Fingerprint> {
    let hash = tokio::task::spawn_blocking(move || -> std::io::Result<blake3::Hash> {
        let mut hasher = blake3::Hasher::new();
        let file = std::fs::File::open(&path)?;
        hasher.update_reader(file)?;
        Ok(hasher.finalize())
    })
    .await??;
    Ok(Fingerprint::new(hash.to_hex().to_string()))
}

impl LocalStorage {
    /// 不创建根目录：根目录不存在时列出容器失败，创建容器时才建立它
    pub fn new(path: &str) -> Result<Self> {
        let base_path = PathBuf::from(path);
        if base_path.exists() && !base_path.is_dir() {
            bail!("{} 不是目录", path);
        }
        let name = format!("local:{}", path);
        Ok(Self { base_path, name })
    }

    fn container_path(&self, container: &str) -> Result<PathBuf> {
        check_relative(container)?;
        Ok(self.base_path.join(container))
    }

    fn object_path(&self, container: &str, object: &str) -> Result<PathBuf> {
        check_relative(object)?;
        Ok(self.container_path(container)?.join(object))
    }
}

/// 拒绝绝对路径和 `..`，防止越出根目录
fn check_relative(name: &str) -> Result<()> {
    let path = Path::new(name);
    if name.is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        bail!("非法名称: {:?}", name);
    }
    Ok(())
}

/// 目录项是子目录时作为容器
async fn container_from_entry(entry: fs::DirEntry) -> Result<Option<ContainerDescriptor>> {
    if !entry.file_type().await?.is_dir() {
        return Ok(None);
    }
    let name = entry
        .file_name()
        .into_string()
        .map_err(|n| anyhow!("目录名不是 UTF-8: {:?}", n))?;
    Ok(Some(ContainerDescriptor { name }))
}

/// 遍历到的一项：可读文件，或无法读取的路径
enum WalkItem {
    File { name: String, path: PathBuf, size: u64 },
    Unreadable { name: String, reason: String },
}

/// 遍历容器目录，跳过临时文件；遍历错误作为 `Unreadable` 保留
fn walk_container(base: &Path) -> Vec<WalkItem> {
    let relative_name = |path: &Path| {
        path.strip_prefix(base)
            .ok()
            .and_then(normalize_path)
            .unwrap_or_else(|| path.display().to_string())
    };

    let mut items = Vec::new();
    for entry in WalkDir::new(base).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let name = e
                    .path()
                    .map(relative_name)
                    .unwrap_or_else(|| base.display().to_string());
                items.push(WalkItem::Unreadable {
                    name,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let name = relative_name(entry.path());
        if name.ends_with(TEMP_SUFFIX) {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => items.push(WalkItem::File {
                name,
                path: entry.into_path(),
                size: meta.len(),
            }),
            Err(e) => items.push(WalkItem::Unreadable {
                name,
                reason: e.to_string(),
            }),
        }
    }
    items
}

async fn describe_item(item: WalkItem) -> ListedObject {
    match item {
        WalkItem::File { name, path, size } => match hash_file(path).await {
            Ok(fingerprint) => ListedObject::Found(ObjectDescriptor {
                name,
                fingerprint,
                size: Some(size),
            }),
            Err(e) => ListedObject::unreadable(name, &e),
        },
        WalkItem::Unreadable { name, reason } => ListedObject::Unreadable { name, reason },
    }
}

/// 规范化路径分隔符（统一使用 /）
fn normalize_path(path: &Path) -> Option<String> {
    path.to_str().map(|p| p.replace('\\', "/"))
}

#[async_trait]
impl ObjectStore for LocalStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_containers(&self) -> Result<BoxStream<'_, Result<ContainerDescriptor>>> {
        let dir = fs::read_dir(&self.base_path)
            .await
            .with_context(|| format!("无法读取根目录 {}", self.base_path.display()))?;
        let entries = ReadDirStream::new(dir);

        let stream = entries
            .map_err(anyhow::Error::from)
            .try_filter_map(container_from_entry);

        Ok(stream.boxed())
    }

    async fn ensure_container(&self, name: &str) -> Result<EnsureOutcome> {
        let path = self.container_path(name)?;
        fs::create_dir_all(&self.base_path).await?;
        match fs::create_dir(&path).await {
            Ok(()) => Ok(EnsureOutcome::Created),
            Err(e) if e.kind() == ErrorKind::AlreadyExists && path.is_dir() => {
                Ok(EnsureOutcome::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_objects(
        &self,
        container: &str,
    ) -> Result<BoxStream<'_, Result<ListedObject>>> {
        let base = self.container_path(container)?;
        if !base.is_dir() {
            bail!("容器不存在: {}", container);
        }

        // 使用 spawn_blocking 避免阻塞 async runtime
        let items = tokio::task::spawn_blocking(move || walk_container(&base)).await?;

        // 指纹按需计算，列表保持惰性
        let stream = stream::iter(items).then(|item| async move {
            Ok::<_, anyhow::Error>(describe_item(item).await)
        });

        Ok(stream.boxed())
    }

    async fn get_object_metadata(
        &self,
        container: &str,
        object: &str,
    ) -> Result<Option<ObjectDescriptor>> {
        let path = self.object_path(container, object)?;
        let metadata = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            bail!("{} 是目录，不是对象", path.display());
        }

        Ok(Some(ObjectDescriptor {
            name: object.to_string(),
            fingerprint: hash_file(path).await?,
            size: Some(metadata.len()),
        }))
    }

    async fn open_read(&self, container: &str, object: &str) -> Result<ByteStream> {
        let file = fs::File::open(self.object_path(container, object)?).await?;
        Ok(Box::pin(ReaderStream::new(file).map_err(anyhow::Error::from)))
    }

    async fn write_from_stream(
        &self,
        container: &str,
        object: &str,
        mut stream: ByteStream,
    ) -> Result<u64> {
        let full_path = self.object_path(container, object)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 使用临时文件写入，然后原子重命名
        let mut temp_name = full_path.clone().into_os_string();
        temp_name.push(TEMP_SUFFIX);
        let temp_path = PathBuf::from(temp_name);

        let result: Result<u64> = async {
            let mut file = fs::File::create(&temp_path).await?;
            let mut written = 0u64;
            while let Some(chunk) = stream.try_next().await? {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.sync_all().await?;
            Ok(written)
        }
        .await;

        match result {
            Ok(written) => {
                fs::rename(&temp_path, &full_path).await?;
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[test]
    fn test_check_relative() {
        assert!(check_relative("a/b.txt").is_ok());
        assert!(check_relative("../etc/passwd").is_err());
        assert!(check_relative("/abs").is_err());
        assert!(check_relative("").is_err());
    }

    #[test]
    fn test_walk_errors_are_kept_as_unreadable() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ok.txt"), "ok").unwrap();
        std::fs::write(dir.path().join("ok.txt.blobsync-tmp"), "partial").unwrap();

        // 遍历不存在的目录，walkdir 在第一项报错
        let missing = dir.path().join("gone");
        let items = walk_container(&missing);
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], WalkItem::Unreadable { .. }));

        let items = walk_container(dir.path());
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], WalkItem::File { name, size: 2, .. } if name == "ok.txt"));
    }

    #[tokio::test]
    async fn test_hash_failure_becomes_unreadable() {
        let dir = TempDir::new().unwrap();
        let item = WalkItem::File {
            name: "vanished.txt".to_string(),
            path: dir.path().join("vanished.txt"),
            size: 3,
        };
        match describe_item(item).await {
            ListedObject::Unreadable { name, .. } => assert_eq!(name, "vanished.txt"),
            other => panic!("expected unreadable, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_root_is_not_created() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("typo");
        LocalStorage::new(root.to_str().unwrap()).unwrap();
        assert!(!root.exists());

        let file = dir.path().join("file");
        std::fs::write(&file, "x").unwrap();
        assert!(LocalStorage::new(file.to_str().unwrap()).is_err());
    }
}
