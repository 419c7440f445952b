//! 以顶层目录作为容器的 OpenDAL 存储（S3 bucket、WebDAV 根目录）
//!
//! 这里也放置 OpenDAL 对象操作的公共实现，Azure Blob 存储复用它们。

use super::{
    normalize_etag, ByteStream, ContainerDescriptor, EnsureOutcome, Fingerprint,
    FingerprintSource, ListedObject, ObjectDescriptor, ObjectStore, IO_TIMEOUT_SECS,
    OP_TIMEOUT_SECS,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, StreamExt, TryStreamExt};
use opendal::{layers::TimeoutLayer, Entry, Metadata, Metakey, Operator};
use std::time::Duration;
use tracing::debug;

/// 构建带超时层的 Operator
pub(crate) fn build_operator<B: opendal::Builder>(builder: B) -> Result<Operator> {
    let operator = Operator::new(builder)?
        .layer(
            TimeoutLayer::default()
                .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
        )
        .finish();
    Ok(operator)
}

/// 按配置从元数据中取出指纹
pub(crate) fn fingerprint_of(meta: &Metadata, source: FingerprintSource) -> Option<Fingerprint> {
    match source {
        FingerprintSource::ETag => meta.etag().map(|t| Fingerprint::new(normalize_etag(t))),
        FingerprintSource::ContentMd5 => meta.content_md5().map(Fingerprint::new),
    }
}

/// 递归列出 `prefix` 下的所有对象，对象名相对于 `prefix`
pub(crate) async fn list_objects_under(
    operator: Operator,
    prefix: &str,
    source: FingerprintSource,
) -> Result<BoxStream<'static, Result<ListedObject>>> {
    let lister = operator
        .lister_with(prefix)
        .recursive(true)
        .metakey(Metakey::ContentLength | Metakey::Mode | Metakey::Etag | Metakey::ContentMd5)
        .await?;

    let prefix = prefix.to_string();
    let stream = lister
        .map_err(anyhow::Error::from)
        .filter_map(move |item| {
            let operator = operator.clone();
            let prefix = prefix.clone();
            async move {
                match item {
                    Ok(entry) => listed_from_entry(operator, prefix, entry, source)
                        .await
                        .map(Ok),
                    Err(e) => Some(Err(e)),
                }
            }
        });

    Ok(stream.boxed())
}

/// 列表项转换为对象描述，目录返回 `None`
///
/// 单个对象取不到指纹时返回 `Unreadable`，不中断列表。
async fn listed_from_entry(
    operator: Operator,
    prefix: String,
    entry: Entry,
    source: FingerprintSource,
) -> Option<ListedObject> {
    let path = entry.path();
    let meta = entry.metadata();
    if path.ends_with('/') || meta.is_dir() {
        return None;
    }
    let name = path.strip_prefix(prefix.as_str()).unwrap_or(path).to_string();

    if let Some(fingerprint) = fingerprint_of(meta, source) {
        return Some(ListedObject::Found(ObjectDescriptor {
            name,
            fingerprint,
            size: Some(meta.content_length()),
        }));
    }

    // 列表结果不含指纹时回退到 stat
    debug!("列表缺少指纹，回退到 stat: {}", path);
    let listed = match stat_object(&operator, path, &name, source).await {
        Ok(Some(descriptor)) => ListedObject::Found(descriptor),
        Ok(None) => ListedObject::unreadable(name, &anyhow!("对象在列出后消失: {}", path)),
        Err(e) => ListedObject::unreadable(name, &e),
    };
    Some(listed)
}

/// 顶层目录项转换为容器描述
fn container_from_entry(entry: Entry) -> Result<Option<ContainerDescriptor>> {
    let name = entry.path().trim_matches('/');
    // 跳过根目录和顶层文件
    if name.is_empty() || !entry.metadata().is_dir() {
        return Ok(None);
    }
    Ok(Some(ContainerDescriptor {
        name: name.to_string(),
    }))
}

/// 获取对象元数据，不存在返回 `None`
pub(crate) async fn stat_object(
    operator: &Operator,
    path: &str,
    name: &str,
    source: FingerprintSource,
) -> Result<Option<ObjectDescriptor>> {
    match operator.stat(path).await {
        Ok(meta) => {
            if meta.is_dir() {
                return Err(anyhow!("{} 是目录，不是对象", path));
            }
            let fingerprint = fingerprint_of(&meta, source)
                .ok_or_else(|| anyhow!("对象 {} 缺少指纹 ({:?})", path, source))?;
            Ok(Some(ObjectDescriptor {
                name: name.to_string(),
                fingerprint,
                size: Some(meta.content_length()),
            }))
        }
        Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// 打开对象读取流
pub(crate) async fn open_read_at(operator: &Operator, path: &str) -> Result<ByteStream> {
    let reader = operator.reader(path).await?;
    let stream = reader.into_bytes_stream(..).await?;
    Ok(Box::pin(stream.map_err(anyhow::Error::from)))
}

/// 流式写入对象，失败时中止写入器
pub(crate) async fn write_stream_at(
    operator: &Operator,
    path: &str,
    mut stream: ByteStream,
) -> Result<u64> {
    let mut writer = operator.writer(path).await?;
    let mut written = 0u64;

    let result: Result<()> = async {
        while let Some(chunk) = stream.try_next().await? {
            written += chunk.len() as u64;
            writer.write(chunk).await?;
        }
        writer.close().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        if let Err(abort_err) = writer.abort().await {
            debug!("中止写入失败: {} - {}", path, abort_err);
        }
        return Err(e);
    }

    Ok(written)
}

/// 顶层目录即容器的存储
pub struct PrefixStore {
    operator: Operator,
    name: String,
    fingerprint: FingerprintSource,
}

impl PrefixStore {
    pub(crate) fn from_operator(
        operator: Operator,
        name: String,
        fingerprint: FingerprintSource,
    ) -> Self {
        Self {
            operator,
            name,
            fingerprint,
        }
    }

    fn container_dir(container: &str) -> String {
        format!("{}/", container.trim_matches('/'))
    }

    fn object_path(container: &str, object: &str) -> String {
        format!("{}{}", Self::container_dir(container), object.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for PrefixStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_containers(&self) -> Result<BoxStream<'_, Result<ContainerDescriptor>>> {
        let lister = self.operator.lister_with("").metakey(Metakey::Mode).await?;

        let stream = lister
            .map_err(anyhow::Error::from)
            .try_filter_map(|entry| future::ready(container_from_entry(entry)));

        Ok(stream.boxed())
    }

    async fn ensure_container(&self, name: &str) -> Result<EnsureOutcome> {
        let dir = Self::container_dir(name);
        match self.operator.stat(&dir).await {
            Ok(_) => return Ok(EnsureOutcome::AlreadyExists),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // S3 没有真正的目录，这里会写入一个占位对象
        self.operator.create_dir(&dir).await?;
        Ok(EnsureOutcome::Created)
    }

    async fn list_objects(
        &self,
        container: &str,
    ) -> Result<BoxStream<'_, Result<ListedObject>>> {
        list_objects_under(
            self.operator.clone(),
            &Self::container_dir(container),
            self.fingerprint,
        )
        .await
    }

    async fn get_object_metadata(
        &self,
        container: &str,
        object: &str,
    ) -> Result<Option<ObjectDescriptor>> {
        let path = Self::object_path(container, object);
        stat_object(&self.operator, &path, object, self.fingerprint).await
    }

    async fn open_read(&self, container: &str, object: &str) -> Result<ByteStream> {
        open_read_at(&self.operator, &Self::object_path(container, object)).await
    }

    async fn write_from_stream(
        &self,
        container: &str,
        object: &str,
        stream: ByteStream,
    ) -> Result<u64> {
        write_stream_at(&self.operator, &Self::object_path(container, object), stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path() {
        assert_eq!(PrefixStore::object_path("photos", "2024/a.jpg"), "photos/2024/a.jpg");
        assert_eq!(PrefixStore::object_path("/photos/", "/a.jpg"), "photos/a.jpg");
    }

    #[test]
    fn test_fingerprint_of_strips_etag_quotes() {
        let meta = Metadata::new(opendal::EntryMode::FILE).with_etag("\"abc\"".to_string());
        assert_eq!(
            fingerprint_of(&meta, FingerprintSource::ETag),
            Some(Fingerprint::new("abc"))
        );
        assert_eq!(fingerprint_of(&meta, FingerprintSource::ContentMd5), None);
    }
}
