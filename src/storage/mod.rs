pub mod azblob;
pub mod local;
pub mod memory;
pub mod prefix;
pub mod s3;
pub mod webdav;

use crate::config::{StoreConfig, StoreType};
use crate::error::SyncError;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

pub use azblob::AzureBlobStore;
pub use local::LocalStorage;
pub use memory::MemoryStore;
pub use prefix::PrefixStore;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, list, create 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 对象内容指纹，由存储后端给出（ETag、MD5 或内容哈希）
///
/// 同步核心只做相等比较，从不解析其内容。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 远程后端上报哪种令牌作为指纹
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FingerprintSource {
    /// 实体标签（默认）
    #[default]
    #[serde(rename = "etag")]
    ETag,
    /// Content-MD5，跨账户复制后仍保持一致
    ContentMd5,
}

/// 容器描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub name: String,
}

/// 对象描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    /// 容器内唯一的对象名（可包含 `/`）
    pub name: String,
    pub fingerprint: Fingerprint,
    /// 仅用于统计传输字节数，不参与变更判断
    pub size: Option<u64>,
}

/// 对象列表中的一项
///
/// 单个对象无法描述（缺少指纹、文件消失、子目录不可读）时返回 `Unreadable`，
/// 列表本身的失败（连接中断、分页失败）才作为流中的 `Err`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListedObject {
    Found(ObjectDescriptor),
    Unreadable { name: String, reason: String },
}

impl ListedObject {
    pub fn unreadable(name: impl Into<String>, err: &anyhow::Error) -> Self {
        ListedObject::Unreadable {
            name: name.into(),
            reason: format!("{:#}", err),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ListedObject::Found(d) => &d.name,
            ListedObject::Unreadable { name, .. } => name,
        }
    }
}

/// 确保容器存在的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    AlreadyExists,
}

/// 流式读取的数据块序列；丢弃即释放底层连接或文件句柄
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// 对象存储抽象接口，一个实例绑定一个存储账户（或根路径）
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;

    /// 列出所有容器（惰性、一次性）
    async fn list_containers(&self) -> Result<BoxStream<'_, Result<ContainerDescriptor>>>;

    /// 确保容器存在，已存在时不是错误
    async fn ensure_container(&self, name: &str) -> Result<EnsureOutcome>;

    /// 列出容器内所有对象（递归）
    async fn list_objects(&self, container: &str)
        -> Result<BoxStream<'_, Result<ListedObject>>>;

    /// 获取对象元数据，不存在返回 `None`
    async fn get_object_metadata(
        &self,
        container: &str,
        object: &str,
    ) -> Result<Option<ObjectDescriptor>>;

    /// 打开对象读取流
    async fn open_read(&self, container: &str, object: &str) -> Result<ByteStream>;

    /// 从流写入对象（无条件覆盖），返回写入的字节数
    async fn write_from_stream(
        &self,
        container: &str,
        object: &str,
        stream: ByteStream,
    ) -> Result<u64>;
}

/// 去掉 ETag 两侧的引号，源和目标使用同一规则
pub(crate) fn normalize_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

/// 根据配置创建存储实例
pub async fn create_store(
    config: &StoreConfig,
    fingerprint: FingerprintSource,
) -> Result<Arc<dyn ObjectStore>, SyncError> {
    let url = config.required_url()?;

    let store: Arc<dyn ObjectStore> = match config.typ {
        StoreType::Azblob => {
            tracing::info!("初始化 Azure Blob 存储: {}", url);
            Arc::new(
                AzureBlobStore::new(url, config.credential.clone(), fingerprint)
                    .map_err(SyncError::configuration)?,
            )
        }
        StoreType::S3 => {
            let region = config.required("region", config.region.as_deref())?;
            let access_key = config.required("accessKey", config.access_key.as_deref())?;
            let secret_key = config.required("secretKey", config.secret_key.as_deref())?;
            tracing::info!("初始化S3存储: bucket={}, region={}", url, region);
            Arc::new(
                PrefixStore::s3(
                    url,
                    region,
                    access_key,
                    secret_key,
                    config.endpoint.clone(),
                    config.root.clone(),
                    fingerprint,
                )
                .map_err(SyncError::configuration)?,
            )
        }
        StoreType::WebDav => {
            let username = config.required("username", config.username.as_deref())?;
            let password = config.required("password", config.password.as_deref())?;
            tracing::info!("创建WebDAV存储: endpoint={}, root={:?}", url, config.root);
            Arc::new(
                PrefixStore::webdav(url, username, password, config.root.clone(), fingerprint)
                    .map_err(SyncError::configuration)?,
            )
        }
        StoreType::Local => {
            tracing::info!("初始化本地存储: {}", url);
            Arc::new(LocalStorage::new(url).map_err(SyncError::configuration)?)
        }
    };

    Ok(store)
}

/// 连通性探测：完整遍历一次容器列表，返回容器数量
pub async fn probe(store: &dyn ObjectStore) -> Result<usize> {
    store
        .list_containers()
        .await?
        .try_fold(0usize, |count, _| async move { Ok(count + 1) })
        .await
}
