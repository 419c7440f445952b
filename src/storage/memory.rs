//! 内存存储 - 用于测试和演练
//!
//! 指纹由写入内容计算得出（与真实后端一样由存储方分配），
//! 支持注入故障并统计读写次数和未释放的读取流。

use super::{
    ByteStream, ContainerDescriptor, EnsureOutcome, Fingerprint, ListedObject, ObjectDescriptor,
    ObjectStore,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// 读取流按此大小分块
const CHUNK_SIZE: usize = 4;

#[derive(Debug, Clone)]
struct MemObject {
    data: Bytes,
    fingerprint: Fingerprint,
}

type Containers = BTreeMap<String, BTreeMap<String, MemObject>>;

/// 注入的故障
#[derive(Debug, Default)]
struct Faults {
    list_containers: bool,
    ensure: HashSet<String>,
    list_objects: HashSet<String>,
    listing_entry: HashSet<(String, String)>,
    metadata: HashSet<(String, String)>,
    read: HashSet<(String, String)>,
    write: HashSet<(String, String)>,
}

pub struct MemoryStore {
    name: String,
    containers: Mutex<Containers>,
    faults: Mutex<Faults>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    open_streams: Arc<AtomicUsize>,
    offline: AtomicBool,
}

/// 由内容计算指纹
fn content_fingerprint(data: &[u8]) -> Fingerprint {
    Fingerprint::new(format!("0x{}", &blake3::hash(data).to_hex()[..16]))
}

fn key(container: &str, object: &str) -> (String, String) {
    (container.to_string(), object.to_string())
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: format!("memory://{}", name),
            containers: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            open_streams: Arc::new(AtomicUsize::new(0)),
            offline: AtomicBool::new(false),
        }
    }

    fn containers(&self) -> MutexGuard<'_, Containers> {
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ============ 预置数据 ============

    pub fn create_container(&self, name: &str) {
        self.containers().entry(name.to_string()).or_default();
    }

    /// 写入对象，指纹由内容计算
    pub fn put_object(&self, container: &str, object: &str, data: impl Into<Bytes>) -> Fingerprint {
        let data = data.into();
        let fingerprint = content_fingerprint(&data);
        self.put_object_with_fingerprint(container, object, data, fingerprint.clone());
        fingerprint
    }

    /// 写入对象并指定指纹
    pub fn put_object_with_fingerprint(
        &self,
        container: &str,
        object: &str,
        data: impl Into<Bytes>,
        fingerprint: Fingerprint,
    ) {
        self.containers()
            .entry(container.to_string())
            .or_default()
            .insert(
                object.to_string(),
                MemObject {
                    data: data.into(),
                    fingerprint,
                },
            );
    }

    // ============ 查询 ============

    pub fn container_names(&self) -> Vec<String> {
        self.containers().keys().cloned().collect()
    }

    pub fn object_names(&self, container: &str) -> Vec<String> {
        self.containers()
            .get(container)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn object_data(&self, container: &str, object: &str) -> Option<Bytes> {
        self.containers()
            .get(container)
            .and_then(|objects| objects.get(object))
            .map(|o| o.data.clone())
    }

    pub fn fingerprint(&self, container: &str, object: &str) -> Option<Fingerprint> {
        self.containers()
            .get(container)
            .and_then(|objects| objects.get(object))
            .map(|o| o.fingerprint.clone())
    }

    /// 打开读取流的次数
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// 成功写入的次数
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// 尚未释放的读取流
    pub fn open_stream_count(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    // ============ 故障注入 ============

    /// 模拟整个账户不可达
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_list_containers(&self) {
        self.faults().list_containers = true;
    }

    pub fn fail_ensure_container(&self, container: &str) {
        self.faults().ensure.insert(container.to_string());
    }

    pub fn fail_list_objects(&self, container: &str) {
        self.faults().list_objects.insert(container.to_string());
    }

    /// 列表中的这一项无法描述（如缺少指纹），其余项正常返回
    pub fn fail_listing_entry(&self, container: &str, object: &str) {
        self.faults().listing_entry.insert(key(container, object));
    }

    pub fn fail_metadata(&self, container: &str, object: &str) {
        self.faults().metadata.insert(key(container, object));
    }

    pub fn fail_read(&self, container: &str, object: &str) {
        self.faults().read.insert(key(container, object));
    }

    pub fn fail_write(&self, container: &str, object: &str) {
        self.faults().write.insert(key(container, object));
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("{} 不可达: connection refused", self.name);
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_containers(&self) -> Result<BoxStream<'_, Result<ContainerDescriptor>>> {
        self.check_online()?;
        if self.faults().list_containers {
            bail!("{} 列出容器失败: connection reset", self.name);
        }
        let names = self.container_names();
        Ok(stream::iter(names.into_iter().map(|name| Ok(ContainerDescriptor { name }))).boxed())
    }

    async fn ensure_container(&self, name: &str) -> Result<EnsureOutcome> {
        self.check_online()?;
        if self.faults().ensure.contains(name) {
            bail!("创建容器 {} 失败 (403): AuthorizationPermissionMismatch", name);
        }
        let mut containers = self.containers();
        if containers.contains_key(name) {
            return Ok(EnsureOutcome::AlreadyExists);
        }
        containers.insert(name.to_string(), BTreeMap::new());
        Ok(EnsureOutcome::Created)
    }

    async fn list_objects(
        &self,
        container: &str,
    ) -> Result<BoxStream<'_, Result<ListedObject>>> {
        self.check_online()?;
        if self.faults().list_objects.contains(container) {
            bail!("列出容器 {} 的对象失败", container);
        }
        let broken = self.faults().listing_entry.clone();
        let objects: Vec<ListedObject> = self
            .containers()
            .get(container)
            .ok_or_else(|| anyhow!("容器不存在: {}", container))?
            .iter()
            .map(|(name, o)| {
                if broken.contains(&key(container, name)) {
                    return ListedObject::Unreadable {
                        name: name.clone(),
                        reason: format!("对象 {}/{} 缺少指纹", container, name),
                    };
                }
                ListedObject::Found(ObjectDescriptor {
                    name: name.clone(),
                    fingerprint: o.fingerprint.clone(),
                    size: Some(o.data.len() as u64),
                })
            })
            .collect();
        Ok(stream::iter(objects.into_iter().map(Ok)).boxed())
    }

    async fn get_object_metadata(
        &self,
        container: &str,
        object: &str,
    ) -> Result<Option<ObjectDescriptor>> {
        self.check_online()?;
        if self.faults().metadata.contains(&key(container, object)) {
            bail!("获取 {}/{} 元数据失败: 503 ServerBusy", container, object);
        }
        Ok(self
            .containers()
            .get(container)
            .and_then(|objects| objects.get(object))
            .map(|o| ObjectDescriptor {
                name: object.to_string(),
                fingerprint: o.fingerprint.clone(),
                size: Some(o.data.len() as u64),
            }))
    }

    async fn open_read(&self, container: &str, object: &str) -> Result<ByteStream> {
        self.check_online()?;
        let data = self
            .object_data(container, object)
            .ok_or_else(|| anyhow!("对象不存在: {}/{}", container, object))?;
        self.reads.fetch_add(1, Ordering::SeqCst);

        let fail_midway = self.faults().read.contains(&key(container, object));

        // 流被丢弃时计数归还
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        let guard = scopeguard::guard(self.open_streams.clone(), |open| {
            open.fetch_sub(1, Ordering::SeqCst);
        });

        let mut chunks: Vec<Result<Bytes>> = data
            .chunks(CHUNK_SIZE)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        if fail_midway {
            chunks.truncate(1);
            chunks.push(Err(anyhow!("读取 {}/{} 时连接中断", container, object)));
        }

        let stream = stream::iter(chunks).map(move |chunk| {
            let _held = &guard;
            chunk
        });
        Ok(Box::pin(stream))
    }

    async fn write_from_stream(
        &self,
        container: &str,
        object: &str,
        mut stream: ByteStream,
    ) -> Result<u64> {
        self.check_online()?;
        let inject = self.faults().write.contains(&key(container, object));

        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.try_next().await? {
            buffer.extend_from_slice(&chunk);
            if inject {
                bail!("写入 {}/{} 失败: 500 InternalError", container, object);
            }
        }
        if inject {
            bail!("写入 {}/{} 失败: 500 InternalError", container, object);
        }

        let data = buffer.freeze();
        let written = data.len() as u64;
        let mut containers = self.containers();
        let objects = containers
            .get_mut(container)
            .ok_or_else(|| anyhow!("容器不存在: {}", container))?;
        objects.insert(
            object.to_string(),
            MemObject {
                fingerprint: content_fingerprint(&data),
                data,
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_container_is_idempotent() {
        let store = MemoryStore::new("dst");
        assert_eq!(store.ensure_container("a").await.unwrap(), EnsureOutcome::Created);
        assert_eq!(
            store.ensure_container("a").await.unwrap(),
            EnsureOutcome::AlreadyExists
        );
    }

    #[tokio::test]
    async fn test_write_assigns_content_fingerprint() {
        let store = MemoryStore::new("dst");
        store.create_container("a");
        let stream: ByteStream = Box::pin(stream::iter(vec![Ok(Bytes::from_static(b"hello"))]));
        let written = store.write_from_stream("a", "x", stream).await.unwrap();

        assert_eq!(written, 5);
        assert_eq!(store.fingerprint("a", "x"), Some(content_fingerprint(b"hello")));
    }

    #[tokio::test]
    async fn test_dropping_read_stream_releases_it() {
        let store = MemoryStore::new("src");
        store.put_object("a", "x", "some bytes");
        let stream = store.open_read("a", "x").await.unwrap();
        assert_eq!(store.open_stream_count(), 1);
        drop(stream);
        assert_eq!(store.open_stream_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_object_metadata_is_none() {
        let store = MemoryStore::new("dst");
        store.create_container("a");
        assert!(store.get_object_metadata("a", "nope").await.unwrap().is_none());
    }
}
