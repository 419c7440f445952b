//! Azure Blob 存储账户
//!
//! 账户级操作（列出容器、创建容器）直接调用 Blob REST 接口，
//! 容器内的对象操作交给 OpenDAL 的 azblob 服务。

use super::prefix::{build_operator, list_objects_under, open_read_at, stat_object, write_stream_at};
use super::{
    ByteStream, ContainerDescriptor, EnsureOutcome, FingerprintSource, ListedObject,
    ObjectDescriptor, ObjectStore, OP_TIMEOUT_SECS,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use opendal::Operator;
use regex::Regex;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Blob 服务 REST API 版本
const API_VERSION: &str = "2021-08-06";

pub struct AzureBlobStore {
    /// 账户端点，例如 https://account.blob.core.windows.net
    endpoint: String,
    /// SAS 令牌（不带前导 `?`）
    sas_token: Option<String>,
    fingerprint: FingerprintSource,
    client: reqwest::Client,
    /// 每个容器一个 Operator
    operators: RwLock<HashMap<String, Operator>>,
    name: String,
}

impl AzureBlobStore {
    pub fn new(
        account_url: &str,
        sas_token: Option<String>,
        fingerprint: FingerprintSource,
    ) -> Result<Self> {
        let url = reqwest::Url::parse(account_url)?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("账户地址缺少主机名: {}", account_url))?
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            .build()?;

        let sas_token = sas_token
            .map(|t| t.trim().trim_start_matches('?').to_string())
            .filter(|t| !t.is_empty());

        Ok(Self {
            endpoint: account_url.trim_end_matches('/').to_string(),
            sas_token,
            fingerprint,
            client,
            operators: RwLock::new(HashMap::new()),
            name: format!("azblob://{}", host),
        })
    }

    /// 拼接账户级 REST 地址，附带 SAS 令牌
    fn service_url(&self, path: &str, query: &str) -> String {
        let mut url = format!("{}/{}?{}", self.endpoint, path, query);
        if let Some(sas) = &self.sas_token {
            url.push('&');
            url.push_str(sas);
        }
        url
    }

    /// 获取（或创建）容器对应的 Operator
    async fn operator_for(&self, container: &str) -> Result<Operator> {
        {
            let operators = self.operators.read().await;
            if let Some(op) = operators.get(container) {
                return Ok(op.clone());
            }
        }

        use opendal::services::Azblob;

        let mut builder = Azblob::default()
            .container(container)
            .endpoint(&self.endpoint);
        if let Some(sas) = &self.sas_token {
            builder = builder.sas_token(sas);
        }
        let operator = build_operator(builder)?;

        let mut operators = self.operators.write().await;
        let operator = operators
            .entry(container.to_string())
            .or_insert(operator)
            .clone();
        Ok(operator)
    }

    /// 拉取一页容器列表
    async fn fetch_container_page(
        &self,
        marker: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)> {
        let mut query = "comp=list".to_string();
        if let Some(m) = marker {
            query.push_str("&marker=");
            query.push_str(&urlencoding::encode(m));
        }

        let response = self
            .client
            .get(self.service_url("", &query))
            .header("x-ms-version", API_VERSION)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            bail!(
                "列出容器失败 ({}): {}",
                status,
                error_code(&body).unwrap_or_else(|| "unknown".to_string())
            );
        }

        let page = parse_container_list(&body);
        debug!("容器列表分页: {} 个, next={:?}", page.0.len(), page.1);
        Ok(page)
    }
}

fn container_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<Container>\s*<Name>([^<]*)</Name>").expect("valid regex"))
}

fn next_marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<NextMarker>([^<]*)</NextMarker>").expect("valid regex"))
}

fn error_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<Code>([^<]*)</Code>").expect("valid regex"))
}

/// 解析 List Containers 响应，返回容器名和下一页标记
fn parse_container_list(xml: &str) -> (Vec<String>, Option<String>) {
    let names = container_name_regex()
        .captures_iter(xml)
        .map(|c| c[1].trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();

    let next = next_marker_regex()
        .captures(xml)
        .map(|c| c[1].trim().to_string())
        .filter(|m| !m.is_empty());

    (names, next)
}

/// 从错误响应中取出错误码
fn error_code(xml: &str) -> Option<String> {
    error_code_regex()
        .captures(xml)
        .map(|c| c[1].trim().to_string())
}

#[async_trait]
impl ObjectStore for AzureBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_containers(&self) -> Result<BoxStream<'_, Result<ContainerDescriptor>>> {
        // 先取第一页，使连接错误在打开列表时就暴露出来
        let (first, next) = self.fetch_container_page(None).await?;

        let rest = stream::try_unfold(next, move |marker| async move {
            let Some(marker) = marker else {
                return Ok(None);
            };
            let (names, next) = self.fetch_container_page(Some(&marker)).await?;
            Ok::<_, anyhow::Error>(Some((names, next)))
        });

        let stream = stream::once(async move { Ok::<_, anyhow::Error>(first) })
            .chain(rest)
            .map_ok(|names| {
                stream::iter(
                    names
                        .into_iter()
                        .map(|name| Ok::<_, anyhow::Error>(ContainerDescriptor { name })),
                )
            })
            .try_flatten();

        Ok(stream.boxed())
    }

    async fn ensure_container(&self, name: &str) -> Result<EnsureOutcome> {
        let url = self.service_url(&urlencoding::encode(name), "restype=container");
        let response = self
            .client
            .put(url)
            .header("x-ms-version", API_VERSION)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(EnsureOutcome::Created);
        }

        let code = error_code(&response.text().await.unwrap_or_default());
        match (status, code.as_deref()) {
            (StatusCode::CONFLICT, Some("ContainerAlreadyExists")) => {
                Ok(EnsureOutcome::AlreadyExists)
            }
            (status, code) => bail!(
                "创建容器 {} 失败 ({}): {}",
                name,
                status,
                code.unwrap_or("unknown")
            ),
        }
    }

    async fn list_objects(
        &self,
        container: &str,
    ) -> Result<BoxStream<'_, Result<ListedObject>>> {
        let operator = self.operator_for(container).await?;
        list_objects_under(operator, "", self.fingerprint).await
    }

    async fn get_object_metadata(
        &self,
        container: &str,
        object: &str,
    ) -> Result<Option<ObjectDescriptor>> {
        let operator = self.operator_for(container).await?;
        stat_object(&operator, object, object, self.fingerprint).await
    }

    async fn open_read(&self, container: &str, object: &str) -> Result<ByteStream> {
        let operator = self.operator_for(container).await?;
        open_read_at(&operator, object).await
    }

    async fn write_from_stream(
        &self,
        container: &str,
        object: &str,
        stream: ByteStream,
    ) -> Result<u64> {
        let operator = self.operator_for(container).await?;
        write_stream_at(&operator, object, stream).await
    }
}
