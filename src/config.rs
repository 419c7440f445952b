//! 应用配置模块
//!
//! 配置来自 JSON 文件，再由环境变量覆盖（与函数宿主的应用设置一致）。

use crate::error::{SyncError, SyncResult};
use crate::logging::LogConfig;
use crate::storage::FingerprintSource;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 源账户地址
pub const ENV_SOURCE_URL: &str = "SOURCE_ACCOUNT_URL";
/// 目标账户地址
pub const ENV_DEST_URL: &str = "DEST_ACCOUNT_URL";
/// 同时用于两个账户的凭据（SAS 令牌）
pub const ENV_CREDENTIAL: &str = "STORAGE_CREDENTIAL";
/// 同步计划
pub const ENV_SCHEDULE: &str = "SYNC_SCHEDULE";
/// 用户分配的托管身份；不支持，设置后只会记录警告
pub const ENV_UAMI_CLIENT_ID: &str = "UAMI_CLIENT_ID";

/// 已设置但不会生效的环境变量
const UNSUPPORTED_ENV: &[&str] = &[ENV_UAMI_CLIENT_ID];

/// 存储类型
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    #[default]
    Azblob,
    S3,
    WebDav,
    Local,
}

/// 存储配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    #[serde(rename = "type", default)]
    pub typ: StoreType,
    /// 账户地址 / bucket 名 / WebDAV 端点 / 本地路径
    #[serde(default)]
    pub url: String,
    /// 凭据（Azure 使用 SAS 令牌）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// 自定义 S3 端点
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl StoreConfig {
    pub fn required_url(&self) -> SyncResult<&str> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(SyncError::Configuration(format!(
                "{:?} 存储缺少 url",
                self.typ
            )));
        }
        Ok(url)
    }

    pub fn required<'a>(&self, field: &str, value: Option<&'a str>) -> SyncResult<&'a str> {
        value
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| SyncError::Configuration(format!("{:?} 存储缺少 {}", self.typ, field)))
    }
}

/// 同步参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// 最大并发传输数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_transfers: usize,
    /// 指纹来源
    #[serde(default)]
    pub fingerprint: FingerprintSource,
}

fn default_max_concurrent() -> usize {
    4
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: default_max_concurrent(),
            fingerprint: FingerprintSource::default(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub source: StoreConfig,
    #[serde(default)]
    pub destination: StoreConfig,
    /// 每天 12:00 和 17:00（UTC）
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_schedule() -> String {
    "12:00,17:00".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source: StoreConfig::default(),
            destination: StoreConfig::default(),
            schedule: default_schedule(),
            sync: SyncSettings::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 加载配置文件（不存在时使用默认值），并应用环境变量覆盖
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let content = fs::read_to_string(p)
                    .with_context(|| format!("读取配置文件失败: {}", p.display()))?;
                Self::from_json(&content)
                    .with_context(|| format!("解析配置文件失败: {}", p.display()))?
            }
            Some(p) => {
                tracing::warn!("配置文件不存在，使用默认配置: {}", p.display());
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// 使用环境变量覆盖，空值忽略
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_SOURCE_URL) {
            self.source.url = url;
        }
        if let Some(url) = get(ENV_DEST_URL) {
            self.destination.url = url;
        }
        if let Some(credential) = get(ENV_CREDENTIAL) {
            self.source.credential = Some(credential.clone());
            self.destination.credential = Some(credential);
        }
        if let Some(schedule) = get(ENV_SCHEDULE) {
            self.schedule = schedule;
        }
    }

    /// 列出已设置但不支持的环境变量
    pub fn unsupported_env(lookup: impl Fn(&str) -> Option<String>) -> Vec<&'static str> {
        UNSUPPORTED_ENV
            .iter()
            .copied()
            .filter(|key| lookup(key).is_some_and(|v| !v.trim().is_empty()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_from_empty_json() {
        let config = AppConfig::from_json("{}").unwrap();
        assert_eq!(config.schedule, "12:00,17:00");
        assert_eq!(config.sync.max_concurrent_transfers, 4);
        assert_eq!(config.sync.fingerprint, FingerprintSource::ETag);
        assert_eq!(config.source.typ, StoreType::Azblob);
        assert!(config.source.required_url().is_err());
    }

    #[test]
    fn test_parse_full_config() {
        let config = AppConfig::from_json(
            r#"{
                "source": { "type": "s3", "url": "src-bucket", "region": "us-east-1",
                            "accessKey": "ak", "secretKey": "sk" },
                "destination": { "type": "local", "url": "/srv/mirror" },
                "schedule": "every 30m",
                "sync": { "maxConcurrentTransfers": 8, "fingerprint": "content-md5" },
                "log": { "level": "debug" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.source.typ, StoreType::S3);
        assert_eq!(config.source.access_key.as_deref(), Some("ak"));
        assert_eq!(config.destination.required_url().unwrap(), "/srv/mirror");
        assert_eq!(config.sync.max_concurrent_transfers, 8);
        assert_eq!(config.sync.fingerprint, FingerprintSource::ContentMd5);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_SOURCE_URL, "https://src.blob.core.windows.net"),
            (ENV_DEST_URL, "https://dst.blob.core.windows.net"),
            (ENV_CREDENTIAL, "sv=2022&sig=x"),
            (ENV_SCHEDULE, "  "),
        ]);
        let mut config = AppConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.source.url, "https://src.blob.core.windows.net");
        assert_eq!(config.destination.url, "https://dst.blob.core.windows.net");
        assert_eq!(config.destination.credential.as_deref(), Some("sv=2022&sig=x"));
        // 空白值不覆盖
        assert_eq!(config.schedule, "12:00,17:00");
    }

    #[test]
    fn test_managed_identity_is_reported_unsupported() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_UAMI_CLIENT_ID, "00000000-0000-0000-0000-000000000000"),
            (ENV_CREDENTIAL, "sv=2022&sig=x"),
        ]);
        let unsupported = AppConfig::unsupported_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(unsupported, vec![ENV_UAMI_CLIENT_ID]);

        assert!(AppConfig::unsupported_env(|_| None).is_empty());
        assert!(AppConfig::unsupported_env(|_| Some(" ".to_string())).is_empty());
    }

    #[test]
    fn test_required_field() {
        let config = StoreConfig {
            typ: StoreType::S3,
            url: "bucket".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.required("region", config.region.as_deref()),
            Err(SyncError::Configuration(_))
        ));
    }
}
