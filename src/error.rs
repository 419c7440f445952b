//! 运行级错误：出现即终止本次同步

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "camelCase")]
pub enum SyncError {
    /// 缺少必需的存储配置，在开始枚举之前终止
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 列出源容器时无法连接存储
    #[error("无法连接存储: {0}")]
    Connectivity(String),

    /// 宿主关闭，运行被取消
    #[error("同步已取消")]
    Cancelled,
}

impl SyncError {
    pub fn configuration(err: anyhow::Error) -> Self {
        Self::Configuration(format!("{:#}", err))
    }

    pub fn connectivity(store: &str, err: anyhow::Error) -> Self {
        Self::Connectivity(format!("{}: {:#}", store, err))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
