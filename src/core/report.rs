//! 同步结果汇总 - 单个对象、单个容器和整次运行

use crate::error::SyncError;
use crate::storage::EnsureOutcome;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 被隔离的失败类型，不会终止运行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// 目标容器创建失败（仍会尝试同步其中的对象）
    ContainerProvision,
    /// 列出源容器中的对象失败
    ObjectList,
    /// 无法取得源对象描述或目标对象元数据（不含"不存在"）
    ObjectMetadata,
    /// 读取或写入失败
    ObjectCopy,
}

/// 单个对象的同步结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum SyncOutcome {
    Copied { bytes: u64 },
    SkippedUnchanged,
    Failed { kind: FailureKind, reason: String },
}

impl SyncOutcome {
    pub fn failed(kind: FailureKind, err: &anyhow::Error) -> Self {
        SyncOutcome::Failed {
            kind,
            reason: format!("{:#}", err),
        }
    }
}

/// 失败记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub kind: FailureKind,
    pub container: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    pub reason: String,
}

/// 目标容器的准备情况
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProvisionState {
    Created,
    AlreadyExists,
    Failed,
}

impl From<EnsureOutcome> for ProvisionState {
    fn from(outcome: EnsureOutcome) -> Self {
        match outcome {
            EnsureOutcome::Created => ProvisionState::Created,
            EnsureOutcome::AlreadyExists => ProvisionState::AlreadyExists,
        }
    }
}

/// 单个容器的统计
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub name: String,
    pub provisioned: ProvisionState,
    pub copied: u32,
    pub skipped: u32,
    pub failed: u32,
    pub bytes_copied: u64,
    /// 对象列表是否中途失败
    pub listing_failed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ItemFailure>,
}

impl ContainerSummary {
    pub fn new(name: &str, provisioned: ProvisionState) -> Self {
        Self {
            name: name.to_string(),
            provisioned,
            copied: 0,
            skipped: 0,
            failed: 0,
            bytes_copied: 0,
            listing_failed: false,
            failures: Vec::new(),
        }
    }

    /// 记录容器创建失败
    pub fn record_provision_failure(&mut self, reason: String) {
        self.provisioned = ProvisionState::Failed;
        self.failures.push(ItemFailure {
            kind: FailureKind::ContainerProvision,
            container: self.name.clone(),
            object: None,
            reason,
        });
    }

    /// 记录对象列表失败
    pub fn record_listing_failure(&mut self, reason: String) {
        self.listing_failed = true;
        self.failures.push(ItemFailure {
            kind: FailureKind::ObjectList,
            container: self.name.clone(),
            object: None,
            reason,
        });
    }

    /// 记录对象结果
    pub fn record(&mut self, object: &str, outcome: &SyncOutcome) {
        match outcome {
            SyncOutcome::Copied { bytes } => {
                self.copied += 1;
                self.bytes_copied += bytes;
            }
            SyncOutcome::SkippedUnchanged => self.skipped += 1,
            SyncOutcome::Failed { kind, reason } => {
                self.failed += 1;
                self.failures.push(ItemFailure {
                    kind: *kind,
                    container: self.name.clone(),
                    object: Some(object.to_string()),
                    reason: reason.clone(),
                });
            }
        }
    }

    pub fn objects_seen(&self) -> u32 {
        self.copied + self.skipped + self.failed
    }
}

/// 运行的最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    /// 所有容器都已处理（可能包含被隔离的失败）
    Completed,
    /// 配置错误、连接失败或被取消
    Aborted,
}

/// 一次运行的汇总，运行结束后只用于日志和返回值，不持久化
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<SyncError>,
    pub containers: Vec<ContainerSummary>,
    pub containers_processed: u32,
    pub objects_copied: u32,
    pub objects_skipped: u32,
    pub objects_failed: u32,
    pub bytes_copied: u64,
}

impl RunSummary {
    pub fn new(run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            finished_at: now,
            status: RunStatus::Completed,
            abort_reason: None,
            containers: Vec::new(),
            containers_processed: 0,
            objects_copied: 0,
            objects_skipped: 0,
            objects_failed: 0,
            bytes_copied: 0,
        }
    }

    /// 在开始枚举之前就终止的运行（例如配置错误）
    pub fn aborted(err: SyncError) -> Self {
        let mut summary = Self::new(Uuid::new_v4());
        summary.finish(Some(err));
        summary
    }

    pub fn add_container(&mut self, container: ContainerSummary) {
        self.containers_processed += 1;
        self.objects_copied += container.copied;
        self.objects_skipped += container.skipped;
        self.objects_failed += container.failed;
        self.bytes_copied += container.bytes_copied;
        self.containers.push(container);
    }

    /// 结束运行；有终止原因时状态为 `Aborted`
    pub fn finish(&mut self, abort_reason: Option<SyncError>) {
        self.finished_at = Utc::now();
        self.status = if abort_reason.is_some() {
            RunStatus::Aborted
        } else {
            RunStatus::Completed
        };
        self.abort_reason = abort_reason;
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// 所有被隔离的失败
    pub fn failures(&self) -> impl Iterator<Item = &ItemFailure> {
        self.containers.iter().flat_map(|c| c.failures.iter())
    }

    pub fn failure_count(&self, kind: FailureKind) -> usize {
        self.failures().filter(|f| f.kind == kind).count()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// 输出运行汇总日志
    pub fn log(&self) {
        match &self.abort_reason {
            Some(reason) => error!("同步运行 {} 已终止: {}", self.run_id, reason),
            None => info!(
                "同步运行 {} 完成: 容器 {}, 复制 {}, 跳过 {}, 失败 {}, {} 字节, 耗时 {}ms",
                self.run_id,
                self.containers_processed,
                self.objects_copied,
                self.objects_skipped,
                self.objects_failed,
                self.bytes_copied,
                self.duration().num_milliseconds()
            ),
        }

        for failure in self.failures() {
            match &failure.object {
                Some(object) => warn!(
                    "[{:?}] {}/{}: {}",
                    failure.kind, failure.container, object, failure.reason
                ),
                None => warn!("[{:?}] {}: {}", failure.kind, failure.container, failure.reason),
            }
        }

        match serde_json::to_string(self) {
            Ok(json) => debug!("运行汇总: {}", json),
            Err(e) => debug!("序列化运行汇总失败: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_summary_counts() {
        let mut summary = ContainerSummary::new("a", ProvisionState::Created);
        summary.record("x", &SyncOutcome::Copied { bytes: 10 });
        summary.record("y", &SyncOutcome::SkippedUnchanged);
        summary.record(
            "z",
            &SyncOutcome::Failed {
                kind: FailureKind::ObjectCopy,
                reason: "boom".to_string(),
            },
        );

        assert_eq!(summary.copied, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.bytes_copied, 10);
        assert_eq!(summary.objects_seen(), 3);
        assert_eq!(summary.failures[0].object.as_deref(), Some("z"));
    }

    #[test]
    fn test_provision_failure_is_not_an_object_failure() {
        let mut container = ContainerSummary::new("b", ProvisionState::AlreadyExists);
        container.record_provision_failure("403".to_string());

        let mut run = RunSummary::new(Uuid::new_v4());
        run.add_container(container);
        run.finish(None);

        assert!(run.is_completed());
        assert_eq!(run.objects_failed, 0);
        assert_eq!(run.failure_count(FailureKind::ContainerProvision), 1);
        assert_eq!(run.containers[0].provisioned, ProvisionState::Failed);
    }

    #[test]
    fn test_run_aggregates_containers() {
        let mut run = RunSummary::new(Uuid::new_v4());
        for name in ["a", "b"] {
            let mut c = ContainerSummary::new(name, ProvisionState::Created);
            c.record("o", &SyncOutcome::Copied { bytes: 3 });
            run.add_container(c);
        }
        run.finish(None);

        assert_eq!(run.containers_processed, 2);
        assert_eq!(run.objects_copied, 2);
        assert_eq!(run.bytes_copied, 6);
        assert!(run.finished_at >= run.started_at);
    }

    #[test]
    fn test_aborted_summary_serializes_reason() {
        let run = RunSummary::aborted(SyncError::Configuration("缺少 url".to_string()));
        assert_eq!(run.status, RunStatus::Aborted);

        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["status"], "aborted");
        assert_eq!(json["abortReason"]["kind"], "configuration");
        assert_eq!(json["abortReason"]["reason"], "缺少 url");
    }
}
