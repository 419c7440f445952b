use crate::config::SyncSettings;
use crate::core::report::{
    ContainerSummary, ProvisionState, RunStatus, RunSummary, SyncOutcome, FailureKind,
};
use crate::core::transfer::sync_object;
use crate::error::SyncError;
use crate::storage::{ListedObject, ObjectStore};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// 同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 最大并发传输数（整次运行共享）
    pub max_concurrent_transfers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 4, // 默认并行数为4
        }
    }
}

impl From<&SyncSettings> for SyncConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            max_concurrent_transfers: settings.max_concurrent_transfers.max(1),
        }
    }
}

/// 引擎状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Aborted,
}

/// 进度事件；接收端关闭不影响运行
#[derive(Debug, Clone)]
pub enum SyncEvent {
    RunStarted {
        run_id: Uuid,
    },
    ContainerStarted {
        name: String,
    },
    ObjectFinished {
        container: String,
        object: String,
        outcome: SyncOutcome,
    },
    RunFinished {
        summary: RunSummary,
    },
}

/// 同步引擎：一个源账户到一个目标账户
pub struct SyncEngine {
    source: Arc<dyn ObjectStore>,
    dest: Arc<dyn ObjectStore>,
    config: SyncConfig,
    cancelled: Arc<AtomicBool>,
    state: Mutex<RunState>,
    progress_tx: Option<mpsc::Sender<SyncEvent>>,
}

impl SyncEngine {
    pub fn new(source: Arc<dyn ObjectStore>, dest: Arc<dyn ObjectStore>) -> Self {
        Self::with_config(source, dest, SyncConfig::default())
    }

    pub fn with_config(
        source: Arc<dyn ObjectStore>,
        dest: Arc<dyn ObjectStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            dest,
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(RunState::Idle),
            progress_tx: None,
        }
    }

    /// 设置进度事件接收端
    pub fn with_progress(mut self, tx: mpsc::Sender<SyncEvent>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// 与宿主共享取消标志（例如 Ctrl-C 处理）
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    /// 取消同步：不再启动新的容器和对象，正在进行的复制会完成
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 检查是否已取消
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// 执行一次完整同步
    ///
    /// 只有列出源容器失败（或取消）会终止运行，其余失败都记录在汇总中。
    pub async fn run_sync(&self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> RunSummary {
        self.set_state(RunState::Running);
        let mut summary = RunSummary::new(run_id);

        info!("开始同步: {} -> {}", self.source.name(), self.dest.name());
        self.send_progress(SyncEvent::RunStarted { run_id }).await;

        let abort_reason = self.sync_all_containers(&mut summary).await;
        summary.finish(abort_reason);
        summary.log();

        self.set_state(match summary.status {
            RunStatus::Completed => RunState::Completed,
            RunStatus::Aborted => RunState::Aborted,
        });
        self.send_progress(SyncEvent::RunFinished {
            summary: summary.clone(),
        })
        .await;

        summary
    }

    /// 依次处理每个源容器，返回终止原因
    async fn sync_all_containers(&self, summary: &mut RunSummary) -> Option<SyncError> {
        if self.is_cancelled() {
            return Some(SyncError::Cancelled);
        }

        let mut containers = match self.source.list_containers().await {
            Ok(s) => s,
            Err(e) => return Some(SyncError::connectivity(self.source.name(), e)),
        };

        // 并发上限对整次运行生效
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_transfers));

        while let Some(item) = containers.next().await {
            let container = match item {
                Ok(c) => c,
                Err(e) => return Some(SyncError::connectivity(self.source.name(), e)),
            };

            if self.is_cancelled() {
                info!("同步已取消，跳过剩余容器");
                return Some(SyncError::Cancelled);
            }

            let span = info_span!("container", name = %container.name);
            let result = self
                .sync_container(&container.name, &semaphore)
                .instrument(span)
                .await;
            summary.add_container(result);
        }

        if self.is_cancelled() {
            return Some(SyncError::Cancelled);
        }
        None
    }

    /// 同步单个容器，失败都被隔离在容器内
    async fn sync_container(&self, name: &str, semaphore: &Arc<Semaphore>) -> ContainerSummary {
        info!("处理容器: {}", name);
        self.send_progress(SyncEvent::ContainerStarted {
            name: name.to_string(),
        })
        .await;

        let mut summary = match self.dest.ensure_container(name).await {
            Ok(outcome) => {
                debug!("目标容器已就绪: {} ({:?})", name, outcome);
                ContainerSummary::new(name, outcome.into())
            }
            Err(e) => {
                // 仍然尝试同步对象，容器可能已由其他途径创建
                warn!("无法创建目标容器 {}: {:#}", name, e);
                let mut summary = ContainerSummary::new(name, ProvisionState::Failed);
                summary.record_provision_failure(format!("{:#}", e));
                summary
            }
        };

        let handles = match self.dispatch_objects(name, semaphore, &mut summary).await {
            Some(handles) => handles,
            None => return summary,
        };

        // 等待所有任务完成
        for (object, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => SyncOutcome::Failed {
                    kind: FailureKind::ObjectCopy,
                    reason: format!("任务异常退出: {}", e),
                },
            };
            summary.record(&object, &outcome);
            self.send_progress(SyncEvent::ObjectFinished {
                container: name.to_string(),
                object,
                outcome,
            })
            .await;
        }

        debug!(
            "容器完成: {} - 复制 {}, 跳过 {}, 失败 {}",
            name, summary.copied, summary.skipped, summary.failed
        );
        summary
    }

    /// 列出源对象并为每个对象启动一个传输任务
    ///
    /// 无法描述的单个对象记为失败并继续；列表本身失败时记录到容器汇总，
    /// 已启动的任务照常完成。
    async fn dispatch_objects(
        &self,
        container: &str,
        semaphore: &Arc<Semaphore>,
        summary: &mut ContainerSummary,
    ) -> Option<Vec<(String, JoinHandle<SyncOutcome>)>> {
        let mut objects = match self.source.list_objects(container).await {
            Ok(s) => s,
            Err(e) => {
                warn!("列出对象失败: {} - {:#}", container, e);
                summary.record_listing_failure(format!("{:#}", e));
                return None;
            }
        };

        let mut handles = Vec::new();
        while let Some(item) = objects.next().await {
            if self.is_cancelled() {
                break;
            }

            let object = match item {
                Ok(ListedObject::Found(o)) => o,
                Ok(ListedObject::Unreadable { name, reason }) => {
                    warn!("无法读取源对象: {}/{} - {}", container, name, reason);
                    let outcome = SyncOutcome::Failed {
                        kind: FailureKind::ObjectMetadata,
                        reason,
                    };
                    summary.record(&name, &outcome);
                    self.send_progress(SyncEvent::ObjectFinished {
                        container: container.to_string(),
                        object: name,
                        outcome,
                    })
                    .await;
                    continue;
                }
                Err(e) => {
                    warn!("列出对象中途失败: {} - {:#}", container, e);
                    summary.record_listing_failure(format!("{:#}", e));
                    break;
                }
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let source = self.source.clone();
            let dest = self.dest.clone();
            let container = container.to_string();
            let name = object.name.clone();

            let handle = tokio::spawn(
                async move {
                    let outcome =
                        sync_object(source.as_ref(), dest.as_ref(), &container, &object).await;
                    drop(permit);
                    outcome
                }
                .in_current_span(),
            );

            handles.push((name, handle));
        }

        Some(handles)
    }

    /// 发送进度更新
    async fn send_progress(&self, event: SyncEvent) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(event).await;
        }
    }
}
