//! 定时触发：解析计划、等待下一次触发、执行同步

use crate::config::AppConfig;
use crate::core::{RunSummary, SyncConfig, SyncEngine};
use crate::error::SyncError;
use crate::storage::create_store;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 触发晚于预定时间超过该值时视为过期
const PAST_DUE_SECS: i64 = 60;

/// 同步计划（UTC）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// 每天的固定时间点，已排序去重
    Daily(Vec<NaiveTime>),
    /// 固定间隔
    Every(Duration),
}

impl FromStr for Schedule {
    type Err = anyhow::Error;

    /// 支持三种写法：
    /// - `"12:00,17:00"` 每天的时间点
    /// - `"every 30m"` 固定间隔（单位 s/m/h/d）
    /// - `"0 0 12,17 * * *"` 六段 cron，日期字段必须为 `*`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("同步计划为空");
        }

        if let Some(interval) = s.strip_prefix("every") {
            return parse_interval(interval.trim()).map(Schedule::Every);
        }

        let fields: Vec<&str> = s.split_whitespace().collect();
        let times = if s.contains(':') {
            s.split(',')
                .map(|t| {
                    NaiveTime::parse_from_str(t.trim(), "%H:%M")
                        .with_context(|| format!("无效的时间: {:?}", t))
                })
                .collect::<Result<Vec<_>>>()?
        } else if fields.len() == 6 {
            parse_cron(&fields)?
        } else {
            bail!("无法识别的同步计划: {:?}", s);
        };

        Ok(Schedule::daily(times))
    }
}

impl Schedule {
    fn daily(mut times: Vec<NaiveTime>) -> Self {
        times.sort();
        times.dedup();
        Schedule::Daily(times)
    }

    /// `now` 之后的下一次触发时间
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::Every(interval) => now + *interval,
            Schedule::Daily(times) => {
                let today = now.date_naive();
                times
                    .iter()
                    .map(|t| today.and_time(*t).and_utc())
                    .find(|at| *at > now)
                    .or_else(|| {
                        let tomorrow = today + Duration::days(1);
                        times.first().map(|t| tomorrow.and_time(*t).and_utc())
                    })
                    // 解析保证 times 非空
                    .unwrap_or(now + Duration::days(1))
            }
        }
    }
}

fn parse_interval(s: &str) -> Result<Duration> {
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow!("间隔缺少单位: {:?}", s))?;
    let (value, unit) = s.split_at(split);
    let value: i64 = value
        .parse()
        .with_context(|| format!("无效的间隔: {:?}", s))?;
    if value <= 0 {
        bail!("间隔必须大于 0: {:?}", s);
    }

    let interval = match unit.trim() {
        "s" => Duration::seconds(value),
        "m" => Duration::minutes(value),
        "h" => Duration::hours(value),
        "d" => Duration::days(value),
        other => bail!("未知的间隔单位: {:?}", other),
    };
    Ok(interval)
}

/// 只支持"秒 分 时 * * *"形式，小时可以是逗号分隔的列表
fn parse_cron(fields: &[&str]) -> Result<Vec<NaiveTime>> {
    if fields[3..].iter().any(|f| *f != "*") {
        bail!("cron 计划只支持每天触发: {}", fields.join(" "));
    }
    let second: u32 = fields[0].parse().context("无效的 cron 秒字段")?;
    let minute: u32 = fields[1].parse().context("无效的 cron 分字段")?;

    fields[2]
        .split(',')
        .map(|h| {
            let hour: u32 = h.parse().with_context(|| format!("无效的 cron 小时: {:?}", h))?;
            NaiveTime::from_hms_opt(hour, minute, second)
                .ok_or_else(|| anyhow!("无效的 cron 时间: {}:{}:{}", hour, minute, second))
        })
        .collect()
}

/// 执行一次同步；存储配置错误时返回已终止的汇总
pub async fn run_once(config: &AppConfig, cancel: Arc<AtomicBool>) -> RunSummary {
    let fingerprint = config.sync.fingerprint;

    let stores = async {
        let source = create_store(&config.source, fingerprint).await?;
        let dest = create_store(&config.destination, fingerprint).await?;
        Ok::<_, SyncError>((source, dest))
    };

    let (source, dest) = match stores.await {
        Ok(pair) => pair,
        Err(e) => {
            error!("存储配置错误: {}", e);
            let summary = RunSummary::aborted(e);
            summary.log();
            return summary;
        }
    };

    SyncEngine::with_config(source, dest, SyncConfig::from(&config.sync))
        .with_cancel_flag(cancel)
        .run_sync()
        .await
}

/// 按计划循环执行同步，直到 `shutdown` 完成
///
/// 退出时设置取消标志，并等待正在运行的同步收尾。
pub async fn serve<F>(config: AppConfig, cancel: Arc<AtomicBool>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let schedule: Schedule = config
        .schedule
        .parse()
        .with_context(|| format!("无效的同步计划: {:?}", config.schedule))?;
    info!("同步计划: {:?}", schedule);

    let config = Arc::new(config);
    let active = Arc::new(AtomicUsize::new(0));
    let mut runs: Vec<JoinHandle<RunSummary>> = Vec::new();
    tokio::pin!(shutdown);

    loop {
        let now = Utc::now();
        let next = schedule.next_after(now);
        info!("下次同步时间: {}", next);

        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = &mut shutdown => {
                info!("收到退出信号，停止调度");
                break;
            }
        }

        let late = Utc::now() - next;
        if late > Duration::seconds(PAST_DUE_SECS) {
            warn!("定时器已过期 (past due)，延迟 {} 秒", late.num_seconds());
        }

        runs.retain(|h| !h.is_finished());
        let running = active.load(Ordering::SeqCst);
        if running > 0 {
            // 重叠运行按对象名覆盖写入，结果以最后写入为准
            warn!("上一次同步仍在运行 ({} 个)，本次运行将与其重叠", running);
        }

        let config = config.clone();
        let cancel = cancel.clone();
        let active = active.clone();
        active.fetch_add(1, Ordering::SeqCst);
        runs.push(tokio::spawn(async move {
            let _guard = scopeguard::guard(active, |a| {
                a.fetch_sub(1, Ordering::SeqCst);
            });
            run_once(&config, cancel).await
        }));
    }

    cancel.store(true, Ordering::SeqCst);
    for run in runs {
        if let Err(e) = run.await {
            error!("同步任务异常退出: {}", e);
        }
    }
    info!("调度已停止");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_parse_daily_times() {
        let schedule: Schedule = "17:00, 12:00".parse().unwrap();
        assert_eq!(
            schedule,
            Schedule::Daily(vec![
                NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            ])
        );
    }

    #[test]
    fn test_cron_matches_daily_form() {
        let cron: Schedule = "0 0 12,17 * * *".parse().unwrap();
        let daily: Schedule = "12:00,17:00".parse().unwrap();
        assert_eq!(cron, daily);
        assert!("0 0 12 1 * *".parse::<Schedule>().is_err());
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(
            "every 30m".parse::<Schedule>().unwrap(),
            Schedule::Every(Duration::minutes(30))
        );
        assert!("every 0s".parse::<Schedule>().is_err());
        assert!("every 5w".parse::<Schedule>().is_err());
        assert!("every".parse::<Schedule>().is_err());
        assert!("".parse::<Schedule>().is_err());
    }

    #[test]
    fn test_next_after_daily() {
        let schedule: Schedule = "12:00,17:00".parse().unwrap();
        assert_eq!(schedule.next_after(at(9, 0)), at(12, 0));
        assert_eq!(schedule.next_after(at(12, 0)), at(17, 0));
        assert_eq!(
            schedule.next_after(at(18, 30)),
            Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_after_interval() {
        let schedule = Schedule::Every(Duration::hours(2));
        assert_eq!(schedule.next_after(at(9, 0)), at(11, 0));
    }

    #[tokio::test]
    async fn test_run_once_with_missing_config_aborts() {
        let summary = run_once(&AppConfig::default(), Arc::new(AtomicBool::new(false))).await;
        assert!(!summary.is_completed());
        assert!(matches!(
            summary.abort_reason,
            Some(SyncError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let cancel = Arc::new(AtomicBool::new(false));
        let config = AppConfig {
            schedule: "every 1h".to_string(),
            ..Default::default()
        };
        serve(config, cancel.clone(), async {}).await.unwrap();
        assert!(cancel.load(Ordering::SeqCst));
    }
}
