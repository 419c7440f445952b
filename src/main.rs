//! blobsync 命令行入口：按计划把源账户的所有容器增量复制到目标账户
//!
//!   blobsync run      执行一次同步，退出码反映运行状态
//!   blobsync serve    按配置的计划持续运行，直到 Ctrl-C
//!   blobsync check    检查源和目标是否可访问

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use blobsync::config::{AppConfig, ENV_UAMI_CLIENT_ID};
use blobsync::logging::init_logging;
use blobsync::scheduler::{run_once, serve};
use blobsync::storage::{create_store, probe};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

const AFTER_HELP: &str = "\
环境变量:
    BLOBSYNC_CONFIG         JSON 配置文件路径
    SOURCE_ACCOUNT_URL      覆盖 source.url
    DEST_ACCOUNT_URL        覆盖 destination.url
    STORAGE_CREDENTIAL      覆盖两个账户的凭据（SAS 令牌）
    SYNC_SCHEDULE           覆盖同步计划（\"12:00,17:00\"、\"every 30m\"、
                            \"0 0 12,17 * * *\"）
    RUST_LOG                日志过滤，优先于 --log-level

不支持:
    UAMI_CLIENT_ID          托管身份登录不可用，设置后仅记录警告；
                            请改用 STORAGE_CREDENTIAL 提供 SAS 令牌";

#[derive(Parser)]
#[command(
    name = "blobsync",
    version,
    about = "按计划在 Blob 存储账户之间增量复制",
    after_help = AFTER_HELP
)]
struct Cli {
    /// 配置文件路径
    #[arg(long, global = true, env = "BLOBSYNC_CONFIG")]
    config: Option<PathBuf>,
    /// 日志级别（trace、debug、info、warn、error）
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 执行一次同步后退出
    Run,
    /// 按计划持续运行，直到 Ctrl-C
    Serve,
    /// 检查源和目标是否可访问
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("加载配置失败: {:#}", e);
            return ExitCode::from(2);
        }
    };
    let _guard = init_logging(&config.log, cli.log_level.as_deref());
    for key in AppConfig::unsupported_env(|k| std::env::var(k).ok()) {
        if key == ENV_UAMI_CLIENT_ID {
            warn!("不支持托管身份 ({})，将使用 SAS 令牌访问存储账户", key);
        } else {
            warn!("环境变量 {} 不受支持，已忽略", key);
        }
    }

    match cli.command {
        Commands::Run => cmd_run(&config).await,
        Commands::Serve => cmd_serve(config).await,
        Commands::Check => cmd_check(&config).await,
    }
}

/// Ctrl-C 设置共享的取消标志
fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到 Ctrl-C，取消同步");
            flag.store(true, Ordering::SeqCst);
        }
    });
    cancel
}

async fn cmd_run(config: &AppConfig) -> ExitCode {
    let summary = run_once(config, cancel_on_ctrl_c()).await;
    if summary.is_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn cmd_serve(config: AppConfig) -> ExitCode {
    let cancel = Arc::new(AtomicBool::new(false));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("无法监听 Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    match serve(config, cancel, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_check(config: &AppConfig) -> ExitCode {
    let mut ok = true;
    for (role, store_config) in [("source", &config.source), ("destination", &config.destination)] {
        let store = match create_store(store_config, config.sync.fingerprint).await {
            Ok(s) => s,
            Err(e) => {
                error!("{}: {}", role, e);
                ok = false;
                continue;
            }
        };
        match probe(store.as_ref()).await {
            Ok(count) => info!("{}: {} 可访问，{} 个容器", role, store.name(), count),
            Err(e) => {
                error!("{}: {} 不可访问: {:#}", role, store.name(), e);
                ok = false;
            }
        }
    }

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
