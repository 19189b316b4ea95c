#![doc = r#"
# gantryd

## 设计目标（Why）
- 把传输层、协议引擎与扫描调度装配成一个可部署的守护进程；
- 同一个二进制既是监听进程，也是调度器重新执行出来的 `scan-worker`。

## 核心契约（What）
- `serve`（默认）：绑定配置的端点，为每条连接运行一个会话，周期调度扫描；
- `scan-worker --report-id <id>`：推进一个已排队的扫描，退出码 0 表示已移到队尾或已移除；
- `check-config`：校验并打印规范化配置。

## 实现策略（How）
- 配置见 [`config`]，日志见 [`logging`]；
- 资源目录保存在加锁 JSON 文档中（[`json_store::JsonStore`]），与扫描队列同样
  可被工作进程重新打开。
"#]

pub mod cli;
pub mod config;
pub mod json_store;
pub mod logging;
pub mod progress;
pub mod server;
pub mod worker;

use anyhow::Context;
use std::{path::PathBuf, process::ExitCode};
use tracing::info;

use cli::{Cli, Command};
use config::DaemonConfig;
use logging::init_logging;
use server::{Daemon, termination, worker_launcher};
use worker::{DaemonWorkerEnvironment, run_scan_worker};

/// 执行命令行选定的动作。
pub fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = DaemonConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let action = cli.action();
    if action == Command::CheckConfig {
        print!("{}", config.to_toml().context("rendering configuration")?);
        return Ok(ExitCode::SUCCESS);
    }

    let log_file = cli.log_file.clone().or_else(|| config.logging.file.clone());
    init_logging(
        config.logging.level.raised(cli.verbose),
        log_file.as_deref(),
        cli.log_format.map_or(config.logging.format, Into::into),
    )
    .context("initialising logging")?;

    match action {
        Command::ScanWorker { report_id } => {
            let environment = DaemonWorkerEnvironment::new(&config);
            let code = run_scan_worker(&config, &environment, &report_id);
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
        }
        Command::Serve { listen } => {
            if let Some(endpoint) = listen {
                config.listen.endpoint = endpoint;
            }
            let config_path = cli
                .config
                .as_deref()
                .map(std::path::absolute)
                .transpose()
                .context("resolving the configuration path")?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("gantryd")
                .build()
                .context("building the async runtime")?;
            runtime.block_on(serve(config, config_path))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::CheckConfig => Ok(ExitCode::SUCCESS),
    }
}

async fn serve(config: DaemonConfig, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let launcher = worker_launcher(&config, config_path.as_deref())
        .context("preparing the scan worker launcher")?;
    let daemon = Daemon::bind(&config, launcher)
        .await
        .context("starting the daemon")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %daemon.local_endpoint(),
        launcher = ?config.scheduler.launcher,
        "gantryd ready"
    );
    daemon.run(termination()).await;
    Ok(())
}
