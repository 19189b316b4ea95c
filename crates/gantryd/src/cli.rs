//! 命令行参数。

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::logging::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "gantryd", version, about = "Gantry management daemon")]
pub struct Cli {
    /// 配置文件（TOML）；省略时使用内置默认值。
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// 提高日志级别（可重复：-v、-vv）。
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// 日志文件，覆盖配置中的 `logging.file`。
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    /// 日志格式，覆盖配置中的 `logging.format`。
    #[arg(long = "log-format", value_enum, global = true)]
    pub log_format: Option<CliLogFormat>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Clone, Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// 监听管理协议并调度扫描（默认）。
    Serve {
        /// 覆盖配置中的监听端点，如 `tcp:127.0.0.1:9390`。
        #[arg(long)]
        listen: Option<String>,
    },
    /// 以工作进程身份推进一个已排队的扫描（由调度器启动）。
    ScanWorker {
        #[arg(long = "report-id")]
        report_id: String,
    },
    /// 校验配置并打印规范化结果。
    CheckConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CliLogFormat {
    Text,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Text => LogFormat::Text,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

impl Cli {
    /// 实际要执行的子命令；未给出时为 `serve`。
    pub fn action(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Serve { listen: None })
    }
}
