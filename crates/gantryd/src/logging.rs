//! 结构化日志初始化。
//!
//! 级别来自配置文件，命令行每个 `-v` 再提高一级；设置了 `RUST_LOG` 时以环境变量为准。
//! 输出目标为标准错误或追加写入的日志文件，格式为文本或 JSON。

use serde::{Deserialize, Serialize};
use std::{io, path::Path};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 本守护进程各 crate 的日志目标。
const TARGETS: [&str; 4] = ["gantryd", "gantry_protocol", "gantry_scan", "gantry_transport"];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// 在当前级别上再提高 `steps` 级，最高到 `Trace`。
    pub fn raised(self, steps: u8) -> Self {
        let levels = [Self::Error, Self::Warn, Self::Info, Self::Debug, Self::Trace];
        let index = (self as usize).saturating_add(usize::from(steps));
        levels[index.min(levels.len() - 1)]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("gantryd.logging.open_failed: {}: {source}", .path.display())]
    Open {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("gantryd.logging.install_failed: {0}")]
    Install(String),
}

/// 未设置 `RUST_LOG` 时使用的过滤指令。
pub fn default_directives(level: LogLevel) -> String {
    TARGETS
        .iter()
        .map(|target| format!("{target}={}", level.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

/// 安装全局订阅者；进程内只能成功一次。
pub fn init_logging(
    level: LogLevel,
    log_file: Option<&Path>,
    format: LogFormat,
) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));
    let detailed = level >= LogLevel::Debug;
    let installed = match (log_file, format) {
        (None, LogFormat::Text) => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_file(detailed)
                    .with_line_number(detailed),
            )
            .try_init(),
        (None, LogFormat::Json) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .try_init(),
        (Some(path), LogFormat::Text) => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(open_append(path)?)
                    .with_ansi(false)
                    .with_target(true)
                    .with_file(detailed)
                    .with_line_number(detailed),
            )
            .try_init(),
        (Some(path), LogFormat::Json) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(open_append(path)?))
            .try_init(),
    };
    installed.map_err(|err| LoggingError::Install(err.to_string()))
}

fn open_append(path: &Path) -> Result<std::fs::File, LoggingError> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::Open {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_the_configured_level() {
        assert_eq!(LogLevel::Info.raised(0), LogLevel::Info);
        assert_eq!(LogLevel::Info.raised(1), LogLevel::Debug);
        assert_eq!(LogLevel::Warn.raised(9), LogLevel::Trace);
    }

    #[test]
    fn directives_cover_every_crate() {
        assert_eq!(
            default_directives(LogLevel::Debug),
            "gantryd=debug,gantry_protocol=debug,gantry_scan=debug,gantry_transport=debug"
        );
    }

    #[test]
    fn unwritable_log_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_append(&dir.path().join("missing").join("gantryd.log")).unwrap_err();
        assert!(matches!(err, LoggingError::Open { .. }));
    }
}
