//! 守护进程配置：TOML 文件 + 全量默认值。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 同一份配置同时服务监听进程与 `scan-worker` 子进程：后者通过 `--config`
//!   拿到与父进程一致的存储路径、调度策略与日志设置；
//! - 每个字段都有默认值，空文件即合法配置，便于本地试跑。
//!
//! ## 逻辑 (How)
//! 1. 读取文件并以 `toml` 反序列化，时长字段经 [`humantime`] 解析（如 `"90s"`、`"1m 30s"`）；
//! 2. 相对路径以配置文件所在目录为基准改写为绝对路径；
//! 3. [`DaemonConfig::validate`] 检查端点可解析、容量与节拍非零。
//!
//! ## 契约 (What)
//! - 加载失败返回 [`ConfigError`]，错误信息带 `gantryd.config.*` 代码；
//! - `check-config` 子命令把规范化后的配置重新序列化输出。

use gantry_protocol::auth::{UserRecord, UserTable};
use gantry_protocol::ProtocolSettings;
use gantry_scan::WorkerPolicy;
use gantry_transport::Endpoint;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

use crate::logging::{LogFormat, LogLevel};

const MIB: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("gantryd.config.read_failed: {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("gantryd.config.parse_failed: {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("gantryd.config.invalid: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub listen: ListenConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    pub session: SessionConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub users: Vec<UserRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenConfig {
    /// `tcp:<ip>:<port>` 或 `unix:<path>`。
    pub endpoint: String,
    /// Unix 套接字文件权限；TCP 端点忽略。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unix_mode: Option<u32>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            endpoint: "unix:/run/gantryd/gantryd.sock".to_owned(),
            unix_mode: Some(0o660),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    #[serde(default = "default_handshake_timeout", with = "duration_text")]
    pub handshake_timeout: Duration,
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    /// 空闲超时；`0s` 关闭。
    #[serde(with = "duration_text")]
    pub idle_timeout: Duration,
    /// 停机时等待在途会话结束的时间，超时后强制中止。
    #[serde(with = "duration_text")]
    pub shutdown_grace: Duration,
    /// 列表请求未指定行数时的默认页大小；负数表示不分页。
    pub default_rows: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: MIB,
            outbound_capacity: MIB,
            idle_timeout: Duration::from_secs(15 * 60),
            shutdown_grace: Duration::from_secs(5),
            default_rows: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherKind {
    /// 重新执行本程序的 `scan-worker` 子命令。
    #[default]
    Exec,
    /// 两次 fork，孙进程再 exec `scan-worker`。
    Fork,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// 并发工作进程上限；0 表示不限。
    pub max_concurrent: usize,
    #[serde(with = "duration_text")]
    pub activity_budget: Duration,
    #[serde(with = "duration_text")]
    pub tick: Duration,
    /// 两轮调度之间的间隔。
    #[serde(with = "duration_text")]
    pub pass_interval: Duration,
    pub launcher: LauncherKind,
    pub queue_path: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            activity_budget: Duration::from_secs(60),
            tick: Duration::from_secs(1),
            pass_interval: Duration::from_secs(5),
            launcher: LauncherKind::Exec,
            queue_path: PathBuf::from("/var/lib/gantryd/scan-queue.json"),
        }
    }
}

impl SchedulerConfig {
    pub fn worker_policy(&self) -> WorkerPolicy {
        WorkerPolicy {
            activity_budget: self.activity_budget,
            max_concurrent: self.max_concurrent,
            tick: self.tick,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub catalog_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("/var/lib/gantryd/catalog.json"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl DaemonConfig {
    /// 加载配置；`path` 为空时使用全部默认值。
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        };
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.rebase_paths(path.parent().unwrap_or_else(|| Path::new(".")));
        config.validate()?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;
        if self.session.inbound_capacity == 0 || self.session.outbound_capacity == 0 {
            return Err(ConfigError::Invalid(
                "session buffer capacities must be non-zero".to_owned(),
            ));
        }
        if self.session.default_rows == 0 {
            return Err(ConfigError::Invalid(
                "session.default_rows must not be zero".to_owned(),
            ));
        }
        if self.scheduler.tick.is_zero() || self.scheduler.pass_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "scheduler.tick and scheduler.pass_interval must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        Endpoint::from_str(&self.listen.endpoint)
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    pub fn protocol_settings(&self) -> ProtocolSettings {
        ProtocolSettings {
            default_rows: self.session.default_rows,
            ..ProtocolSettings::default()
        }
    }

    pub fn user_table(&self) -> UserTable {
        UserTable::new(self.users.clone())
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    fn rebase_paths(&mut self, base: &Path) {
        let join = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        if let Some(tls) = &mut self.tls {
            join(&mut tls.certificate);
            join(&mut tls.private_key);
        }
        join(&mut self.scheduler.queue_path);
        join(&mut self.storage.catalog_path);
        if let Some(file) = &mut self.logging.file {
            join(file);
        }
        if let Some(path) = self.listen.endpoint.strip_prefix("unix:")
            && Path::new(path).is_relative()
        {
            self.listen.endpoint = format!("unix:{}", base.join(path).display());
        }
    }
}

/// 以人类可读文本（`humantime`）表示的时长。
mod duration_text {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(text.trim()).map_err(D::Error::custom)
    }
}
