use nix::errno::Errno;
use std::{io, path::PathBuf};
use thiserror::Error;

/// 加锁 JSON 文档的读写失败。
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("gantry.scan.persist_io: {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("gantry.scan.persist_lock: cannot lock {}: {errno}", .path.display())]
    Lock { path: PathBuf, errno: Errno },
    #[error("gantry.scan.persist_corrupt: {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("gantry.scan.already_queued: report {0} is already queued")]
    AlreadyQueued(String),
}

/// 启动扫描工作进程失败。队列项保持原样，下一轮调度会再次尝试。
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("gantry.scan.pipe_failed: {0}")]
    Pipe(#[source] Errno),
    #[error("gantry.scan.fork_failed: {0}")]
    Fork(#[source] Errno),
    #[error("gantry.scan.pid_handoff_failed: {0}")]
    PidHandoff(#[source] io::Error),
    #[error("gantry.scan.wait_failed: {0}")]
    Wait(#[source] Errno),
    #[error("gantry.scan.intermediate_failed: intermediate process exited with {0}")]
    Intermediate(i32),
    #[error("gantry.scan.spawn_failed: {0}")]
    Spawn(#[source] io::Error),
}

/// 工作进程内部失败：队列访问或扫描推进出错。
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("gantry.scan.progress_failed: {0}")]
    Progress(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("gantry.scan.identity_failed: cannot act as {owner}: {reason}")]
    Identity { owner: String, reason: String },
}

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error(transparent)]
    Queue(#[from] QueueError),
}
