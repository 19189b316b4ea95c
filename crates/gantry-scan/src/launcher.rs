//! 扫描工作进程的启动方式。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 工作进程必须脱离调度者独立运行：调度者不等待它结束，它结束时也不能
//!   变成调度者名下的僵尸进程；
//! - [`ForkLauncher`] 用经典的两次 fork 达成这一点：中间进程 fork 出工作进程后
//!   立即退出，工作进程被 init 收养；中间进程通过管道把工作进程 pid 交回；
//! - [`ExecLauncher`] 则由 Tokio 启动子进程并在后台任务里回收。
//!
//! ## 逻辑 (How)
//! - 两种启动器都执行同一条命令（守护进程的 `scan-worker` 子命令）；
//! - 调用方运行在多线程运行时里，fork 时其他线程可能持有分配器或日志的锁。
//!   因此 `execv` 的参数、`/dev/null` 句柄与管道都在 fork 之前准备好，
//!   子进程只调用 `fork`、`setsid`、`dup2`、`write`、`execv` 与 `_exit`；
//! - 监听套接字、连接套接字与管道都带 `O_CLOEXEC`，exec 之后不会泄漏给工作进程。
//!
//! ## 契约 (What)
//! - `launch` 成功返回工作进程 pid；失败返回 [`LaunchError`]，队列条目不受影响；
//! - pid 交接格式：4 字节本机字节序的 `i32`，短读或读失败都视为调度失败；
//! - exec 失败时工作进程以 127 退出，调度器下一轮会看到 pid 已不存在。

use crate::{entry::ScanEntry, error::LaunchError};
use nix::{
    fcntl::OFlag,
    sys::wait::{WaitStatus, waitpid},
    unistd::{ForkResult, fork, pipe2, setsid},
};
use std::{
    ffi::{CString, OsStr, OsString},
    fs::File,
    io::{self, Read, Write},
    os::{fd::AsRawFd, unix::ffi::OsStrExt},
    path::{Path, PathBuf},
    process::Stdio,
};
use tracing::{debug, warn};

/// 启动一个负责 `entry` 的工作进程，返回其 pid。
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, entry: &ScanEntry) -> Result<i32, LaunchError>;
}

const PID_WIDTH: usize = std::mem::size_of::<i32>();

/// exec 失败时孙进程的退出码，与 shell 的“命令无法执行”一致。
const EXEC_FAILED: i32 = 127;

/// fork 之前备好的 `execv` 参数。
struct ExecImage {
    program: CString,
    argv: Vec<CString>,
}

impl ExecImage {
    fn new<'a>(program: &Path, args: impl IntoIterator<Item = &'a OsStr>) -> io::Result<Self> {
        let c_string = |text: &OsStr| CString::new(text.as_bytes()).map_err(io::Error::from);
        let program_c = c_string(program.as_os_str())?;
        let mut argv = vec![program_c.clone()];
        for arg in args {
            argv.push(c_string(arg)?);
        }
        Ok(Self {
            program: program_c,
            argv,
        })
    }

    /// 以空指针结尾的 `argv`；指针借用 `self`。
    fn pointers(&self) -> Vec<*const libc::c_char> {
        self.argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect()
    }
}

/// 两次 fork 启动 `program args...`，返回已脱离的工作进程 pid。
///
/// 工作进程的标准输入指向 `/dev/null`，并成为新会话的首进程。
pub fn spawn_detached(program: &Path, args: &[OsString]) -> Result<i32, LaunchError> {
    let image = ExecImage::new(program, args.iter().map(OsString::as_os_str))
        .map_err(LaunchError::Spawn)?;
    let argv = image.pointers();
    let devnull = File::open("/dev/null").map_err(LaunchError::Spawn)?;
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(LaunchError::Pipe)?;

    // SAFETY: 子进程分支只调用异步信号安全的函数，并以 `_exit` 结束，不返回调用方栈帧。
    match unsafe { fork() }.map_err(LaunchError::Fork)? {
        ForkResult::Child => {
            drop(read_end);
            // SAFETY: 同上。
            let code = match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    drop(write_end);
                    let _ = setsid();
                    // SAFETY: `dup2` 与 `execv` 只使用 fork 之前分配好的描述符和参数。
                    unsafe {
                        libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO);
                        libc::execv(image.program.as_ptr(), argv.as_ptr());
                        libc::_exit(EXEC_FAILED)
                    }
                }
                Ok(ForkResult::Parent { child }) => {
                    let mut pipe = File::from(write_end);
                    match pipe.write_all(&child.as_raw().to_ne_bytes()) {
                        Ok(()) => 0,
                        Err(_) => 1,
                    }
                }
                Err(_) => 1,
            };
            // SAFETY: 中间进程立即退出，不运行 atexit 处理器。
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            drop(write_end);
            drop(devnull);
            let mut bytes = [0u8; PID_WIDTH];
            let handoff = File::from(read_end).read_exact(&mut bytes);
            let waited = waitpid(child, None);
            handoff.map_err(LaunchError::PidHandoff)?;
            match waited.map_err(LaunchError::Wait)? {
                WaitStatus::Exited(_, 0) => {}
                WaitStatus::Exited(_, code) => return Err(LaunchError::Intermediate(code)),
                other => {
                    warn!(status = ?other, "intermediate process ended abnormally");
                    return Err(LaunchError::Intermediate(-1));
                }
            }
            Ok(i32::from_ne_bytes(bytes))
        }
    }
}

/// 两次 fork 启动器：`program args... --report-id <id>`。
#[derive(Clone, Debug)]
pub struct ForkLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ForkLauncher {
    pub fn new(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl WorkerLauncher for ForkLauncher {
    fn launch(&self, entry: &ScanEntry) -> Result<i32, LaunchError> {
        let mut args = self.args.clone();
        args.push("--report-id".into());
        args.push(entry.report_id.clone().into());
        let pid = spawn_detached(&self.program, &args)?;
        debug!(report_id = %entry.report_id, pid, "forked scan worker");
        Ok(pid)
    }
}

/// 重新执行守护进程的启动器：`program args... --report-id <id>`。
#[derive(Clone, Debug)]
pub struct ExecLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    runtime: tokio::runtime::Handle,
}

impl ExecLauncher {
    pub fn new(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            runtime,
        }
    }
}

impl WorkerLauncher for ExecLauncher {
    fn launch(&self, entry: &ScanEntry) -> Result<i32, LaunchError> {
        let _guard = self.runtime.enter();
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg("--report-id")
            .arg(&entry.report_id)
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(LaunchError::Spawn)?;
        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or_else(|| {
                LaunchError::Spawn(std::io::Error::other("worker exited before reporting a pid"))
            })?;
        let report_id = entry.report_id.clone();
        self.runtime.spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(%report_id, pid, "scan worker exited");
                }
                Ok(status) => warn!(%report_id, pid, %status, "scan worker exited abnormally"),
                Err(err) => warn!(%report_id, pid, error = %err, "failed to reap scan worker"),
            }
        });
        debug!(report_id = %entry.report_id, pid, "spawned scan worker");
        Ok(pid)
    }
}
