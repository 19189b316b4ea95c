//! 监听循环、调度循环与停机流程。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 每条连接是一个 Tokio 任务，独占自己的 [`Session`] 与缓冲对，互不共享可变状态；
//! - 扫描调度与连接服务并行运行：调度是同步的（可能 fork、读写加锁文件），
//!   因此每一轮都放到阻塞线程池执行；
//! - 收到停机信号后不再接受新连接，给在途会话一段宽限期，超时后强制中止。
//!
//! ## 逻辑 (How)
//! 1. [`Daemon::bind`]：装配存储、认证、授权与扫描队列，绑定端点，按需装载 TLS；
//! 2. [`Daemon::run`]：`select!` 监听停机信号、新连接与已结束的会话任务；
//!    后台任务按 `pass_interval` 运行调度，TLS 启用时在 `SIGHUP` 上重新装载证书；
//! 3. 停机：通知后台任务退出，在宽限期内等待会话结束，余下的中止。
//!
//! ## 契约 (What)
//! - `bind` 失败返回 [`ServeError`]，此时没有任何任务被启动；
//! - 单个连接的握手或会话失败只记录日志，不影响监听循环。

use gantry_protocol::auth::RoleAuthorizer;
use gantry_protocol::store::ResourceStore;
use gantry_protocol::{CommandRegistry, ProtocolEngine, Services, Session, standard_registry};
use gantry_scan::{
    ExecLauncher, FileScanQueue, ForkLauncher, ScanQueue, ScanScheduler, WorkerLauncher,
};
use gantry_transport::{
    DuplexBuffers, Endpoint, Listener, RawSocket, TlsAcceptor, Transport, TransportError,
    load_server_config,
};
use std::{ffi::OsString, future::Future, io, path::Path, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::watch,
    task::JoinSet,
    time::MissedTickBehavior,
};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{ConfigError, DaemonConfig, LauncherKind, TlsConfig};
use crate::json_store::JsonStore;

/// 接受连接失败后的退避时间，避免在文件描述符耗尽时空转。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// 按配置装配命令可用的协作方。
pub fn build_services(config: &DaemonConfig, queue: Arc<dyn ScanQueue>) -> Services {
    let store: Arc<dyn ResourceStore> = Arc::new(JsonStore::open(&config.storage.catalog_path));
    Services {
        store: Arc::clone(&store),
        authenticator: Arc::new(config.user_table()),
        authorizer: Arc::new(RoleAuthorizer::new(store)),
        scan_queue: queue,
        settings: config.protocol_settings(),
    }
}

/// 工作进程命令行的固定部分：`[--config <path>] scan-worker`，
/// 启动器再追加 `--report-id <id>`。
pub fn worker_args(config_path: Option<&Path>) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    if let Some(path) = config_path {
        args.push("--config".into());
        args.push(path.as_os_str().to_owned());
    }
    args.push("scan-worker".into());
    args
}

/// 配置选定的工作进程启动器。
///
/// 两种启动器都重新执行当前程序的 `scan-worker` 子命令；`Exec` 必须在 Tokio
/// 运行时内调用。
pub fn worker_launcher(
    config: &DaemonConfig,
    config_path: Option<&Path>,
) -> io::Result<Arc<dyn WorkerLauncher>> {
    let program = std::env::current_exe()?;
    let args = worker_args(config_path);
    Ok(match config.scheduler.launcher {
        LauncherKind::Exec => Arc::new(ExecLauncher::new(
            program,
            args,
            tokio::runtime::Handle::current(),
        )),
        LauncherKind::Fork => Arc::new(ForkLauncher::new(program, args)),
    })
}

/// 每条连接共用的只读设置。
struct ConnectionSettings {
    registry: Arc<CommandRegistry>,
    services: Services,
    tls: Option<TlsAcceptor>,
    inbound_capacity: usize,
    outbound_capacity: usize,
    idle_timeout: Duration,
}

pub struct Daemon {
    listener: Listener,
    connections: Arc<ConnectionSettings>,
    scheduler: Arc<ScanScheduler>,
    pass_interval: Duration,
    shutdown_grace: Duration,
    tls_files: Option<TlsConfig>,
}

impl Daemon {
    pub async fn bind(
        config: &DaemonConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self, ServeError> {
        config.validate()?;
        let endpoint = config.endpoint()?;
        let tls = match &config.tls {
            Some(files) => {
                let server_config = load_server_config(&files.certificate, &files.private_key)?;
                Some(TlsAcceptor::new(server_config, files.handshake_timeout))
            }
            None => {
                if matches!(endpoint, Endpoint::Tcp(_)) {
                    warn!(endpoint = %endpoint, "serving plaintext on a TCP endpoint");
                }
                None
            }
        };
        if config.users.is_empty() {
            warn!("no users configured; every authentication attempt will fail");
        }

        let queue: Arc<dyn ScanQueue> = Arc::new(FileScanQueue::open(&config.scheduler.queue_path));
        let scheduler = ScanScheduler::new(
            Arc::clone(&queue),
            launcher,
            config.scheduler.max_concurrent,
        );
        let services = build_services(config, queue);
        let listener = Listener::bind(&endpoint, config.listen.unix_mode).await?;

        Ok(Self {
            listener,
            connections: Arc::new(ConnectionSettings {
                registry: Arc::new(standard_registry()),
                services,
                tls,
                inbound_capacity: config.session.inbound_capacity,
                outbound_capacity: config.session.outbound_capacity,
                idle_timeout: config.session.idle_timeout,
            }),
            scheduler: Arc::new(scheduler),
            pass_interval: config.scheduler.pass_interval,
            shutdown_grace: config.session.shutdown_grace,
            tls_files: config.tls.clone(),
        })
    }

    /// 实际绑定的端点。
    pub fn local_endpoint(&self) -> &Endpoint {
        self.listener.endpoint()
    }

    /// 服务直到 `shutdown` 完成。
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let (stop, stopped) = watch::channel(false);
        let mut background = JoinSet::new();
        background.spawn(schedule_scans(
            Arc::clone(&self.scheduler),
            self.pass_interval,
            stopped.clone(),
        ));
        if let (Some(acceptor), Some(files)) = (&self.connections.tls, &self.tls_files) {
            background.spawn(reload_on_hangup(acceptor.clone(), files.clone(), stopped));
        }

        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let span = info_span!("session", %peer);
                        sessions.spawn(
                            serve_connection(Arc::clone(&self.connections), socket).instrument(span),
                        );
                    }
                    Err(err) => {
                        warn!(code = err.code(), error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = joined
                        && err.is_panic()
                    {
                        error!(error = %err, "session task panicked");
                    }
                }
            }
        }

        info!(
            in_flight = sessions.len(),
            grace = ?self.shutdown_grace,
            "shutting down; no longer accepting connections"
        );
        let _ = stop.send(true);
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(aborted = sessions.len(), "grace period over; aborting sessions");
            sessions.shutdown().await;
        }
        while background.join_next().await.is_some() {}
        info!("shutdown complete");
    }
}

async fn serve_connection(settings: Arc<ConnectionSettings>, socket: RawSocket) {
    let transport = match &settings.tls {
        Some(acceptor) => match acceptor.accept(socket).await {
            Ok(transport) => transport,
            Err(err) => {
                info!(code = err.code(), error = %err, "tls handshake failed");
                return;
            }
        },
        None => Transport::plain(socket),
    };
    debug!(tls = transport.is_tls(), "session started");
    let engine = ProtocolEngine::new(Arc::clone(&settings.registry), settings.services.clone());
    let buffers = DuplexBuffers::new(settings.inbound_capacity, settings.outbound_capacity);
    // 结束原因与错误已由会话记录。
    let _ = Session::new(transport, buffers, engine)
        .with_idle_timeout(settings.idle_timeout)
        .run()
        .await;
}

async fn schedule_scans(
    scheduler: Arc<ScanScheduler>,
    every: Duration,
    mut stopped: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stopped.changed() => break,
            _ = ticker.tick() => {}
        }
        let pass = Arc::clone(&scheduler);
        match tokio::task::spawn_blocking(move || pass.run_pass()).await {
            Ok(Ok(report)) if !report.launched.is_empty() || report.failed.is_some() => info!(
                queued = report.queued,
                in_flight = report.in_flight,
                backing_off = report.backing_off,
                launched = report.launched.len(),
                failed = ?report.failed,
                "scheduling pass"
            ),
            Ok(Ok(report)) => debug!(
                queued = report.queued,
                in_flight = report.in_flight,
                "scheduling pass"
            ),
            Ok(Err(err)) => warn!(error = %err, "scheduling pass failed"),
            Err(err) => error!(error = %err, "scheduling pass did not complete"),
        }
    }
    debug!("scheduler stopped");
}

async fn reload_on_hangup(
    acceptor: TlsAcceptor,
    files: TlsConfig,
    mut stopped: watch::Receiver<bool>,
) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "cannot watch SIGHUP; certificate reload disabled");
            return;
        }
    };
    loop {
        tokio::select! {
            biased;
            _ = stopped.changed() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                match load_server_config(&files.certificate, &files.private_key) {
                    Ok(config) => {
                        acceptor.replace_config(config);
                        info!(certificate = %files.certificate.display(), "tls certificates reloaded");
                    }
                    Err(err) => warn!(error = %err, "tls reload failed; keeping previous certificates"),
                }
            }
        }
    }
}

/// 等待 `SIGTERM` 或 `SIGINT`。
pub async fn termination() {
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = terminate.recv() => info!("received SIGTERM"),
            }
        }
        Err(err) => {
            warn!(error = %err, "cannot watch SIGTERM; waiting for SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_scan::{LaunchError, MemoryScanQueue, ScanEntry};
    use tracing_test::traced_test;

    struct SelfLauncher;

    impl WorkerLauncher for SelfLauncher {
        fn launch(&self, _entry: &ScanEntry) -> Result<i32, LaunchError> {
            Ok(std::process::id() as i32)
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn scheduler_loop_dispatches_until_stopped() {
        let queue = Arc::new(MemoryScanQueue::new());
        queue.enqueue(ScanEntry::new("r-1", 1, 1, "alice")).unwrap();
        let scheduler = Arc::new(ScanScheduler::new(queue.clone(), Arc::new(SelfLauncher), 2));
        let (stop, stopped) = watch::channel(false);

        let observe = async {
            while queue.snapshot().unwrap()[0].handler_pid.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stop.send(true).unwrap();
        };
        let both = async {
            tokio::join!(
                schedule_scans(scheduler, Duration::from_millis(10), stopped),
                observe
            )
        };
        tokio::time::timeout(Duration::from_secs(5), both)
            .await
            .expect("scheduler loop stops when asked");

        assert!(logs_contain("scheduling pass"));
        assert!(logs_contain("launched=1"));
    }

    #[test]
    fn worker_command_line_carries_the_config_path() {
        assert_eq!(worker_args(None), [OsString::from("scan-worker")]);
        assert_eq!(
            worker_args(Some(Path::new("/etc/gantryd.toml"))),
            ["--config", "/etc/gantryd.toml", "scan-worker"].map(OsString::from)
        );
    }

    #[test]
    fn services_follow_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.storage.catalog_path = dir.path().join("catalog.json");
        config.session.default_rows = 25;
        let services = build_services(&config, Arc::new(MemoryScanQueue::new()));
        assert_eq!(services.settings.default_rows, 25);
        let tasks = gantry_protocol::query::QueryDescriptor::all("task");
        assert_eq!(services.store.count(&tasks).unwrap(), 0);
    }
}
