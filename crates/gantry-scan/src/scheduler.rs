use crate::{
    entry::ScanEntry,
    error::SchedulingError,
    launcher::WorkerLauncher,
    queue::ScanQueue,
};
use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info, warn};

/// 连续失败后最多跳过的调度轮数。
const MAX_BACKOFF_PASSES: u64 = 32;

/// 判断进程是否仍然存在。
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: i32) -> bool;
}

/// 通过 `kill(pid, 0)` 探测；`EPERM` 说明进程存在但属于其他用户。
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalProbe;

impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// 一轮调度的结果。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub queued: usize,
    /// 本轮开始时仍有存活工作进程的条目数。
    pub in_flight: usize,
    /// `(report_id, pid)`。
    pub launched: Vec<(String, i32)>,
    /// 启动失败而中止本轮的条目。
    pub failed: Option<String>,
    /// 因工作进程连续失败而本轮跳过的条目数。
    pub backing_off: usize,
}

/// 一个条目的连续失败记录。
#[derive(Clone, Copy, Debug)]
struct Backoff {
    /// 已计入失败的工作进程 pid，同一个 pid 只计一次。
    pid: i32,
    failures: u32,
    resume_at: u64,
}

/// 第 `failures` 次连续失败之后跳过的轮数：首次失败立即重试，之后指数增长。
fn backoff_passes(failures: u32) -> u64 {
    match failures {
        0 | 1 => 0,
        n => (1u64 << (n - 2).min(6)).min(MAX_BACKOFF_PASSES),
    }
}

#[derive(Debug, Default)]
struct PassState {
    pass: u64,
    backoff: HashMap<String, Backoff>,
}

/// 扫描调度器：周期性地把队列中的条目交给工作进程。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 工作进程数量受 `max_concurrent` 约束；已分配且仍存活的条目不重复派发；
/// - 工作进程崩溃后，队列中记录的 pid 已不存在，条目自然重新变为可调度。
///
/// ## 逻辑 (How)
/// 1. 取队列有序快照，统计记录的 pid 仍存活的条目；
/// 2. 按队列顺序为其余条目启动工作进程，直到在途数达到上限（0 表示不限）；
/// 3. 启动成功后用 `assign_handler` 记录 pid；
/// 4. 启动失败记录告警并结束本轮，条目保持原样；
/// 5. 条目仍带着已退出的 pid 说明工作进程失败（退出码 1 或崩溃）：首次失败下一轮
///    立即重试，之后按连续失败次数指数跳过若干轮，上限 `MAX_BACKOFF_PASSES` 轮；
///    条目被正常移到队尾（pid 清除）或移出队列后失败记录随之清除。
///
/// ## 契约 (What)
/// - `run_pass` 是同步的（可能 fork、读写加锁文件），异步调用方应放到阻塞线程池执行。
pub struct ScanScheduler {
    queue: Arc<dyn ScanQueue>,
    launcher: Arc<dyn WorkerLauncher>,
    probe: Arc<dyn ProcessProbe>,
    max_concurrent: usize,
    state: Mutex<PassState>,
}

impl ScanScheduler {
    pub fn new(
        queue: Arc<dyn ScanQueue>,
        launcher: Arc<dyn WorkerLauncher>,
        max_concurrent: usize,
    ) -> Self {
        Self::with_probe(queue, launcher, Arc::new(SignalProbe), max_concurrent)
    }

    pub fn with_probe(
        queue: Arc<dyn ScanQueue>,
        launcher: Arc<dyn WorkerLauncher>,
        probe: Arc<dyn ProcessProbe>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            queue,
            launcher,
            probe,
            max_concurrent,
            state: Mutex::new(PassState::default()),
        }
    }

    pub fn run_pass(&self) -> Result<PassReport, SchedulingError> {
        let entries = self.queue.snapshot()?;
        let mut report = PassReport {
            queued: entries.len(),
            ..PassReport::default()
        };
        let mut state = self.state.lock();
        state.pass += 1;
        let pass = state.pass;
        state
            .backoff
            .retain(|id, _| entries.iter().any(|entry| &entry.report_id == id));

        let mut pending: Vec<&ScanEntry> = Vec::new();
        for entry in &entries {
            match entry.handler_pid {
                Some(pid) if self.probe.is_alive(pid) => report.in_flight += 1,
                Some(pid) => {
                    // 条目仍带着已退出的 pid：工作进程没有把它移到队尾或移除。
                    let backoff = state
                        .backoff
                        .entry(entry.report_id.clone())
                        .or_insert(Backoff {
                            pid,
                            failures: 0,
                            resume_at: pass,
                        });
                    if backoff.failures == 0 || backoff.pid != pid {
                        backoff.pid = pid;
                        backoff.failures += 1;
                        backoff.resume_at = pass + backoff_passes(backoff.failures);
                        if backoff.failures == 1 {
                            info!(report_id = %entry.report_id, pid, "scan worker is gone; rescheduling");
                        } else {
                            warn!(
                                report_id = %entry.report_id,
                                pid,
                                failures = backoff.failures,
                                skip_passes = backoff.resume_at - pass,
                                "scan worker keeps failing; backing off"
                            );
                        }
                    }
                    if pass < backoff.resume_at {
                        debug!(report_id = %entry.report_id, resume_at = backoff.resume_at, "backing off");
                        report.backing_off += 1;
                        continue;
                    }
                    pending.push(entry);
                }
                None => {
                    state.backoff.remove(&entry.report_id);
                    pending.push(entry);
                }
            }
        }
        drop(state);

        let mut active = report.in_flight;
        for entry in pending {
            if self.max_concurrent > 0 && active >= self.max_concurrent {
                break;
            }
            match self.launcher.launch(entry) {
                Ok(pid) => {
                    if !self.queue.assign_handler(&entry.report_id, pid)? {
                        info!(report_id = %entry.report_id, pid, "entry left the queue during launch");
                    }
                    report.launched.push((entry.report_id.clone(), pid));
                    active += 1;
                }
                Err(err) => {
                    warn!(report_id = %entry.report_id, error = %err, "failed to launch scan worker");
                    report.failed = Some(entry.report_id.clone());
                    break;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::LaunchError, queue::MemoryScanQueue};
    use nix::errno::Errno;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct FakeLauncher {
        next_pid: Mutex<i32>,
        fail_on: Option<&'static str>,
        launched: Mutex<Vec<String>>,
    }

    impl WorkerLauncher for FakeLauncher {
        fn launch(&self, entry: &ScanEntry) -> Result<i32, LaunchError> {
            if self.fail_on == Some(entry.report_id.as_str()) {
                return Err(LaunchError::Fork(Errno::EAGAIN));
            }
            self.launched.lock().push(entry.report_id.clone());
            let mut next = self.next_pid.lock();
            *next += 1;
            Ok(1000 + *next)
        }
    }

    #[derive(Default)]
    struct FakeProbe {
        alive: Mutex<HashSet<i32>>,
    }

    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, pid: i32) -> bool {
            self.alive.lock().contains(&pid)
        }
    }

    fn queue(ids: &[&str]) -> Arc<MemoryScanQueue> {
        let queue = Arc::new(MemoryScanQueue::new());
        for id in ids {
            queue.enqueue(ScanEntry::new(*id, 1, 1, "owner")).unwrap();
        }
        queue
    }

    #[test]
    fn pass_respects_concurrency_cap_and_records_pids() {
        let queue = queue(&["a", "b", "c", "d"]);
        let launcher = Arc::new(FakeLauncher::default());
        let probe = Arc::new(FakeProbe::default());
        let scheduler = ScanScheduler::with_probe(queue.clone(), launcher.clone(), probe.clone(), 2);

        let first = scheduler.run_pass().unwrap();
        assert_eq!(first.launched, vec![("a".to_owned(), 1001), ("b".to_owned(), 1002)]);
        probe.alive.lock().extend([1001, 1002]);

        let second = scheduler.run_pass().unwrap();
        assert_eq!(second.in_flight, 2);
        assert!(second.launched.is_empty());

        // a 的工作进程崩溃：条目重新可调度
        probe.alive.lock().remove(&1001);
        let third = scheduler.run_pass().unwrap();
        assert_eq!(third.in_flight, 1);
        assert_eq!(third.launched, vec![("a".to_owned(), 1003)]);
        assert_eq!(*launcher.launched.lock(), ["a", "b", "a"]);
    }

    #[test]
    fn unlimited_cap_launches_everything() {
        let queue = queue(&["a", "b", "c"]);
        let scheduler = ScanScheduler::with_probe(
            queue.clone(),
            Arc::new(FakeLauncher::default()),
            Arc::new(FakeProbe::default()),
            0,
        );
        let report = scheduler.run_pass().unwrap();
        assert_eq!(report.launched.len(), 3);
        assert!(queue.snapshot().unwrap().iter().all(|e| e.handler_pid.is_some()));
    }

    #[test]
    #[traced_test]
    fn launch_failure_leaves_entry_untouched() {
        let queue = queue(&["a", "b"]);
        let launcher = Arc::new(FakeLauncher {
            fail_on: Some("a"),
            ..FakeLauncher::default()
        });
        let scheduler =
            ScanScheduler::with_probe(queue.clone(), launcher, Arc::new(FakeProbe::default()), 0);

        let report = scheduler.run_pass().unwrap();
        assert_eq!(report.failed.as_deref(), Some("a"));
        assert!(report.launched.is_empty());
        let entries = queue.snapshot().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].report_id, "a");
        assert_eq!(entries[0].handler_pid, None);
        assert!(logs_contain("failed to launch scan worker"));
    }

    #[test]
    #[traced_test]
    fn repeatedly_failing_worker_is_backed_off() {
        let queue = queue(&["a"]);
        let launcher = Arc::new(FakeLauncher::default());
        let scheduler = ScanScheduler::with_probe(
            queue.clone(),
            launcher.clone(),
            Arc::new(FakeProbe::default()),
            0,
        );

        // 每次启动的工作进程都立即退出且不改动队列。
        let launches_per_pass: Vec<usize> = (0..11)
            .map(|_| scheduler.run_pass().unwrap().launched.len())
            .collect();
        assert_eq!(launches_per_pass, [1, 1, 0, 1, 0, 0, 1, 0, 0, 0, 0]);
        assert!(logs_contain("scan worker keeps failing; backing off"));

        // 正常移到队尾后清除失败记录，下一轮立即启动。
        queue.move_to_tail("a").unwrap();
        assert_eq!(scheduler.run_pass().unwrap().launched.len(), 1);
        assert_eq!(launcher.launched.lock().len(), 5);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        assert_eq!(
            [1, 2, 3, 4, 5, 20].map(backoff_passes),
            [0, 1, 2, 4, 8, MAX_BACKOFF_PASSES]
        );
    }

    #[test]
    fn signal_probe_sees_current_process() {
        let probe = SignalProbe;
        assert!(probe.is_alive(std::process::id() as i32));
        assert!(!probe.is_alive(0));
    }
}
