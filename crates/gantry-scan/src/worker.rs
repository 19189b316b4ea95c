//! 扫描工作进程内的协作式时间片循环。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 并发工作进程数有上限，而扫描可能持续很久；若一个扫描独占名额直到结束，
//!   队列后面的扫描会被饿死。因此每个工作进程只拥有一段“活动预算”：预算
//!   用完后若队列积压（长度超过并发上限），就把自己移到队尾让出名额；
//!   不积压时继续运行，避免无意义的换出。
//!
//! ## 逻辑 (How)
//! 1. 截止时间 = 启动时刻 + 活动预算；
//! 2. 每轮推进一次扫描，再检查是否仍在进行；完成则立即移除条目；
//! 3. 过了截止时间后查询队列长度，积压则跳出循环；
//! 4. 休眠一个节拍后进入下一轮；
//! 5. 跳出循环时扫描必然仍在进行，于是移到队尾。
//!
//! ## 契约 (What)
//! - 终结动作恰好一次：`move_to_tail` 或 `remove`；
//! - 推进或队列操作失败时返回错误，条目留在队列中，如同进程崩溃。

use crate::{
    entry::ScanEntry,
    error::WorkerError,
    queue::ScanQueue,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 扫描推进的可注入实现。
pub trait ScanProgress {
    /// 推进一步。
    fn advance(&mut self) -> Result<(), WorkerError>;
    /// 扫描是否仍在进行。
    fn is_active(&mut self) -> Result<bool, WorkerError>;
}

/// 时间源；测试用手动时钟替换。
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// 工作进程的时间片策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerPolicy {
    /// 截止前不检查积压的活动预算。
    pub activity_budget: Duration,
    /// 并发工作进程上限；0 表示不限，此时永不视为积压。
    pub max_concurrent: usize,
    /// 两次推进之间的休眠间隔。
    pub tick: Duration,
}

impl Default for WorkerPolicy {
    fn default() -> Self {
        Self {
            activity_budget: Duration::from_secs(60),
            max_concurrent: 0,
            tick: Duration::from_secs(1),
        }
    }
}

/// 队列长度超过并发上限即为积压。
pub fn is_backlogged(queue_len: usize, max_concurrent: usize) -> bool {
    max_concurrent > 0 && queue_len > max_concurrent
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// 扫描仍在进行，条目已移到队尾。
    Requeued,
    /// 扫描结束，条目已移除。
    Removed,
}

pub struct ScanWorker<'a, C: Clock = SystemClock> {
    entry: &'a ScanEntry,
    queue: &'a dyn ScanQueue,
    policy: WorkerPolicy,
    clock: C,
}

impl<'a> ScanWorker<'a, SystemClock> {
    pub fn new(entry: &'a ScanEntry, queue: &'a dyn ScanQueue, policy: WorkerPolicy) -> Self {
        Self::with_clock(entry, queue, policy, SystemClock)
    }
}

impl<'a, C: Clock> ScanWorker<'a, C> {
    pub fn with_clock(
        entry: &'a ScanEntry,
        queue: &'a dyn ScanQueue,
        policy: WorkerPolicy,
        clock: C,
    ) -> Self {
        Self {
            entry,
            queue,
            policy,
            clock,
        }
    }

    pub fn run(&self, progress: &mut dyn ScanProgress) -> Result<WorkerOutcome, WorkerError> {
        let report_id = self.entry.report_id.as_str();
        let deadline = self.clock.now() + self.policy.activity_budget;
        let mut steps: u64 = 0;
        loop {
            progress.advance()?;
            steps += 1;
            if !progress.is_active()? {
                self.queue.remove(report_id)?;
                info!(report_id, steps, "scan finished, entry removed");
                return Ok(WorkerOutcome::Removed);
            }
            if self.clock.now() >= deadline {
                let queue_len = self.queue.len()?;
                if is_backlogged(queue_len, self.policy.max_concurrent) {
                    debug!(
                        report_id,
                        queue_len,
                        max_concurrent = self.policy.max_concurrent,
                        "activity budget spent and queue backlogged"
                    );
                    break;
                }
            }
            self.clock.sleep(self.policy.tick);
        }

        if !self.queue.move_to_tail(report_id)? {
            warn!(report_id, "entry vanished from the queue before requeue");
        }
        info!(report_id, steps, "scan yielded, entry moved to tail");
        Ok(WorkerOutcome::Requeued)
    }
}

/// 工作进程准备扫描所需的进程内资源。
///
/// 实现负责重新打开存储等不能跨 fork 共享的资源，并以条目所有者的身份
/// 构造 [`ScanProgress`]。
pub trait WorkerEnvironment {
    fn prepare(&self, entry: &ScanEntry) -> Result<Box<dyn ScanProgress>, WorkerError>;
}

/// 工作进程主体：准备环境、运行时间片循环，返回进程退出码。
///
/// 移到队尾与移除都以 0 退出；准备或推进失败以 1 退出，条目保留给下一轮调度。
pub fn run_worker_process(
    entry: &ScanEntry,
    queue: &dyn ScanQueue,
    environment: &dyn WorkerEnvironment,
    policy: WorkerPolicy,
) -> i32 {
    let span = tracing::info_span!("scan_worker", report_id = %entry.report_id, pid = std::process::id());
    let _entered = span.enter();
    let outcome = environment
        .prepare(entry)
        .and_then(|mut progress| ScanWorker::new(entry, queue, policy).run(progress.as_mut()));
    match outcome {
        Ok(_) => 0,
        Err(err) => {
            tracing::error!(error = %err, "scan worker failed; entry left queued");
            1
        }
    }
}
