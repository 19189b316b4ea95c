#![doc = r#"
# gantry-scan

## 设计目标（Why）
- 长时间运行的扫描不在连接任务里执行，而是交给独立的操作系统进程；
- 并发工作进程数有上限，每个工作进程按活动预算协作式让出名额，
  保证队列中每个扫描都能轮到。

## 核心契约（What）
- [`ScanQueue`]：有序队列，`enqueue` / `move_to_tail` / `remove` / `len`，
  单锁串行化；[`FileScanQueue`] 借 `flock` 在进程间共享；
- [`ScanWorker`]：工作进程内的时间片循环，终结动作恰好一次；
- [`WorkerLauncher`]：两次 fork（[`ForkLauncher`]）或重新执行自身（[`ExecLauncher`]）；
- [`ScanScheduler`]：周期调度，跳过仍有存活工作进程的条目。
"#]

mod entry;
pub mod error;
mod launcher;
pub mod persist;
mod queue;
mod scheduler;
mod worker;

pub use entry::ScanEntry;
pub use error::{LaunchError, PersistError, QueueError, SchedulingError, WorkerError};
pub use launcher::{ExecLauncher, ForkLauncher, WorkerLauncher, spawn_detached};
pub use persist::LockedDocument;
pub use queue::{FileScanQueue, MemoryScanQueue, ScanQueue};
pub use scheduler::{PassReport, ProcessProbe, ScanScheduler, SignalProbe};
pub use worker::{
    Clock, ScanProgress, ScanWorker, SystemClock, WorkerEnvironment, WorkerOutcome, WorkerPolicy,
    is_backlogged, run_worker_process,
};
