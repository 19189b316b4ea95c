//! 以报告的 `progress` 列模拟扫描推进。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 真正的扫描引擎不在本守护进程内；工作进程只需要一个会“前进并最终结束”的
//!   扫描，用来驱动时间片循环与状态列；
//! - 每步前进的幅度带随机抖动，使并发扫描以不同速度完成。
//!
//! ## 逻辑 (How)
//! 1. 第一次推进把报告的 `scan_run_status` 与任务的 `status` 置为 `Running`；
//! 2. 每次推进把 `progress` 增加 `1..=max_step`，封顶 100；
//! 3. 到达 100 时两处状态都置为 `Done`。
//!
//! ## 契约 (What)
//! - `is_active`：`scan_run_status` 不是 `Done` 即为进行中；报告已被删除视为结束；
//! - 存储错误包装为 [`WorkerError::Progress`]，条目留在队列中。

use gantry_protocol::catalog::STATUS_REQUESTED;
use gantry_protocol::store::{ResourceStore, StoreError};
use gantry_scan::{ScanProgress, WorkerError};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::sync::Arc;
use tracing::debug;

pub const STATUS_RUNNING: &str = "Running";
pub const STATUS_DONE: &str = "Done";
const COMPLETE: u32 = 100;

pub struct ReportProgress {
    store: Arc<dyn ResourceStore>,
    report_id: String,
    task_id: String,
    max_step: u32,
    rng: StdRng,
}

fn progress_failed(err: StoreError) -> WorkerError {
    WorkerError::Progress(Box::new(err))
}

impl ReportProgress {
    /// 定位报告及其任务；报告不存在时返回错误。
    pub fn open(
        store: Arc<dyn ResourceStore>,
        report_id: &str,
        max_step: u32,
    ) -> Result<Self, WorkerError> {
        let task_id = store
            .get_field("report", report_id, "task_id")
            .map_err(progress_failed)?
            .unwrap_or_default();
        Ok(Self {
            store,
            report_id: report_id.to_owned(),
            task_id,
            max_step: max_step.max(1),
            rng: StdRng::from_os_rng(),
        })
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    fn report_field(&self, field: &str) -> Result<Option<String>, StoreError> {
        self.store.get_field("report", &self.report_id, field)
    }

    fn set_status(&self, status: &str) -> Result<(), StoreError> {
        self.store
            .set_field("report", &self.report_id, "scan_run_status", status)?;
        if self.task_id.is_empty() {
            return Ok(());
        }
        match self.store.set_field("task", &self.task_id, "status", status) {
            Err(StoreError::NotFound { .. }) => Ok(()),
            other => other,
        }
    }

    fn step(&mut self) -> Result<u32, StoreError> {
        let status = self.report_field("scan_run_status")?.unwrap_or_default();
        if status == STATUS_REQUESTED {
            self.set_status(STATUS_RUNNING)?;
        }
        let current: u32 = self
            .report_field("progress")?
            .and_then(|text| text.parse().ok())
            .unwrap_or(0);
        let next = current
            .saturating_add(self.rng.random_range(1..=self.max_step))
            .min(COMPLETE);
        self.store
            .set_field("report", &self.report_id, "progress", &next.to_string())?;
        if next >= COMPLETE {
            self.set_status(STATUS_DONE)?;
        }
        Ok(next)
    }
}

impl ScanProgress for ReportProgress {
    fn advance(&mut self) -> Result<(), WorkerError> {
        let progress = self.step().map_err(progress_failed)?;
        debug!(report_id = %self.report_id, progress, "scan advanced");
        Ok(())
    }

    fn is_active(&mut self) -> Result<bool, WorkerError> {
        match self.report_field("scan_run_status") {
            Ok(status) => Ok(status.as_deref() != Some(STATUS_DONE)),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(err) => Err(progress_failed(err)),
        }
    }
}
