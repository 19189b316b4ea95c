//! `scan-worker` 进程主体。
//!
//! 工作进程不继承父进程的任何句柄：目录与队列都按配置路径重新打开，随后以
//! 条目所有者的身份核对对报告的操作权限，再交给时间片循环。

use gantry_protocol::auth::{Authorizer, RoleAuthorizer, UserTable};
use gantry_protocol::store::ResourceStore;
use gantry_scan::{
    FileScanQueue, ScanEntry, ScanProgress, ScanQueue, WorkerEnvironment, WorkerError,
    run_worker_process,
};
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info};

use crate::config::DaemonConfig;
use crate::json_store::JsonStore;
use crate::progress::ReportProgress;

/// 每次推进的最大进度增量。
const MAX_STEP: u32 = 10;

pub struct DaemonWorkerEnvironment {
    catalog_path: PathBuf,
    users: UserTable,
    max_step: u32,
}

impl DaemonWorkerEnvironment {
    pub fn new(config: &DaemonConfig) -> Self {
        Self {
            catalog_path: config.storage.catalog_path.clone(),
            users: config.user_table(),
            max_step: MAX_STEP,
        }
    }

    pub fn with_max_step(mut self, max_step: u32) -> Self {
        self.max_step = max_step;
        self
    }
}

impl WorkerEnvironment for DaemonWorkerEnvironment {
    fn prepare(&self, entry: &ScanEntry) -> Result<Box<dyn ScanProgress>, WorkerError> {
        let identity = |reason: &str| WorkerError::Identity {
            owner: entry.owner.clone(),
            reason: reason.to_owned(),
        };
        let who = self
            .users
            .credentials_of(&entry.owner)
            .ok_or_else(|| identity("unknown user"))?;
        let store: Arc<dyn ResourceStore> = Arc::new(JsonStore::open(&self.catalog_path));
        let permitted = RoleAuthorizer::new(Arc::clone(&store))
            .authorize_resource(&who, "start_task", "report", &entry.report_id)
            .map_err(|err| WorkerError::Progress(Box::new(err)))?;
        if !permitted {
            return Err(identity("not permitted to run this report"));
        }
        let progress = ReportProgress::open(store, &entry.report_id, self.max_step)?;
        Ok(Box::new(progress))
    }
}

/// 运行一个扫描工作进程，返回进程退出码。
///
/// 条目已不在队列中（例如已被其他工作进程完成）时直接以 0 退出。
pub fn run_scan_worker(
    config: &DaemonConfig,
    environment: &dyn WorkerEnvironment,
    report_id: &str,
) -> i32 {
    let queue = FileScanQueue::open(&config.scheduler.queue_path);
    let entry = match queue.snapshot() {
        Ok(entries) => entries.into_iter().find(|entry| entry.report_id == report_id),
        Err(err) => {
            error!(report_id, error = %err, "cannot read scan queue");
            return 1;
        }
    };
    let Some(entry) = entry else {
        info!(report_id, "scan is no longer queued; nothing to do");
        return 0;
    };
    run_worker_process(&entry, &queue, environment, config.scheduler.worker_policy())
}
