use serde::{Deserialize, Serialize};

/// 扫描队列中的一项：一次已请求、尚未结束的扫描。
///
/// - `report_id`：报告的 UUID，也是队列内的唯一键；
/// - `report_row` / `task_row`：存储层行号，工作进程据此重新定位资源；
/// - `owner`：发起扫描的用户标识，工作进程会以该身份访问存储；
/// - `handler_pid`：当前负责该项的工作进程，`None` 表示等待调度。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEntry {
    pub report_id: String,
    pub report_row: i64,
    pub task_row: i64,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_pid: Option<i32>,
}

impl ScanEntry {
    pub fn new(
        report_id: impl Into<String>,
        report_row: i64,
        task_row: i64,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            report_id: report_id.into(),
            report_row,
            task_row,
            owner: owner.into(),
            handler_pid: None,
        }
    }
}
