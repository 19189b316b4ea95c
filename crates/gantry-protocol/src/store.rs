//! 存储协作方的窄接口。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 协议引擎不关心资源究竟存放在关系库、JSON 文件还是内存里；它只需要
//!   “按查询描述迭代行”“统计行数”“读写列值”这几个动作；
//! - 以 trait 暴露这些动作，守护进程在启动时注入具体实现，测试注入内存实现。
//!
//! ## 契约 (What)
//! - [`ResourceStore::iterate`] 返回已按过滤、id、回收站与排序处理好的行，
//!   **不做分页**：跳过 `first` 之前的行由列表子协议负责；
//! - 迭代器关闭即 drop；
//! - 所有失败以 [`StoreError`] 返回，由命令层映射为协议状态码。

use crate::query::QueryDescriptor;
use std::error::Error;
use thiserror::Error;

/// 一行资源的只读视图。
pub trait ResourceRow: Send + Sync {
    fn id(&self) -> &str;

    /// 按列名取值；未知列返回 `None`。
    fn field(&self, name: &str) -> Option<String>;
}

/// 只能前进的行迭代器。
pub trait ResourceIterator: Send {
    fn next_row(&mut self) -> Result<Option<Box<dyn ResourceRow>>, StoreError>;
}

/// 资源在存储中的定位：外部 id 与内部行号。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowRef {
    pub id: String,
    pub row: i64,
}

pub trait ResourceStore: Send + Sync {
    fn iterate(&self, query: &QueryDescriptor) -> Result<Box<dyn ResourceIterator>, StoreError>;

    fn count(&self, query: &QueryDescriptor) -> Result<u64, StoreError>;

    /// 按 id 定位一行（回收站内的行不可见）。
    fn find(&self, resource_type: &str, id: &str) -> Result<Option<RowRef>, StoreError>;

    fn get_field(
        &self,
        resource_type: &str,
        id: &str,
        field: &str,
    ) -> Result<Option<String>, StoreError>;

    fn set_field(
        &self,
        resource_type: &str,
        id: &str,
        field: &str,
        value: &str,
    ) -> Result<(), StoreError>;

    /// 已保存过滤器的过滤文本；过滤器不存在时返回 `None`。
    fn saved_filter(&self, filter_id: &str) -> Result<Option<String>, StoreError>;

    /// 为任务创建一份新报告，并把任务标记为已请求。
    ///
    /// 状态检查与写入在同一次加锁内完成：任务已处于活动状态时返回
    /// [`StoreError::Conflict`]，两个并发请求至多一个成功。
    fn create_report(&self, task: &RowRef, owner: &str) -> Result<CreatedReport, StoreError>;

    /// 撤回一次 `create_report`：删除报告，恢复任务原先的状态。
    fn withdraw_report(&self, task: &RowRef, created: &CreatedReport) -> Result<(), StoreError>;
}

/// `create_report` 的结果：新报告与任务原先的状态。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedReport {
    pub report: RowRef,
    pub previous_status: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("gantry.store.not_found: {resource_type} '{id}'")]
    NotFound { resource_type: String, id: String },
    #[error("gantry.store.permission_denied")]
    PermissionDenied,
    /// 资源当前状态不允许该修改；文本直接作为响应的 `status_text`。
    #[error("gantry.store.conflict: {0}")]
    Conflict(String),
    #[error("gantry.store.internal: {0}")]
    Internal(#[source] Box<dyn Error + Send + Sync>),
}

impl StoreError {
    pub fn internal(error: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::Internal(error.into())
    }

    pub fn not_found(resource_type: &str, id: &str) -> Self {
        Self::NotFound {
            resource_type: resource_type.to_owned(),
            id: id.to_owned(),
        }
    }
}
