//! 资源目录的参考实现。
//!
//! [`Catalog`] 是一份可序列化的资源表集合：守护进程把它保存在受文件锁保护的
//! JSON 文档里，测试直接放在内存中（[`MemoryStore`]）。两种用法共享这里的
//! 查询、排序与计数逻辑。

use crate::query::QueryDescriptor;
use crate::store::{
    CreatedReport, ResourceIterator, ResourceRow, ResourceStore, RowRef, StoreError,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// 报告刚创建时的扫描状态。
pub const STATUS_REQUESTED: &str = "Requested";

/// 任务处于这些状态时不允许再次启动。
pub const ACTIVE_TASK_STATUSES: &[&str] = &[STATUS_REQUESTED, "Queued", "Running"];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRow {
    pub id: String,
    pub row: i64,
    pub owner: String,
    #[serde(default)]
    pub trash: bool,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl ResourceRow for StoredRow {
    fn id(&self) -> &str {
        &self.id
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "owner" => Some(self.owner.clone()),
            "trash" => Some(if self.trash { "1" } else { "0" }.to_owned()),
            _ => self.fields.get(name).cloned(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    next_row: i64,
    #[serde(default)]
    resources: BTreeMap<String, Vec<StoredRow>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以随机 UUID 插入一行。
    pub fn insert<K, V>(
        &mut self,
        resource_type: &str,
        owner: &str,
        fields: impl IntoIterator<Item = (K, V)>,
    ) -> RowRef
    where
        K: Into<String>,
        V: Into<String>,
    {
        let id = Uuid::new_v4().to_string();
        self.insert_with_id(resource_type, &id, owner, fields)
    }

    pub fn insert_with_id<K, V>(
        &mut self,
        resource_type: &str,
        id: &str,
        owner: &str,
        fields: impl IntoIterator<Item = (K, V)>,
    ) -> RowRef
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.next_row += 1;
        let row = StoredRow {
            id: id.to_owned(),
            row: self.next_row,
            owner: owner.to_owned(),
            trash: false,
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        };
        self.resources
            .entry(resource_type.to_owned())
            .or_default()
            .push(row);
        RowRef {
            id: id.to_owned(),
            row: self.next_row,
        }
    }

    /// 把一行移入回收站；行不存在时返回 `false`。
    pub fn trash(&mut self, resource_type: &str, id: &str) -> bool {
        match self.row_mut(resource_type, id) {
            Some(row) => {
                row.trash = true;
                true
            }
            None => false,
        }
    }

    /// 满足查询的全部行，按查询排序；排序值相同按行号。
    pub fn select(&self, query: &QueryDescriptor) -> Vec<StoredRow> {
        let mut rows: Vec<StoredRow> = self
            .rows(&query.resource_type)
            .iter()
            .filter(|row| query.matches(*row, row.trash))
            .cloned()
            .collect();
        rows.sort_by(|a, b| query.sort.compare(a, b).then(a.row.cmp(&b.row)));
        rows
    }

    pub fn count(&self, query: &QueryDescriptor) -> u64 {
        self.rows(&query.resource_type)
            .iter()
            .filter(|row| query.matches(*row, row.trash))
            .count() as u64
    }

    pub fn find(&self, resource_type: &str, id: &str) -> Option<RowRef> {
        self.live_row(resource_type, id).map(|row| RowRef {
            id: row.id.clone(),
            row: row.row,
        })
    }

    pub fn get_field(
        &self,
        resource_type: &str,
        id: &str,
        field: &str,
    ) -> Result<Option<String>, StoreError> {
        self.live_row(resource_type, id)
            .map(|row| row.field(field))
            .ok_or_else(|| StoreError::not_found(resource_type, id))
    }

    pub fn set_field(
        &mut self,
        resource_type: &str,
        id: &str,
        field: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let row = self
            .row_mut(resource_type, id)
            .filter(|row| !row.trash)
            .ok_or_else(|| StoreError::not_found(resource_type, id))?;
        row.fields.insert(field.to_owned(), value.to_owned());
        Ok(())
    }

    pub fn saved_filter(&self, filter_id: &str) -> Option<String> {
        self.live_row("filter", filter_id)
            .map(|row| row.fields.get("term").cloned().unwrap_or_default())
    }

    pub fn create_report(
        &mut self,
        task: &RowRef,
        owner: &str,
    ) -> Result<CreatedReport, StoreError> {
        let previous_status = self.get_field("task", &task.id, "status")?;
        if previous_status
            .as_deref()
            .is_some_and(|status| ACTIVE_TASK_STATUSES.contains(&status))
        {
            return Err(StoreError::Conflict("Task is active already".to_owned()));
        }
        let task_name = self
            .get_field("task", &task.id, "name")?
            .unwrap_or_default();
        self.set_field("task", &task.id, "status", STATUS_REQUESTED)?;
        let report = self.insert(
            "report",
            owner,
            [
                ("name", task_name),
                ("task_id", task.id.clone()),
                ("scan_run_status", STATUS_REQUESTED.to_owned()),
                ("progress", "0".to_owned()),
            ],
        );
        Ok(CreatedReport {
            report,
            previous_status,
        })
    }

    /// 删除报告行并恢复任务状态；报告已不存在时只恢复状态。
    pub fn withdraw_report(
        &mut self,
        task: &RowRef,
        created: &CreatedReport,
    ) -> Result<(), StoreError> {
        if let Some(reports) = self.resources.get_mut("report") {
            reports.retain(|row| row.id != created.report.id);
        }
        let row = self
            .row_mut("task", &task.id)
            .ok_or_else(|| StoreError::not_found("task", &task.id))?;
        match &created.previous_status {
            Some(status) => row.fields.insert("status".to_owned(), status.clone()),
            None => row.fields.remove("status"),
        };
        Ok(())
    }

    fn rows(&self, resource_type: &str) -> &[StoredRow] {
        self.resources
            .get(resource_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn live_row(&self, resource_type: &str, id: &str) -> Option<&StoredRow> {
        self.rows(resource_type)
            .iter()
            .find(|row| row.id == id && !row.trash)
    }

    fn row_mut(&mut self, resource_type: &str, id: &str) -> Option<&mut StoredRow> {
        self.resources
            .get_mut(resource_type)?
            .iter_mut()
            .find(|row| row.id == id)
    }
}

/// 预先物化的行迭代器。
pub struct RowsIter(std::vec::IntoIter<StoredRow>);

impl RowsIter {
    pub fn new(rows: Vec<StoredRow>) -> Self {
        Self(rows.into_iter())
    }
}

impl ResourceIterator for RowsIter {
    fn next_row(&mut self) -> Result<Option<Box<dyn ResourceRow>>, StoreError> {
        Ok(self
            .0
            .next()
            .map(|row| Box::new(row) as Box<dyn ResourceRow>))
    }
}

/// 进程内的目录存储。
#[derive(Debug, Default)]
pub struct MemoryStore {
    catalog: RwLock<Catalog>,
}

impl MemoryStore {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog: RwLock::new(catalog),
        }
    }

    pub fn update<R>(&self, apply: impl FnOnce(&mut Catalog) -> R) -> R {
        apply(&mut self.catalog.write())
    }

    pub fn snapshot(&self) -> Catalog {
        self.catalog.read().clone()
    }
}

impl ResourceStore for MemoryStore {
    fn iterate(&self, query: &QueryDescriptor) -> Result<Box<dyn ResourceIterator>, StoreError> {
        Ok(Box::new(RowsIter::new(self.catalog.read().select(query))))
    }

    fn count(&self, query: &QueryDescriptor) -> Result<u64, StoreError> {
        Ok(self.catalog.read().count(query))
    }

    fn find(&self, resource_type: &str, id: &str) -> Result<Option<RowRef>, StoreError> {
        Ok(self.catalog.read().find(resource_type, id))
    }

    fn get_field(
        &self,
        resource_type: &str,
        id: &str,
        field: &str,
    ) -> Result<Option<String>, StoreError> {
        self.catalog.read().get_field(resource_type, id, field)
    }

    fn set_field(
        &self,
        resource_type: &str,
        id: &str,
        field: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        self.catalog
            .write()
            .set_field(resource_type, id, field, value)
    }

    fn saved_filter(&self, filter_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.catalog.read().saved_filter(filter_id))
    }

    fn create_report(&self, task: &RowRef, owner: &str) -> Result<CreatedReport, StoreError> {
        self.catalog.write().create_report(task, owner)
    }

    fn withdraw_report(&self, task: &RowRef, created: &CreatedReport) -> Result<(), StoreError> {
        self.catalog.write().withdraw_report(task, created)
    }
}
