//! 以加锁 JSON 文档保存的资源目录。
//!
//! 守护进程与扫描工作进程各自打开同一份目录文件；每次访问都在 `flock` 下
//! 读取（或读取、修改、写回）整份 [`Catalog`]，因此两边看到的始终是一致的快照。

use gantry_protocol::catalog::{Catalog, RowsIter};
use gantry_protocol::query::QueryDescriptor;
use gantry_protocol::store::{
    CreatedReport, ResourceIterator, ResourceStore, RowRef, StoreError,
};
use gantry_scan::{LockedDocument, PersistError};
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct JsonStore {
    document: LockedDocument<Catalog>,
}

impl JsonStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            document: LockedDocument::new(path),
        }
    }

    /// 在排他锁下修改目录，供初始化与工作进程使用。
    pub fn update<R>(&self, apply: impl FnOnce(&mut Catalog) -> R) -> Result<R, StoreError> {
        self.document.update(apply).map_err(persist_failed)
    }

    pub fn snapshot(&self) -> Result<Catalog, StoreError> {
        self.document.read().map_err(persist_failed)
    }
}

fn persist_failed(err: PersistError) -> StoreError {
    StoreError::internal(err)
}

impl ResourceStore for JsonStore {
    fn iterate(&self, query: &QueryDescriptor) -> Result<Box<dyn ResourceIterator>, StoreError> {
        let rows = self.snapshot()?.select(query);
        Ok(Box::new(RowsIter::new(rows)))
    }

    fn count(&self, query: &QueryDescriptor) -> Result<u64, StoreError> {
        Ok(self.snapshot()?.count(query))
    }

    fn find(&self, resource_type: &str, id: &str) -> Result<Option<RowRef>, StoreError> {
        Ok(self.snapshot()?.find(resource_type, id))
    }

    fn get_field(
        &self,
        resource_type: &str,
        id: &str,
        field: &str,
    ) -> Result<Option<String>, StoreError> {
        self.snapshot()?.get_field(resource_type, id, field)
    }

    fn set_field(
        &self,
        resource_type: &str,
        id: &str,
        field: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        self.update(|catalog| catalog.set_field(resource_type, id, field, value))?
    }

    fn saved_filter(&self, filter_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.snapshot()?.saved_filter(filter_id))
    }

    fn create_report(&self, task: &RowRef, owner: &str) -> Result<CreatedReport, StoreError> {
        self.update(|catalog| catalog.create_report(task, owner))?
    }

    fn withdraw_report(&self, task: &RowRef, created: &CreatedReport) -> Result<(), StoreError> {
        self.update(|catalog| catalog.withdraw_report(task, created))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_visible_through_a_second_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let daemon = JsonStore::open(&path);
        let task = daemon
            .update(|catalog| catalog.insert("task", "alice", [("name", "weekly")]))
            .unwrap();

        let worker = JsonStore::open(&path);
        let report = worker.create_report(&task, "alice").unwrap().report;
        assert_eq!(
            daemon.get_field("report", &report.id, "task_id").unwrap(),
            Some(task.id.clone())
        );
        assert_eq!(
            daemon.get_field("task", &task.id, "status").unwrap().as_deref(),
            Some("Requested")
        );
        assert_eq!(daemon.count(&QueryDescriptor::all("report")).unwrap(), 1);
    }

    #[test]
    fn missing_rows_and_corrupt_documents_map_to_store_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let store = JsonStore::open(&path);
        assert!(matches!(
            store.set_field("alert", "nope", "name", "x"),
            Err(StoreError::NotFound { .. })
        ));

        std::fs::write(&path, b"[1, 2").unwrap();
        let err = store.count(&QueryDescriptor::all("alert")).unwrap_err();
        assert!(matches!(err, StoreError::Internal(_)));
        assert!(err.to_string().contains("gantry.scan.persist_corrupt"));
    }
}
