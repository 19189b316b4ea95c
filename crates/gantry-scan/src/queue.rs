use crate::{entry::ScanEntry, error::QueueError, persist::LockedDocument};
use parking_lot::Mutex;
use std::path::PathBuf;
use tracing::debug;

/// 有序的扫描队列。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 队列是守护进程与扫描工作进程之间唯一共享的可变状态：协议处理器入队，
///   调度器按序派发，工作进程在时间片结束时把自己移到队尾或移除；
/// - 同一队列上的所有操作都经由同一把锁串行化；跨进程实现使用 `flock`。
///
/// ## 契约 (What)
/// - `enqueue`：追加到队尾；同一 `report_id` 重复入队返回 [`QueueError::AlreadyQueued`]；
/// - `move_to_tail`：把条目移到队尾并清除 `handler_pid`；队列只有一项时该项仍是唯一条目；
/// - `remove`：删除条目；
/// - `move_to_tail` / `remove` 对不存在的条目是幂等的空操作，返回 `false`；
/// - `len` / `snapshot`：当前长度 / 有序副本；
/// - `assign_handler`：记录负责该条目的工作进程。
pub trait ScanQueue: Send + Sync {
    fn enqueue(&self, entry: ScanEntry) -> Result<(), QueueError>;
    fn move_to_tail(&self, report_id: &str) -> Result<bool, QueueError>;
    fn remove(&self, report_id: &str) -> Result<bool, QueueError>;
    fn len(&self) -> Result<usize, QueueError>;
    fn snapshot(&self) -> Result<Vec<ScanEntry>, QueueError>;
    fn assign_handler(&self, report_id: &str, pid: i32) -> Result<bool, QueueError>;

    fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }
}

fn position(entries: &[ScanEntry], report_id: &str) -> Option<usize> {
    entries.iter().position(|entry| entry.report_id == report_id)
}

fn push(entries: &mut Vec<ScanEntry>, entry: ScanEntry) -> Result<(), QueueError> {
    if position(entries, &entry.report_id).is_some() {
        return Err(QueueError::AlreadyQueued(entry.report_id));
    }
    debug!(report_id = %entry.report_id, owner = %entry.owner, "scan queued");
    entries.push(entry);
    Ok(())
}

fn rotate(entries: &mut Vec<ScanEntry>, report_id: &str) -> bool {
    let Some(index) = position(entries, report_id) else {
        return false;
    };
    let mut entry = entries.remove(index);
    entry.handler_pid = None;
    entries.push(entry);
    true
}

fn drop_entry(entries: &mut Vec<ScanEntry>, report_id: &str) -> bool {
    match position(entries, report_id) {
        Some(index) => {
            entries.remove(index);
            true
        }
        None => false,
    }
}

fn assign(entries: &mut [ScanEntry], report_id: &str, pid: i32) -> bool {
    match entries.iter_mut().find(|entry| entry.report_id == report_id) {
        Some(entry) => {
            entry.handler_pid = Some(pid);
            true
        }
        None => false,
    }
}

/// 单进程内存队列，由 `parking_lot::Mutex` 串行化。
#[derive(Debug, Default)]
pub struct MemoryScanQueue {
    entries: Mutex<Vec<ScanEntry>>,
}

impl MemoryScanQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScanQueue for MemoryScanQueue {
    fn enqueue(&self, entry: ScanEntry) -> Result<(), QueueError> {
        push(&mut self.entries.lock(), entry)
    }

    fn move_to_tail(&self, report_id: &str) -> Result<bool, QueueError> {
        Ok(rotate(&mut self.entries.lock(), report_id))
    }

    fn remove(&self, report_id: &str) -> Result<bool, QueueError> {
        Ok(drop_entry(&mut self.entries.lock(), report_id))
    }

    fn len(&self) -> Result<usize, QueueError> {
        Ok(self.entries.lock().len())
    }

    fn snapshot(&self) -> Result<Vec<ScanEntry>, QueueError> {
        Ok(self.entries.lock().clone())
    }

    fn assign_handler(&self, report_id: &str, pid: i32) -> Result<bool, QueueError> {
        Ok(assign(&mut self.entries.lock(), report_id, pid))
    }
}

/// 文件队列：守护进程与工作进程通过同一个 `flock` 串行化访问。
#[derive(Debug, Clone)]
pub struct FileScanQueue {
    document: LockedDocument<Vec<ScanEntry>>,
}

impl FileScanQueue {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            document: LockedDocument::new(path),
        }
    }
}

impl ScanQueue for FileScanQueue {
    fn enqueue(&self, entry: ScanEntry) -> Result<(), QueueError> {
        self.document.update(|entries| push(entries, entry))?
    }

    fn move_to_tail(&self, report_id: &str) -> Result<bool, QueueError> {
        Ok(self.document.update(|entries| rotate(entries, report_id))?)
    }

    fn remove(&self, report_id: &str) -> Result<bool, QueueError> {
        Ok(self.document.update(|entries| drop_entry(entries, report_id))?)
    }

    fn len(&self) -> Result<usize, QueueError> {
        Ok(self.document.read()?.len())
    }

    fn snapshot(&self) -> Result<Vec<ScanEntry>, QueueError> {
        Ok(self.document.read()?)
    }

    fn assign_handler(&self, report_id: &str, pid: i32) -> Result<bool, QueueError> {
        Ok(self.document.update(|entries| assign(entries, report_id, pid))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> ScanEntry {
        ScanEntry::new(id, 1, 2, "owner-1")
    }

    fn ids(queue: &dyn ScanQueue) -> Vec<String> {
        queue
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|entry| entry.report_id)
            .collect()
    }

    fn exercise(queue: &dyn ScanQueue) {
        queue.enqueue(entry("a")).unwrap();
        queue.enqueue(entry("b")).unwrap();
        queue.enqueue(entry("c")).unwrap();
        assert_eq!(queue.len().unwrap(), 3);

        assert!(queue.assign_handler("a", 4242).unwrap());
        assert!(queue.move_to_tail("a").unwrap());
        assert_eq!(ids(queue), ["b", "c", "a"]);
        assert_eq!(queue.snapshot().unwrap()[2].handler_pid, None);

        assert!(queue.remove("c").unwrap());
        assert!(!queue.remove("c").unwrap());
        assert!(!queue.move_to_tail("missing").unwrap());
        assert_eq!(ids(queue), ["b", "a"]);

        assert!(matches!(
            queue.enqueue(entry("b")),
            Err(QueueError::AlreadyQueued(id)) if id == "b"
        ));
    }

    #[test]
    fn memory_queue_keeps_order() {
        exercise(&MemoryScanQueue::new());
    }

    #[test]
    fn file_queue_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileScanQueue::open(dir.path().join("scan-queue.json")));
    }

    #[test]
    fn move_to_tail_on_single_entry_keeps_it_sole() {
        let queue = MemoryScanQueue::new();
        queue.enqueue(entry("only")).unwrap();
        assert!(queue.move_to_tail("only").unwrap());
        assert_eq!(queue.len().unwrap(), 1);
        assert_eq!(ids(&queue), ["only"]);
    }

    #[test]
    fn file_queue_is_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan-queue.json");
        let daemon = FileScanQueue::open(&path);
        let worker = FileScanQueue::open(&path);

        daemon.enqueue(entry("r1")).unwrap();
        daemon.enqueue(entry("r2")).unwrap();
        assert!(worker.move_to_tail("r1").unwrap());
        assert_eq!(ids(&daemon), ["r2", "r1"]);
        assert!(worker.remove("r2").unwrap());
        assert_eq!(daemon.len().unwrap(), 1);
    }
}
