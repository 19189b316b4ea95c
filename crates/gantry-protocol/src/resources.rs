//! 已注册的资源类型表。

/// 一种可列举的资源。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceKind {
    /// 单数名，同时是行元素名与 `*_id` 属性前缀。
    pub name: &'static str,
    pub plural: &'static str,
    /// 列表响应里每行输出的列（`owner` 另行追加）。
    pub columns: &'static [&'static str],
    /// 可通过 `modify_<name>` 修改的列；为空表示不注册修改命令。
    pub writable: &'static [&'static str],
}

impl ResourceKind {
    pub fn list_command(&self) -> String {
        format!("get_{}", self.plural)
    }

    pub fn modify_command(&self) -> Option<String> {
        (!self.writable.is_empty()).then(|| format!("modify_{}", self.name))
    }

    /// 请求里携带该资源 id 的属性名。
    pub fn id_attribute(&self) -> String {
        format!("{}_id", self.name)
    }
}

pub const KINDS: &[ResourceKind] = &[
    ResourceKind {
        name: "alert",
        plural: "alerts",
        columns: &["name", "comment", "condition", "event", "method"],
        writable: &["name", "comment", "condition", "event", "method"],
    },
    ResourceKind {
        name: "credential",
        plural: "credentials",
        columns: &["name", "comment", "login", "type"],
        writable: &["name", "comment", "login"],
    },
    ResourceKind {
        name: "filter",
        plural: "filters",
        columns: &["name", "comment", "type", "term"],
        writable: &["name", "comment", "type", "term"],
    },
    ResourceKind {
        name: "port_list",
        plural: "port_lists",
        columns: &["name", "comment", "port_count"],
        writable: &["name", "comment"],
    },
    ResourceKind {
        name: "report",
        plural: "reports",
        columns: &["name", "task_id", "scan_run_status", "progress"],
        writable: &[],
    },
    ResourceKind {
        name: "scanner",
        plural: "scanners",
        columns: &["name", "comment", "host", "port", "type"],
        writable: &["name", "comment", "host", "port"],
    },
    ResourceKind {
        name: "schedule",
        plural: "schedules",
        columns: &["name", "comment", "first_time", "period"],
        writable: &["name", "comment", "first_time", "period"],
    },
    ResourceKind {
        name: "target",
        plural: "targets",
        columns: &["name", "comment", "hosts", "port_list_id"],
        writable: &["name", "comment", "hosts", "port_list_id"],
    },
    ResourceKind {
        name: "task",
        plural: "tasks",
        columns: &["name", "comment", "status", "target_id", "scanner_id"],
        writable: &["name", "comment", "target_id", "scanner_id"],
    },
];

pub fn kind(name: &str) -> Option<&'static ResourceKind> {
    KINDS.iter().find(|kind| kind.name == name)
}
