//! 内置命令集。

mod authenticate;
mod get;
mod modify;
mod start_task;
mod version;

pub use authenticate::Authenticate;
pub use get::GetResources;
pub use modify::ModifyResource;
pub use start_task::StartTask;
pub use version::{GetVersion, Help};

use crate::command::CommandRegistry;
use crate::resources::KINDS;
use std::sync::Arc;

/// 注册全部内置命令：版本、帮助、认证、每种资源的列表与修改、启动任务。
pub fn standard_registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.register("get_version", Arc::new(GetVersion));
    registry.register("help", Arc::new(Help));
    registry.register("authenticate", Arc::new(Authenticate));
    registry.register("start_task", Arc::new(StartTask));
    for kind in KINDS {
        registry.register(kind.list_command(), Arc::new(GetResources::new(kind)));
        if let Some(name) = kind.modify_command() {
            registry.register(name, Arc::new(ModifyResource::new(kind)));
        }
    }
    registry
}
