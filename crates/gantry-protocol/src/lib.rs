#![doc = r#"
# gantry-protocol

## 设计目标（Why）
- 管理协议的命令以 XML 片段到达，没有长度前缀；一次读取可能停在任意字节上。
  本 crate 把这样的字节流变成按序执行的命令，并把响应写回出站缓冲；
- 存储、认证与授权只通过窄接口使用，守护进程与测试各自注入实现。

## 核心契约（What）
- [`ProtocolEngine::process`]：消费入站缓冲中所有完整记号，命令按结束标签被识别
  的顺序执行；结果与输入如何切分无关；
- [`CommandHandler`]：`on_attributes`（开始标签处校验）与 `on_body_complete`（执行）；
- [`list_resources`]：通用列表子协议，负责分页、计数与错误映射；
- [`Session`]：单条连接的读、处理、排空循环。

## 实现策略（How）
- [`Tokenizer`](xml::Tokenizer) 只在看到完整记号时产出事件，其余字节留在缓冲；
- 需要命令体的命令由 [`CommandContext`] 累积实体树，跨越任意多次读取；
- 响应通过 [`Responder`] 追加，缓冲写满时先同步排空。
"#]

pub mod auth;
pub mod catalog;
mod command;
pub mod commands;
mod engine;
mod entity;
mod list;
pub mod query;
pub mod resources;
mod response;
mod session;
pub mod store;
pub mod xml;

pub use command::{
    BodyMode, CommandCx, CommandFailure, CommandHandler, CommandRegistry, PROTOCOL_VERSION,
    ProtocolSettings, Responder, Services, SessionState,
};
pub use commands::standard_registry;
pub use engine::{EngineError, ProtocolEngine};
pub use entity::{CommandContext, Entity};
pub use list::{PageSummary, build_query, list_resources};
pub use response::CommandError;
pub use session::{Session, SessionEnd};
