//! 命令处理器的对象层契约与注册表。

use crate::auth::{Authenticator, Authorizer, Credentials};
use crate::entity::Entity;
use crate::response::CommandError;
use crate::store::ResourceStore;
use crate::xml::Attributes;
use async_trait::async_trait;
use gantry_scan::ScanQueue;
use gantry_transport::{IoBuffer, OutboundSink, TransportError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 协议版本，由 `get_version` 返回。
pub const PROTOCOL_VERSION: &str = "1.0";

/// 命令如何接收参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyMode {
    /// 只看开始标签的属性；子元素被跳过。
    Attributes,
    /// 需要完整的实体树（由命令上下文累积）。
    Nested,
}

/// 命令执行失败：命令级错误只结束当前命令，传输错误结束整个会话。
#[derive(Debug)]
pub enum CommandFailure {
    Command(CommandError),
    Transport(TransportError),
}

impl From<CommandError> for CommandFailure {
    fn from(err: CommandError) -> Self {
        Self::Command(err)
    }
}

impl From<TransportError> for CommandFailure {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<crate::store::StoreError> for CommandFailure {
    fn from(err: crate::store::StoreError) -> Self {
        Self::Command(err.into())
    }
}

/// 响应输出端：向出站缓冲追加文本，写不下时先同步排空。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 响应大小不受出站缓冲容量限制：列表命令可能输出远大于缓冲的内容；
/// - 因此在追加前若空间不够，先把已有内容全部写给对端，再继续追加剩余部分。
///
/// ## 契约 (What)
/// - `emit` 返回后，`text` 的全部字节要么已在出站缓冲中，要么已写出；
/// - 排空失败以 [`TransportError`] 返回，当前命令随即中止，会话结束。
pub struct Responder<'a> {
    outbound: &'a mut IoBuffer,
    sink: &'a mut dyn OutboundSink,
}

impl<'a> Responder<'a> {
    pub fn new(outbound: &'a mut IoBuffer, sink: &'a mut dyn OutboundSink) -> Self {
        Self { outbound, sink }
    }

    pub async fn emit(&mut self, text: &str) -> Result<(), TransportError> {
        let mut rest = text.as_bytes();
        while !rest.is_empty() {
            let written = self.outbound.append(rest);
            rest = &rest[written..];
            if !rest.is_empty() {
                self.sink.drain(self.outbound).await?;
            }
        }
        Ok(())
    }
}

/// 会话级状态：目前只有认证身份。
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    pub credentials: Option<Credentials>,
}

impl SessionState {
    /// 当前身份；未认证时返回 401 错误。
    pub fn who(&self) -> Result<&Credentials, CommandError> {
        self.credentials
            .as_ref()
            .ok_or_else(CommandError::auth_required)
    }
}

#[derive(Clone, Debug)]
pub struct ProtocolSettings {
    /// 请求未指定每页行数时的默认值。
    pub default_rows: i64,
    pub version: String,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            default_rows: 10,
            version: PROTOCOL_VERSION.to_owned(),
        }
    }
}

/// 命令可以使用的外部协作方。
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn ResourceStore>,
    pub authenticator: Arc<dyn Authenticator>,
    pub authorizer: Arc<dyn Authorizer>,
    pub scan_queue: Arc<dyn ScanQueue>,
    pub settings: ProtocolSettings,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// 命令执行期间可见的上下文。
pub struct CommandCx<'a> {
    pub responder: Responder<'a>,
    pub session: &'a mut SessionState,
    pub services: &'a Services,
    pub registry: &'a CommandRegistry,
}

impl CommandCx<'_> {
    pub async fn emit(&mut self, text: &str) -> Result<(), TransportError> {
        self.responder.emit(text).await
    }
}

/// 单个命令的处理器。
///
/// # 教案式注释
///
/// ## 逻辑 (How)
/// - 开始标签到达时调用 [`CommandHandler::on_attributes`]，只做校验，不输出；
///   校验失败的命令跳过其子元素，在结束标签处输出错误响应；
/// - 结束标签到达（或命令体累积完成）时调用 [`CommandHandler::on_body_complete`]，
///   处理器通过 [`CommandCx::emit`] 输出响应。
///
/// ## 契约 (What)
/// - 处理器在输出任何内容之前完成全部校验，保证错误响应不会跟在半截成功响应后面；
/// - 属性模式的命令收到的实体只有根节点。
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn body_mode(&self) -> BodyMode {
        BodyMode::Attributes
    }

    /// 未认证的会话能否执行。
    fn requires_auth(&self) -> bool {
        true
    }

    fn on_attributes(
        &self,
        _attributes: &Attributes,
        _session: &SessionState,
        _services: &Services,
    ) -> Result<(), CommandError> {
        Ok(())
    }

    async fn on_body_complete(
        &self,
        command: Entity,
        cx: &mut CommandCx<'_>,
    ) -> Result<(), CommandFailure>;
}

/// 命令名到处理器的映射。
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器；同名处理器被替换。
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    /// 按字母序排列的命令名。
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Collect(Vec<u8>);

    #[async_trait]
    impl OutboundSink for Collect {
        async fn drain(&mut self, buf: &mut IoBuffer) -> Result<(), TransportError> {
            self.0.extend_from_slice(buf.readable());
            buf.reset();
            Ok(())
        }
    }

    #[tokio::test]
    async fn emit_drains_before_overflowing() {
        let mut outbound = IoBuffer::with_capacity(4);
        let mut sink = Collect(Vec::new());
        let mut responder = Responder::new(&mut outbound, &mut sink);
        responder.emit("<a>hello</a>").await.unwrap();
        drop(responder);

        assert_eq!(outbound.len(), 4);
        let mut all = sink.0.clone();
        all.extend_from_slice(outbound.readable());
        assert_eq!(all, b"<a>hello</a>");
    }
}
