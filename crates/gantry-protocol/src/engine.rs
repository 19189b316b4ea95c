//! 协议引擎：把入站字节流变成按序执行的命令。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 命令以没有长度前缀的 XML 片段到达，元素嵌套本身界定命令边界；
//! - 一次读取可能只带来半个标签，也可能带来好几条命令，引擎必须在任意切分下
//!   给出相同的执行序列与输出。
//!
//! ## 逻辑 (How)
//! - 分词器从入站缓冲的待消费区间取出完整记号，消耗的字节随即 `consume`；
//! - 状态机：
//!   - `Idle`：顶层开始元素在注册表中查找处理器并做认证、授权与属性校验；
//!   - `AwaitingClose`：属性模式命令等待自己的结束标签，期间子元素被跳过；
//!   - `Accumulating`：命令上下文累积实体树，完成时执行处理器并丢弃上下文；
//!   - `Rejected`：开始标签处已被拒绝的命令，跳过子元素，在结束标签处输出错误；
//! - 顶层 `<commands>` 包装元素输出 `<commands_response>`，其子元素按顶层命令分派。
//!
//! ## 契约 (What)
//! - 命令严格按结束标签被识别的顺序执行，每条命令恰好执行一次；
//! - 命令级错误输出格式良好的错误响应后回到 `Idle`；
//! - 帧错误与传输错误以 [`EngineError`] 返回，会话随之结束；
//! - 单个记号超过入站缓冲容量时返回 [`EngineError::InputTooLarge`]。

use crate::command::{
    BodyMode, CommandCx, CommandFailure, CommandHandler, CommandRegistry, Responder, Services,
    SessionState,
};
use crate::entity::{CommandContext, Entity};
use crate::response::{CommandError, PROTOCOL_COMMAND};
use crate::xml::{Attributes, Tokenizer, XmlError, XmlEvent};
use gantry_transport::{IoBuffer, OutboundSink, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const WRAPPER: &str = "commands";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("gantry.protocol.framing: {0}")]
    Framing(#[from] XmlError),
    #[error("gantry.protocol.input_too_large: a single token exceeds the {capacity}-byte inbound buffer")]
    InputTooLarge { capacity: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl EngineError {
    /// 帧错误时尽力发送给客户端的响应；传输错误没有可发送的对象。
    pub fn client_response(&self) -> Option<String> {
        let reason = match self {
            Self::Framing(err) => err.to_string(),
            Self::InputTooLarge { .. } => "input too large".to_owned(),
            Self::Transport(_) => return None,
        };
        Some(
            CommandError::syntax(format!("Failed to parse client XML: {reason}"))
                .render(PROTOCOL_COMMAND),
        )
    }
}

enum State {
    Idle,
    AwaitingClose {
        handler: Arc<dyn CommandHandler>,
        command: Entity,
        nested: usize,
    },
    Accumulating {
        handler: Arc<dyn CommandHandler>,
        name: String,
        context: CommandContext,
    },
    Rejected {
        respond_as: String,
        error: CommandError,
        nested: usize,
    },
}

pub struct ProtocolEngine {
    tokenizer: Tokenizer,
    registry: Arc<CommandRegistry>,
    services: Services,
    session: SessionState,
    state: State,
    wrapped: bool,
    executed: u64,
}

impl ProtocolEngine {
    pub fn new(registry: Arc<CommandRegistry>, services: Services) -> Self {
        Self {
            tokenizer: Tokenizer::new(),
            registry,
            services,
            session: SessionState::default(),
            state: State::Idle,
            wrapped: false,
            executed: 0,
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// 已执行（含以错误响应结束）的命令数。
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// 没有进行中的命令，也不在 `<commands>` 包装内。
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle) && !self.wrapped && self.tokenizer.depth() == 0
    }

    /// 处理入站缓冲里所有完整的记号；不完整的尾部留在缓冲中等待下一次读取。
    pub async fn process(
        &mut self,
        inbound: &mut IoBuffer,
        outbound: &mut IoBuffer,
        sink: &mut dyn OutboundSink,
    ) -> Result<(), EngineError> {
        while let Some((event, used)) = self.tokenizer.next_event(inbound.readable())? {
            inbound.consume(used);
            self.dispatch(event, outbound, sink).await?;
        }
        if inbound.is_full() {
            return Err(EngineError::InputTooLarge {
                capacity: inbound.capacity(),
            });
        }
        Ok(())
    }

    async fn dispatch(
        &mut self,
        event: XmlEvent,
        outbound: &mut IoBuffer,
        sink: &mut dyn OutboundSink,
    ) -> Result<(), EngineError> {
        let state = std::mem::replace(&mut self.state, State::Idle);
        self.state = match (state, event) {
            (State::Idle, XmlEvent::Start { name, attributes }) => {
                if name == WRAPPER && !self.wrapped {
                    self.wrapped = true;
                    Responder::new(outbound, sink)
                        .emit("<commands_response>")
                        .await?;
                    State::Idle
                } else {
                    self.begin(name, attributes)
                }
            }
            (State::Idle, XmlEvent::End { name }) => {
                if name == WRAPPER && self.wrapped {
                    self.wrapped = false;
                    Responder::new(outbound, sink)
                        .emit("</commands_response>")
                        .await?;
                }
                State::Idle
            }
            (State::Idle, XmlEvent::Text(text)) => {
                if !text.trim().is_empty() {
                    return Err(XmlError::StrayText.into());
                }
                State::Idle
            }
            (
                State::AwaitingClose {
                    handler,
                    command,
                    nested,
                },
                event,
            ) => match event {
                XmlEvent::Start { .. } => State::AwaitingClose {
                    handler,
                    command,
                    nested: nested + 1,
                },
                XmlEvent::End { .. } if nested == 0 => {
                    self.execute(handler, command, outbound, sink).await?;
                    State::Idle
                }
                XmlEvent::End { .. } => State::AwaitingClose {
                    handler,
                    command,
                    nested: nested - 1,
                },
                XmlEvent::Text(_) => State::AwaitingClose {
                    handler,
                    command,
                    nested,
                },
            },
            (
                State::Accumulating {
                    handler,
                    name,
                    mut context,
                },
                event,
            ) => {
                context.feed(event);
                if context.is_completed() {
                    let command = context
                        .into_root()
                        .unwrap_or_else(|| Entity::new(name, Attributes::default()));
                    self.execute(handler, command, outbound, sink).await?;
                    State::Idle
                } else {
                    State::Accumulating {
                        handler,
                        name,
                        context,
                    }
                }
            }
            (
                State::Rejected {
                    respond_as,
                    error,
                    nested,
                },
                event,
            ) => match event {
                XmlEvent::Start { .. } => State::Rejected {
                    respond_as,
                    error,
                    nested: nested + 1,
                },
                XmlEvent::End { .. } if nested == 0 => {
                    self.executed += 1;
                    Responder::new(outbound, sink)
                        .emit(&error.render(&respond_as))
                        .await?;
                    State::Idle
                }
                XmlEvent::End { .. } => State::Rejected {
                    respond_as,
                    error,
                    nested: nested - 1,
                },
                XmlEvent::Text(_) => State::Rejected {
                    respond_as,
                    error,
                    nested,
                },
            },
        };
        Ok(())
    }

    /// 顶层开始元素：查找处理器并做开始标签处的全部检查。
    fn begin(&mut self, name: String, attributes: Attributes) -> State {
        let Some(handler) = self.registry.get(&name) else {
            debug!(command = %name, "unknown command");
            return State::Rejected {
                respond_as: PROTOCOL_COMMAND.to_owned(),
                error: CommandError::bogus(),
                nested: 0,
            };
        };
        let admitted = if handler.requires_auth() {
            match &self.session.credentials {
                None => Err(CommandError::auth_required()),
                Some(who) if !self.services.authorizer.authorize(who, &name) => {
                    Err(CommandError::permission_denied())
                }
                Some(_) => Ok(()),
            }
        } else {
            Ok(())
        };
        let admitted = admitted.and_then(|()| {
            handler.on_attributes(&attributes, &self.session, &self.services)
        });
        if let Err(error) = admitted {
            debug!(command = %name, status = error.status, "command rejected at its opening element");
            return State::Rejected {
                respond_as: name,
                error,
                nested: 0,
            };
        }
        match handler.body_mode() {
            BodyMode::Attributes => State::AwaitingClose {
                handler,
                command: Entity::new(name, attributes),
                nested: 0,
            },
            BodyMode::Nested => {
                let mut context = CommandContext::new();
                context.feed(XmlEvent::Start {
                    name: name.clone(),
                    attributes,
                });
                State::Accumulating {
                    handler,
                    name,
                    context,
                }
            }
        }
    }

    async fn execute(
        &mut self,
        handler: Arc<dyn CommandHandler>,
        command: Entity,
        outbound: &mut IoBuffer,
        sink: &mut dyn OutboundSink,
    ) -> Result<(), EngineError> {
        let name = command.name.clone();
        self.executed += 1;
        let mut cx = CommandCx {
            responder: Responder::new(outbound, sink),
            session: &mut self.session,
            services: &self.services,
            registry: &self.registry,
        };
        match handler.on_body_complete(command, &mut cx).await {
            Ok(()) => {
                debug!(command = %name, "command executed");
                Ok(())
            }
            Err(CommandFailure::Command(error)) => {
                if error.status >= 500 {
                    warn!(command = %name, status = error.status, text = %error.text, "command failed");
                } else {
                    info!(command = %name, status = error.status, text = %error.text, "command refused");
                }
                cx.emit(&error.render(&name)).await?;
                Ok(())
            }
            Err(CommandFailure::Transport(err)) => Err(err.into()),
        }
    }
}
