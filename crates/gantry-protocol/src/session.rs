//! 单条连接的读写驱动。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 每条连接独占一个 [`Session`]：一个传输端点、一对缓冲、一个协议引擎，
//!   没有任何进程级共享的缓冲；
//! - 会话只在 `try_read` / `try_write` 报告会阻塞时挂起，命令一旦开始执行就
//!   运行到结束。
//!
//! ## 逻辑 (How)
//! 1. 读入尽可能多的字节；
//! 2. 交给引擎处理全部完整记号；
//! 3. 排空出站缓冲后再读下一批；
//! 4. 对端关闭且缓冲已处理完、空闲超时、帧错误或传输错误时结束。
//!
//! ## 契约 (What)
//! - 帧错误时尽力发送 `<protocol_response status="400" .../>` 后关闭；
//! - 对端关闭时缓冲里残留的半个记号被丢弃，并记录日志。

use crate::engine::{EngineError, ProtocolEngine};
use gantry_transport::{DuplexBuffers, OutboundSink, ReadStatus, Transport};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 帧错误响应的发送时限。
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(5);

/// 会话结束的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// 对端关闭，所有完整命令均已执行。
    PeerClosed,
    /// 对端关闭时留下了不完整的输入。
    Truncated,
    IdleTimeout,
}

pub struct Session {
    transport: Transport,
    buffers: DuplexBuffers,
    engine: ProtocolEngine,
    idle_timeout: Option<Duration>,
}

impl Session {
    pub fn new(transport: Transport, buffers: DuplexBuffers, engine: ProtocolEngine) -> Self {
        Self {
            transport,
            buffers,
            engine,
            idle_timeout: None,
        }
    }

    /// 设置空闲超时；`Duration::ZERO` 表示不限。
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    /// 驱动会话直到结束。错误已记录日志，返回值供调用方统计。
    pub async fn run(mut self) -> Result<SessionEnd, EngineError> {
        let result = self.pump().await;
        match &result {
            Ok(end) => debug!(
                peer = %self.transport.peer(),
                commands = self.engine.executed(),
                end = ?end,
                "session finished"
            ),
            Err(EngineError::Transport(err)) if err.is_disconnect() => {
                debug!(peer = %self.transport.peer(), error = %err, "client went away");
            }
            Err(err) => {
                warn!(peer = %self.transport.peer(), code = error_code(err), error = %err, "session aborted");
                if let Some(response) = err.client_response() {
                    self.farewell(&response).await;
                }
            }
        }
        self.transport.shutdown();
        result
    }

    async fn pump(&mut self) -> Result<SessionEnd, EngineError> {
        loop {
            let status = self.transport.try_read(&mut self.buffers.inbound)?;
            match status {
                ReadStatus::Data(_) | ReadStatus::Full | ReadStatus::Draining => {
                    self.engine
                        .process(
                            &mut self.buffers.inbound,
                            &mut self.buffers.outbound,
                            &mut self.transport,
                        )
                        .await?;
                    self.flush().await?;
                    if status == ReadStatus::Draining && !self.buffers.inbound.is_empty() {
                        info!(
                            peer = %self.transport.peer(),
                            discarded = self.buffers.inbound.len(),
                            "client closed the connection in the middle of a command"
                        );
                        return Ok(SessionEnd::Truncated);
                    }
                }
                ReadStatus::WouldBlock => {
                    let readable = self.transport.readable();
                    match self.idle_timeout {
                        Some(limit) => {
                            if tokio::time::timeout(limit, readable).await.is_err() {
                                info!(peer = %self.transport.peer(), idle = ?limit, "closing idle session");
                                return Ok(SessionEnd::IdleTimeout);
                            }
                        }
                        None => readable.await?,
                    }
                }
                ReadStatus::Closed => {
                    if !self.engine.is_idle() {
                        info!(peer = %self.transport.peer(), "client closed the connection inside an open element");
                        return Ok(SessionEnd::Truncated);
                    }
                    return Ok(SessionEnd::PeerClosed);
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<(), EngineError> {
        if !self.buffers.outbound.is_empty() {
            self.transport.drain(&mut self.buffers.outbound).await?;
        }
        Ok(())
    }

    async fn farewell(&mut self, response: &str) {
        let outbound = &mut self.buffers.outbound;
        let transport = &mut self.transport;
        let send = async {
            let mut rest = response.as_bytes();
            while !rest.is_empty() {
                let written = outbound.append(rest);
                rest = &rest[written..];
                transport.drain(outbound).await?;
            }
            Ok::<_, gantry_transport::TransportError>(())
        };
        match tokio::time::timeout(FAREWELL_TIMEOUT, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "could not deliver the framing error response"),
            Err(_) => debug!("timed out delivering the framing error response"),
        }
    }
}

fn error_code(err: &EngineError) -> &'static str {
    match err {
        EngineError::Framing(_) => "gantry.protocol.framing",
        EngineError::InputTooLarge { .. } => "gantry.protocol.input_too_large",
        EngineError::Transport(err) => err.code(),
    }
}
