use crate::{
    backpressure::BackpressureMeter,
    buffer::IoBuffer,
    error::{READ, READINESS, TransportError, WRITE},
    socket::RawSocket,
    tls::TlsLink,
};
use async_trait::async_trait;
use rustls::ServerConnection;
use std::io;
use tracing::{debug, warn};

/// 一次 `try_read` 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// 读入了 `n` 个字节（可能随后已遇到阻塞或 EOF）。
    Data(usize),
    /// 套接字暂无数据。
    WouldBlock,
    /// 入站缓冲已满，需先消费。不是错误。
    Full,
    /// 对端已关闭，但缓冲内仍有未消费字节；调用方应先处理它们。
    Draining,
    /// 对端已关闭且缓冲已排空。
    Closed,
}

/// 一次 `try_write` 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// 出站缓冲已全部写出，游标已归零。
    Drained,
    /// 套接字暂不可写，缓冲仍有剩余。
    Pending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FillStop {
    Full,
    WouldBlock,
    Eof,
}

#[derive(Debug)]
enum Link {
    Plain(RawSocket),
    Tls(Box<TlsLink>),
}

/// 会话持有的连接端点：明文或 TLS。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 协议引擎只认识两个非阻塞原语：把字节读进入站缓冲、把出站缓冲写出去；
///   明文与 TLS 的差异全部收敛在这里。
///
/// ## 契约 (What)
/// - [`Transport::try_read`]：循环读取直到缓冲写满或会阻塞；中断自动重试；
///   读到 EOF 时若缓冲仍有未消费数据，先返回 [`ReadStatus::Draining`]，
///   仅当缓冲排空后才返回 [`ReadStatus::Closed`]；
/// - [`Transport::try_write`]：从 `start` 写向 `end`，阻塞即停，排空即归零游标；
/// - 任何硬错误立刻以 [`TransportError`] 返回，连接随即由会话释放；
/// - 实现 [`OutboundSink`]，供响应写出时同步排空出站缓冲。
#[derive(Debug)]
pub struct Transport {
    link: Link,
    peer_eof: bool,
    peer: String,
    meter: BackpressureMeter,
}

impl Transport {
    pub fn plain(socket: RawSocket) -> Self {
        let peer = socket.peer_label();
        Self {
            link: Link::Plain(socket),
            peer_eof: false,
            peer,
            meter: BackpressureMeter::default(),
        }
    }

    pub fn tls(socket: RawSocket, conn: ServerConnection) -> Self {
        let peer = socket.peer_label();
        Self {
            link: Link::Tls(Box::new(TlsLink::new(socket, conn))),
            peer_eof: false,
            peer,
            meter: BackpressureMeter::default(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.link, Link::Tls(_))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn socket(&self) -> &RawSocket {
        match &self.link {
            Link::Plain(socket) => socket,
            Link::Tls(link) => link.socket(),
        }
    }

    pub fn try_read(&mut self, buf: &mut IoBuffer) -> Result<ReadStatus, TransportError> {
        if self.peer_eof {
            return Ok(closed_or_draining(buf));
        }
        let (read, stop) = match &mut self.link {
            Link::Plain(socket) => fill_plain(socket, buf)?,
            Link::Tls(link) => link.fill(buf)?,
        };
        if stop == FillStop::Eof {
            debug!(peer = %self.peer, buffered = buf.len(), "peer closed its side");
            self.peer_eof = true;
        }
        Ok(match stop {
            _ if read > 0 => ReadStatus::Data(read),
            FillStop::Full => ReadStatus::Full,
            FillStop::WouldBlock => ReadStatus::WouldBlock,
            FillStop::Eof => closed_or_draining(buf),
        })
    }

    pub fn try_write(&mut self, buf: &mut IoBuffer) -> Result<WriteStatus, TransportError> {
        match &mut self.link {
            Link::Plain(socket) => drain_plain(socket, buf),
            Link::Tls(link) => link.drain(buf),
        }
    }

    pub async fn readable(&self) -> Result<(), TransportError> {
        self.socket()
            .readable()
            .await
            .map_err(|err| TransportError::io(READINESS, err))
    }

    pub async fn writable(&self) -> Result<(), TransportError> {
        self.socket()
            .writable()
            .await
            .map_err(|err| TransportError::io(READINESS, err))
    }

    /// 尽力而为的关闭：TLS 连接发送 `close_notify`，明文连接交给 drop。
    pub fn shutdown(&mut self) {
        if let Link::Tls(link) = &mut self.link {
            link.close();
        }
    }
}

/// 能够同步排空出站缓冲的对象。
///
/// 协议引擎在追加响应前若发现缓冲已满，会先调用 `drain`，
/// 直到缓冲完全写出才继续追加。
#[async_trait]
pub trait OutboundSink: Send {
    async fn drain(&mut self, buf: &mut IoBuffer) -> Result<(), TransportError>;
}

#[async_trait]
impl OutboundSink for Transport {
    async fn drain(&mut self, buf: &mut IoBuffer) -> Result<(), TransportError> {
        loop {
            match self.try_write(buf)? {
                WriteStatus::Drained => {
                    if let Some(report) = self.meter.on_drained() {
                        if report.waited >= BackpressureMeter::SLOW_PEER {
                            warn!(
                                peer = %self.peer,
                                stalls = report.stalls,
                                waited = ?report.waited,
                                "slow client held back outbound data"
                            );
                        } else {
                            debug!(
                                peer = %self.peer,
                                stalls = report.stalls,
                                waited = ?report.waited,
                                "outbound buffer drained after backpressure"
                            );
                        }
                    }
                    return Ok(());
                }
                WriteStatus::Pending => {
                    self.meter.on_stall();
                    self.writable().await?;
                }
            }
        }
    }
}

fn closed_or_draining(buf: &IoBuffer) -> ReadStatus {
    if buf.is_empty() {
        ReadStatus::Closed
    } else {
        ReadStatus::Draining
    }
}

fn fill_plain(socket: &RawSocket, buf: &mut IoBuffer) -> Result<(usize, FillStop), TransportError> {
    let mut total = 0;
    loop {
        let slot = buf.writable();
        if slot.is_empty() {
            return Ok((total, FillStop::Full));
        }
        match socket.try_read(slot) {
            Ok(0) => return Ok((total, FillStop::Eof)),
            Ok(n) => {
                buf.commit(n);
                total += n;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Ok((total, FillStop::WouldBlock));
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(TransportError::io(READ, err)),
        }
    }
}

fn drain_plain(socket: &RawSocket, buf: &mut IoBuffer) -> Result<WriteStatus, TransportError> {
    loop {
        if buf.is_empty() {
            buf.reset();
            return Ok(WriteStatus::Drained);
        }
        match socket.try_write(buf.readable()) {
            Ok(0) => {
                return Err(TransportError::io(
                    WRITE,
                    io::Error::from(io::ErrorKind::WriteZero),
                ));
            }
            Ok(n) => buf.consume(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Ok(WriteStatus::Pending);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(TransportError::io(WRITE, err)),
        }
    }
}
