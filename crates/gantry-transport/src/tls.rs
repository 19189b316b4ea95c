use crate::{
    buffer::IoBuffer,
    error::{TLS_READ, TLS_WRITE, TransportError, is_closure_alert, map_tls_error},
    socket::{RawSocket, SyncIo},
    transport::{FillStop, WriteStatus},
};
use rustls::ServerConnection;
use std::io::{self, Read, Write};
use tracing::{debug, warn};

/// rustls 写入端缓存的明文/密文上限；超过后 `writer().write` 返回 0，由排空循环先写出记录。
const TLS_BUFFER_LIMIT: usize = 64 * 1024;

/// 握手完成后的 TLS 会话：同步 rustls 状态机 + 非阻塞套接字。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 会话层用与明文连接完全相同的 `try_read` / `try_write` 语义驱动加密连接，
///   因此这里不使用 `tokio-rustls` 的异步流，而是手动泵送 `read_tls` /
///   `process_new_packets` / `write_tls`；
/// - 握手由 [`TlsAcceptor`](crate::TlsAcceptor) 借助 `tokio-rustls` 完成，随后拆出
///   `ServerConnection` 交给本结构。
///
/// ## 逻辑 (How)
/// - 读：优先从 rustls 取已解密明文；耗尽时从套接字读入记录并处理，
///   `WouldBlock` / `Interrupted` 只是停止或重试信号；
/// - 密钥更新、拒绝重协商等由 rustls 内部处理，循环继续即可；
/// - 致命告警记录 `warn` 并映射为 [`TransportError::TlsAlert`]；
///   `close_notify` 视为正常结束；
/// - 写：先写出积压记录，再把明文交给 rustls，直到缓冲排空或套接字阻塞。
#[derive(Debug)]
pub(crate) struct TlsLink {
    socket: RawSocket,
    conn: ServerConnection,
}

impl TlsLink {
    pub(crate) fn new(socket: RawSocket, mut conn: ServerConnection) -> Self {
        conn.set_buffer_limit(Some(TLS_BUFFER_LIMIT));
        Self { socket, conn }
    }

    pub(crate) fn socket(&self) -> &RawSocket {
        &self.socket
    }

    pub(crate) fn fill(&mut self, buf: &mut IoBuffer) -> Result<(usize, FillStop), TransportError> {
        let mut total = 0;
        loop {
            let slot = buf.writable();
            if slot.is_empty() {
                return Ok((total, FillStop::Full));
            }
            match self.conn.reader().read(slot) {
                Ok(0) => return Ok((total, FillStop::Eof)),
                Ok(n) => {
                    buf.commit(n);
                    total += n;
                    continue;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("tls peer closed the socket without close_notify");
                    return Ok((total, FillStop::Eof));
                }
                Err(err) => return Err(TransportError::io(TLS_READ, err)),
            }

            match self.conn.read_tls(&mut SyncIo(&self.socket)) {
                Ok(0) => return Ok((total, FillStop::Eof)),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok((total, FillStop::WouldBlock));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::io(TLS_READ, err)),
            }

            match self.conn.process_new_packets() {
                Ok(state) => {
                    if state.tls_bytes_to_write() > 0 {
                        self.push_records_best_effort();
                    }
                }
                Err(rustls::Error::AlertReceived(alert)) if is_closure_alert(alert) => {
                    debug!(?alert, "tls peer signalled closure");
                    return Ok((total, FillStop::Eof));
                }
                Err(err) => {
                    match &err {
                        rustls::Error::AlertReceived(alert) => {
                            warn!(?alert, "tls peer sent a fatal alert");
                        }
                        other => warn!(error = %other, "tls record processing failed"),
                    }
                    // rustls 已排队本端告警，尽力告知对端。
                    self.push_records_best_effort();
                    return Err(map_tls_error(TLS_READ, err));
                }
            }
        }
    }

    pub(crate) fn drain(&mut self, buf: &mut IoBuffer) -> Result<WriteStatus, TransportError> {
        loop {
            while self.conn.wants_write() {
                match self.conn.write_tls(&mut SyncIo(&self.socket)) {
                    Ok(0) => {
                        return Err(TransportError::io(
                            TLS_WRITE,
                            io::Error::from(io::ErrorKind::WriteZero),
                        ));
                    }
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(WriteStatus::Pending);
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => return Err(TransportError::io(TLS_WRITE, err)),
                }
            }
            if buf.is_empty() {
                buf.reset();
                return Ok(WriteStatus::Drained);
            }
            let accepted = self
                .conn
                .writer()
                .write(buf.readable())
                .map_err(|err| TransportError::io(TLS_WRITE, err))?;
            if accepted == 0 && !self.conn.wants_write() {
                return Err(TransportError::io(
                    TLS_WRITE,
                    io::Error::from(io::ErrorKind::WriteZero),
                ));
            }
            buf.consume(accepted);
        }
    }

    /// 发送 `close_notify`；写不出去也不报错，连接随后即被丢弃。
    pub(crate) fn close(&mut self) {
        self.conn.send_close_notify();
        self.push_records_best_effort();
    }

    fn push_records_best_effort(&mut self) {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut SyncIo(&self.socket)) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        let _ = SyncIo(&self.socket).flush();
    }
}
