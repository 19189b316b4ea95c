#![doc = r#"
# gantry-transport

## 设计目标（Why）
- 为管理守护进程的每条连接提供统一的非阻塞读写端点：明文 TCP / Unix 域套接字，
  或在其上叠加的 TLS；
- 以固定容量的入站/出站缓冲对实现背压：出站缓冲写满即同步排空，入站缓冲
  写满即暂停读取，内存占用与客户端行为无关。

## 核心契约（What）
- [`Transport::try_read`] / [`Transport::try_write`]：非阻塞原语，`WouldBlock` 与
  `Interrupted` 是进度信号而非错误；
- [`OutboundSink`]：协议引擎在追加响应前排空出站缓冲的接口；
- [`Listener`] / [`TlsAcceptor`]：接受连接并（可选地）完成 TLS 握手。

## 实现策略（How）
- 明文路径直接调用 Tokio 套接字的 `try_read` / `try_write`；
- TLS 路径握手借助 `tokio-rustls`，握手后改为手动泵送 rustls 状态机，
  让两种连接共享同一套游标语义。
"#]

mod acceptor;
mod backpressure;
mod buffer;
pub mod error;
mod listener;
mod socket;
mod tls;
mod transport;

pub use acceptor::{TlsAcceptor, load_server_config, server_config_from_der};
pub use buffer::{DuplexBuffers, IoBuffer};
pub use error::TransportError;
pub use listener::{Endpoint, EndpointParseError, Listener};
pub use socket::RawSocket;
pub use transport::{OutboundSink, ReadStatus, Transport, WriteStatus};
