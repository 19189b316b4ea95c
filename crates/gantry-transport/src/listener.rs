use crate::{
    error::{ACCEPT, BIND, TransportError},
    socket::RawSocket,
};
use std::{
    fmt,
    io,
    net::SocketAddr,
    os::unix::fs::{FileTypeExt, PermissionsExt},
    path::{Path, PathBuf},
    str::FromStr,
};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info};

/// 监听端点：`tcp:<addr>:<port>` 或 `unix:<path>`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

/// 端点字符串无法解析。
#[derive(Debug, thiserror::Error)]
#[error("invalid endpoint '{input}': {reason}")]
pub struct EndpointParseError {
    input: String,
    reason: &'static str,
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let fail = |reason| EndpointParseError {
            input: input.to_owned(),
            reason,
        };
        if let Some(path) = input.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(fail("unix socket path is empty"));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        let addr = input.strip_prefix("tcp:").unwrap_or(input);
        addr.parse()
            .map(Self::Tcp)
            .map_err(|_| fail("expected tcp:<ip>:<port> or unix:<path>"))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// 已绑定的监听器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 管理协议既可走 TCP（通常配 TLS），也可走本机 Unix 域套接字（通常明文，
///   由文件权限控制访问）；监听循环只需要“接受一个 [`RawSocket`]”。
///
/// ## 契约 (What)
/// - `bind`：Unix 端点会先移除残留的套接字文件（仅当它确实是套接字），
///   绑定后按 `mode` 设置权限；
/// - `accept`：返回新连接及对端描述；
/// - drop 时 Unix 监听器删除自己的套接字文件。
pub struct Listener {
    inner: Inner,
    endpoint: Endpoint,
}

enum Inner {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint, unix_mode: Option<u32>) -> Result<Self, TransportError> {
        let (inner, endpoint) = match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|err| TransportError::io(BIND, err))?;
                let local = listener
                    .local_addr()
                    .map_err(|err| TransportError::io(BIND, err))?;
                (Inner::Tcp(listener), Endpoint::Tcp(local))
            }
            Endpoint::Unix(path) => {
                remove_stale_socket(path).map_err(|err| TransportError::io(BIND, err))?;
                let listener =
                    UnixListener::bind(path).map_err(|err| TransportError::io(BIND, err))?;
                if let Some(mode) = unix_mode {
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                        .map_err(|err| TransportError::io(BIND, err))?;
                }
                (Inner::Unix(listener), Endpoint::Unix(path.clone()))
            }
        };
        info!(endpoint = %endpoint, "listening");
        Ok(Self { inner, endpoint })
    }

    /// 实际绑定的端点（TCP 端口为 0 时可借此得知分配的端口）。
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn accept(&self) -> Result<(RawSocket, String), TransportError> {
        match &self.inner {
            Inner::Tcp(listener) => {
                let (stream, peer) = listener
                    .accept()
                    .await
                    .map_err(|err| TransportError::io(ACCEPT, err))?;
                stream
                    .set_nodelay(true)
                    .map_err(|err| TransportError::io(ACCEPT, err))?;
                Ok((RawSocket::Tcp(stream), peer.to_string()))
            }
            Inner::Unix(listener) => {
                let (stream, _) = listener
                    .accept()
                    .await
                    .map_err(|err| TransportError::io(ACCEPT, err))?;
                Ok((RawSocket::Unix(stream), "unix".to_owned()))
            }
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Endpoint::Unix(path) = &self.endpoint {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!(path = %path.display(), "removing stale socket file");
            std::fs::remove_file(path)
        }
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_parse() {
        assert_eq!(
            "tcp:127.0.0.1:9390".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:9390".parse().unwrap())
        );
        assert_eq!(
            "127.0.0.1:9390".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:9390".parse().unwrap())
        );
        assert_eq!(
            "unix:/run/gantryd.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/run/gantryd.sock"))
        );
        assert!("unix:".parse::<Endpoint>().is_err());
        assert!("tcp:nowhere".parse::<Endpoint>().is_err());
    }

    #[tokio::test]
    async fn unix_listener_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantryd.sock");
        let endpoint = Endpoint::Unix(path.clone());

        let first = Listener::bind(&endpoint, Some(0o660)).await.unwrap();
        std::mem::forget(first);
        assert!(path.exists());

        let second = Listener::bind(&endpoint, None).await.unwrap();
        let client = tokio::net::UnixStream::connect(&path).await.unwrap();
        let (socket, peer) = second.accept().await.unwrap();
        assert_eq!(peer, "unix");
        assert!(matches!(socket, RawSocket::Unix(_)));
        drop(client);
        drop(second);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn regular_file_is_not_clobbered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"keep me").unwrap();
        let err = Listener::bind(&Endpoint::Unix(path.clone()), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "gantry.transport.bind_failed");
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }
}
