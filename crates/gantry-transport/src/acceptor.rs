use crate::{
    error::{HANDSHAKE, TransportError},
    socket::RawSocket,
    transport::Transport,
};
use arc_swap::ArcSwap;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::{fmt, fs::File, io::BufReader, path::Path, sync::Arc, time::Duration};
use tokio_rustls::TlsAcceptor as TokioTlsAcceptor;
use tracing::debug;

/// TLS 服务端握手入口。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 监听循环接受连接后，在限定时间内完成 TLS 握手，再把连接交给同步的
///   [`Transport`] 读写路径；
/// - 通过 [`ArcSwap`] 支持热更新 [`ServerConfig`]，守护进程收到 `SIGHUP` 时重新装载证书，
///   已建立的连接继续使用各自握手时的配置。
///
/// ## 逻辑（How）
/// 1. 读取当前配置快照并构造 `tokio_rustls::TlsAcceptor`；
/// 2. 以 `tokio::time::timeout` 包裹异步握手；
/// 3. 握手成功后拆出 `(RawSocket, ServerConnection)`，构造 TLS 版 [`Transport`]。
///
/// ## 契约（What）
/// - `accept`：成功返回可用的 [`Transport`]；超时返回 [`TransportError::HandshakeTimeout`]，
///   其他失败返回带 `gantry.transport.tls_handshake_failed` 错误码的 I/O 错误；
/// - `replace_config`：原子替换 TLS 配置。
#[derive(Clone)]
pub struct TlsAcceptor {
    config: Arc<ArcSwap<ServerConfig>>,
    handshake_timeout: Duration,
}

impl TlsAcceptor {
    pub fn new(config: Arc<ServerConfig>, handshake_timeout: Duration) -> Self {
        Self {
            config: Arc::new(ArcSwap::new(config)),
            handshake_timeout,
        }
    }

    /// 替换当前 TLS 配置，通常用于证书热更新。
    pub fn replace_config(&self, config: Arc<ServerConfig>) {
        self.config.store(config);
    }

    pub fn config_snapshot(&self) -> Arc<ServerConfig> {
        self.config.load_full()
    }

    pub async fn accept(&self, socket: RawSocket) -> Result<Transport, TransportError> {
        let acceptor = TokioTlsAcceptor::from(self.config.load_full());
        let stream = tokio::time::timeout(self.handshake_timeout, acceptor.accept(socket))
            .await
            .map_err(|_| TransportError::HandshakeTimeout(self.handshake_timeout))?
            .map_err(|err| TransportError::io(HANDSHAKE, err))?;
        let (socket, conn) = stream.into_inner();
        debug!(
            peer = %socket.peer_label(),
            version = ?conn.protocol_version(),
            suite = ?conn.negotiated_cipher_suite().map(|suite| suite.suite()),
            "tls handshake complete"
        );
        Ok(Transport::tls(socket, conn))
    }
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor")
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

/// 从 PEM 文件装载证书链与私钥，构造仅含服务端证书的 [`ServerConfig`]。
///
/// 使用 ring 作为加密后端，协议版本取 rustls 的安全默认值（TLS 1.2 / 1.3）。
pub fn load_server_config(
    certificate: &Path,
    private_key: &Path,
) -> Result<Arc<ServerConfig>, TransportError> {
    let chain = load_certificates(certificate)?;
    let key = load_private_key(private_key)?;
    server_config_from_der(chain, key)
}

/// 以 DER 形式的证书链与私钥构造服务端配置。
pub fn server_config_from_der(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| TransportError::config(err.to_string()))?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|err| TransportError::config(err.to_string()))?;
    Ok(Arc::new(config))
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path)
        .map_err(|err| TransportError::config(format!("open {}: {err}", path.display())))?;
    let chain = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| TransportError::config(format!("parse {}: {err}", path.display())))?;
    if chain.is_empty() {
        return Err(TransportError::config(format!(
            "{} contains no certificates",
            path.display()
        )));
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path)
        .map_err(|err| TransportError::config(format!("open {}: {err}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|err| TransportError::config(format!("parse {}: {err}", path.display())))?
        .ok_or_else(|| TransportError::config(format!("{} contains no private key", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn pem_files_without_material_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        File::create(&cert).unwrap().write_all(b"not a pem").unwrap();
        File::create(&key).unwrap().write_all(b"").unwrap();

        let err = load_server_config(&cert, &key).unwrap_err();
        assert_eq!(err.code(), "gantry.transport.tls_config_invalid");
        assert!(err.to_string().contains("contains no certificates"));
    }

    #[test]
    fn generated_pem_material_loads() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, certified.cert.pem()).unwrap();
        std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();

        let config = load_server_config(&cert, &key).unwrap();
        let acceptor = TlsAcceptor::new(config.clone(), Duration::from_secs(1));
        assert!(Arc::ptr_eq(&acceptor.config_snapshot(), &config));
    }
}
