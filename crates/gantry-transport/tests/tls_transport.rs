//! TLS 传输端到端测试：握手后的同步读写路径与关闭语义。
//!
//! 服务端使用 `TlsAcceptor` 完成握手并得到 `Transport`，客户端使用 `tokio-rustls`
//! 正常读写，验证 `try_read` / `drain` 与明文连接保持一致的语义。

use gantry_transport::{
    IoBuffer, OutboundSink, RawSocket, ReadStatus, TlsAcceptor, Transport, TransportError,
    server_config_from_der,
};
use rustls::{AlertDescription, ClientConfig, RootCertStore};
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::{TlsConnector, client::TlsStream};

struct Fixture {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

fn fixture() -> Fixture {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
    let cert_der = certified.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));
    let server = server_config_from_der(vec![cert_der.clone()], key_der).unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let client = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Fixture {
        acceptor: TlsAcceptor::new(server, Duration::from_secs(5)),
        connector: TlsConnector::from(Arc::new(client)),
    }
}

async fn connect(fixture: &Fixture) -> (Transport, TlsStream<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connector = fixture.connector.clone();
    let client = tokio::spawn(async move {
        let stream = TcpStream::connect(addr).await.unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        connector.connect(name, stream).await.unwrap()
    });
    let (stream, _) = listener.accept().await.unwrap();
    let transport = fixture.acceptor.accept(RawSocket::from(stream)).await.unwrap();
    (transport, client.await.unwrap())
}

async fn read_until(
    transport: &mut Transport,
    buf: &mut IoBuffer,
    stop: impl Fn(ReadStatus) -> bool,
) -> Result<ReadStatus, TransportError> {
    loop {
        let status = transport.try_read(buf)?;
        if stop(status) {
            return Ok(status);
        }
        if status == ReadStatus::WouldBlock {
            transport.readable().await?;
        }
    }
}

#[tokio::test]
async fn tls_round_trip_uses_buffer_cursors() {
    let fixture = fixture();
    let (mut transport, mut client) = connect(&fixture).await;
    assert!(transport.is_tls());

    client.write_all(b"<get_version/>").await.unwrap();
    client.flush().await.unwrap();

    let mut inbound = IoBuffer::with_capacity(1024);
    while inbound.len() < 14 {
        read_until(&mut transport, &mut inbound, |s| matches!(s, ReadStatus::Data(_)))
            .await
            .unwrap();
    }
    assert_eq!(inbound.readable(), b"<get_version/>");

    let mut outbound = IoBuffer::with_capacity(256);
    let reply = b"<get_version_response status=\"200\" status_text=\"OK\"/>";
    outbound.append(reply);
    transport.drain(&mut outbound).await.unwrap();
    assert_eq!(outbound.cursors(), (0, 0));

    let mut received = vec![0u8; reply.len()];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, reply);
}

#[tokio::test]
async fn close_notify_is_reported_as_closure() {
    let fixture = fixture();
    let (mut transport, mut client) = connect(&fixture).await;

    client.write_all(b"<help/>").await.unwrap();
    client.shutdown().await.unwrap();

    let mut inbound = IoBuffer::with_capacity(1024);
    let status = read_until(&mut transport, &mut inbound, |s| {
        matches!(s, ReadStatus::Draining | ReadStatus::Closed)
    })
    .await
    .unwrap();
    assert_eq!(status, ReadStatus::Draining);
    assert_eq!(inbound.readable(), b"<help/>");

    inbound.consume(inbound.len());
    assert_eq!(transport.try_read(&mut inbound).unwrap(), ReadStatus::Closed);
}

#[tokio::test]
async fn garbage_records_are_a_hard_error() {
    let fixture = fixture();
    let (mut transport, client) = connect(&fixture).await;

    let (mut raw, _) = client.into_inner();
    raw.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let mut inbound = IoBuffer::with_capacity(1024);
    let err = read_until(&mut transport, &mut inbound, |_| false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "gantry.transport.tls_read_failed");
}

#[tokio::test]
async fn fatal_alert_from_the_peer_is_reported_with_its_description() {
    let fixture = fixture();
    let (mut transport, mut client) = connect(&fixture).await;

    // 客户端收到无法解密的记录时会排队一条加密的 bad_record_mac 致命告警。
    let (raw, conn) = client.get_mut();
    let mut bogus = vec![0x17, 0x03, 0x03, 0x00, 0x20];
    bogus.extend_from_slice(&[0u8; 32]);
    conn.read_tls(&mut bogus.as_slice()).unwrap();
    assert!(conn.process_new_packets().is_err());
    let mut records = Vec::new();
    while conn.wants_write() {
        conn.write_tls(&mut records).unwrap();
    }
    raw.write_all(&records).await.unwrap();

    let mut inbound = IoBuffer::with_capacity(1024);
    let err = read_until(&mut transport, &mut inbound, |_| false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "gantry.transport.tls_alert");
    assert!(matches!(
        err,
        TransportError::TlsAlert {
            alert: AlertDescription::BadRecordMac,
            ..
        }
    ));
}

#[tokio::test]
async fn payload_beyond_the_tls_buffer_limit_is_drained_whole() {
    let fixture = fixture();
    let (mut transport, mut client) = connect(&fixture).await;

    let payload: Vec<u8> = (0..200 * 1024).map(|i| b'a' + (i % 26) as u8).collect();
    let expected = payload.len();
    let reader = tokio::spawn(async move {
        let mut received = vec![0u8; expected];
        client.read_exact(&mut received).await.unwrap();
        received
    });

    let mut outbound = IoBuffer::with_capacity(payload.len());
    assert_eq!(outbound.append(&payload), payload.len());
    tokio::time::timeout(Duration::from_secs(10), transport.drain(&mut outbound))
        .await
        .expect("drain completes while the peer reads")
        .unwrap();
    assert_eq!(outbound.cursors(), (0, 0));
    assert_eq!(reader.await.unwrap(), payload);
}

#[tokio::test]
async fn handshake_times_out_when_client_stays_silent() {
    let fixture = fixture();
    let acceptor = TlsAcceptor::new(fixture.acceptor.config_snapshot(), Duration::from_millis(50));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _silent = TcpStream::connect(addr).await.unwrap();
    let (stream, _) = listener.accept().await.unwrap();

    let err = acceptor.accept(RawSocket::from(stream)).await.unwrap_err();
    assert!(matches!(err, TransportError::HandshakeTimeout(_)));
    assert_eq!(err.code(), "gantry.transport.tls_handshake_timeout");
}
