//! 隐匿连接器：HTTP CONNECT / SOCKS5 上游握手与隧道层错误

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use oblivion::common::{Address, Dialer, DialerConfig, HandshakeStage, ProxyError};
use oblivion::config::types::TlsLayerConfig;
use oblivion::proxy::connector::StealthConnector;
use oblivion::proxy::group::UpstreamEndpoint;
use oblivion::proxy::outbound::{Credentials, UpstreamKind};
use oblivion::proxy::transport::{TlsLayer, TunnelStack};

fn connector() -> StealthConnector {
    let dialer = Dialer::new(DialerConfig::with_timeout(Duration::from_secs(2)));
    StealthConnector::new(Arc::new(dialer)).with_handshake_timeout(Duration::from_secs(2))
}

fn target() -> Address {
    Address::Domain("example.com".into(), 443)
}

fn creds() -> Option<Credentials> {
    Credentials::from_parts(Some("user"), Some("pass"))
}

fn stage_of(err: &anyhow::Error) -> Option<HandshakeStage> {
    match err.downcast_ref::<ProxyError>() {
        Some(ProxyError::Handshake { stage, .. }) => Some(*stage),
        _ => None,
    }
}

/// 读完 CONNECT 请求头，返回全部行
async fn read_request(sock: &mut BufReader<TcpStream>) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        sock.read_line(&mut line).await.unwrap();
        let line = line.trim_end().to_string();
        if line.is_empty() {
            break;
        }
        lines.push(line);
    }
    lines
}

async fn http_proxy(status: &'static str) -> (u16, tokio::task::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        let mut sock = BufReader::new(sock);
        let request = read_request(&mut sock).await;
        let reply = format!("HTTP/1.1 {}\r\nServer: mock\r\n\r\n", status);
        sock.get_mut().write_all(reply.as_bytes()).await.unwrap();
        if status.starts_with("200") {
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.get_mut().write_all(&buf).await.unwrap();
        }
        request
    });
    (port, task)
}

#[tokio::test]
async fn http_connect_with_credentials() {
    let (port, server) = http_proxy("200 Connection established").await;
    let ep = UpstreamEndpoint::new("p1", UpstreamKind::Http, "127.0.0.1", port).with_credentials(creds());

    let mut stream = connector().connect(&target(), Some(&ep)).await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    let request = server.await.unwrap();
    assert_eq!(request[0], "CONNECT example.com:443 HTTP/1.1");
    // base64("user:pass")
    assert!(request.iter().any(|l| l == "Proxy-Authorization: Basic dXNlcjpwYXNz"));
}

#[tokio::test]
async fn http_connect_non_200_fails_connect_stage() {
    let (port, _server) = http_proxy("403 Forbidden").await;
    let ep = UpstreamEndpoint::new("p1", UpstreamKind::Http, "127.0.0.1", port);
    let err = connector().connect(&target(), Some(&ep)).await.err().unwrap();
    assert_eq!(stage_of(&err), Some(HandshakeStage::Connect));
    assert!(format!("{:#}", err).contains("403"));
}

#[tokio::test]
async fn http_connect_407_fails_auth_stage() {
    let (port, _server) = http_proxy("407 Proxy Authentication Required").await;
    let ep = UpstreamEndpoint::new("p1", UpstreamKind::Http, "127.0.0.1", port);
    let err = connector().connect(&target(), Some(&ep)).await.err().unwrap();
    assert_eq!(stage_of(&err), Some(HandshakeStage::Auth));
}

/// 最小 SOCKS5 服务端；`auth_status` 为 None 表示不要求认证
async fn socks5_server(auth_status: Option<u8>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut head = [0u8; 2];
        sock.read_exact(&mut head).await.unwrap();
        let mut methods = vec![0u8; head[1] as usize];
        sock.read_exact(&mut methods).await.unwrap();

        match auth_status {
            None => sock.write_all(&[0x05, 0x00]).await.unwrap(),
            Some(status) => {
                assert!(methods.contains(&0x02));
                sock.write_all(&[0x05, 0x02]).await.unwrap();
                let mut ver_ulen = [0u8; 2];
                sock.read_exact(&mut ver_ulen).await.unwrap();
                let mut user = vec![0u8; ver_ulen[1] as usize];
                sock.read_exact(&mut user).await.unwrap();
                let plen = sock.read_u8().await.unwrap();
                let mut pass = vec![0u8; plen as usize];
                sock.read_exact(&mut pass).await.unwrap();
                assert_eq!(user, b"user");
                assert_eq!(pass, b"pass");
                sock.write_all(&[0x01, status]).await.unwrap();
                if status != 0 {
                    return;
                }
            }
        }

        // VER CMD RSV ATYP=domain LEN "example.com" PORT
        let mut req = [0u8; 5];
        sock.read_exact(&mut req).await.unwrap();
        assert_eq!(&req[..4], &[0x05, 0x01, 0x00, 0x03]);
        let mut host = vec![0u8; req[4] as usize + 2];
        sock.read_exact(&mut host).await.unwrap();
        assert_eq!(&host[..host.len() - 2], b"example.com");
        sock.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
            .await
            .unwrap();

        let mut buf = [0u8; 4];
        sock.read_exact(&mut buf).await.unwrap();
        sock.write_all(&buf).await.unwrap();
    });
    port
}

#[tokio::test]
async fn socks5_without_auth() {
    let port = socks5_server(None).await;
    let ep = UpstreamEndpoint::new("p1", UpstreamKind::Socks5, "127.0.0.1", port);
    let mut stream = connector().connect(&target(), Some(&ep)).await.unwrap();
    stream.write_all(b"data").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"data");
}

#[tokio::test]
async fn socks5_with_auth() {
    let port = socks5_server(Some(0x00)).await;
    let ep = UpstreamEndpoint::new("p1", UpstreamKind::Socks5, "127.0.0.1", port).with_credentials(creds());
    assert!(connector().connect(&target(), Some(&ep)).await.is_ok());
}

#[tokio::test]
async fn socks5_rejected_credentials_fail_auth_stage() {
    let port = socks5_server(Some(0x01)).await;
    let ep = UpstreamEndpoint::new("p1", UpstreamKind::Socks5, "127.0.0.1", port).with_credentials(creds());
    let err = connector().connect(&target(), Some(&ep)).await.err().unwrap();
    assert_eq!(stage_of(&err), Some(HandshakeStage::Auth));
}

#[tokio::test]
async fn socks5_wrong_version_is_protocol_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 3];
        sock.read_exact(&mut greeting).await.unwrap();
        sock.write_all(&[0x04, 0x00]).await.unwrap();
    });

    let ep = UpstreamEndpoint::new("p1", UpstreamKind::Socks5, "127.0.0.1", port);
    let err = connector().connect(&target(), Some(&ep)).await.err().unwrap();
    assert_eq!(stage_of(&err), Some(HandshakeStage::Auth));
    assert!(format!("{:#}", err).contains("version 0x04"));
}

#[tokio::test]
async fn tunnel_failure_names_layer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 512];
        let _ = sock.read(&mut buf).await;
        sock.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await.unwrap();
    });

    let mut stack = TunnelStack::new();
    let tls = TlsLayerConfig {
        front_domain: Some("cover.example".into()),
        ..TlsLayerConfig::default()
    };
    stack.push(TlsLayer::from_config(&tls).unwrap());
    let connector = connector().with_tunnel(stack);
    let err = connector.connect(&Address::Ip(addr), None).await.err().unwrap();
    match err.downcast_ref::<ProxyError>() {
        Some(ProxyError::Tunnel { layer, .. }) => assert_eq!(layer, "tls"),
        other => panic!("expected tunnel error, got {:?}", other),
    }
}
