use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{run_stage, stage_error, Credentials, OutboundHandler, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::common::{Address, Dialer, HandshakeStage, ProxyError, ProxyStream};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_REJECTED: u8 = 0xFF;
const AUTH_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 上游（RFC 1928 客户端侧，RFC 1929 用户名密码认证）
pub struct Socks5Outbound {
    server: Address,
    credentials: Option<Credentials>,
    dialer: Arc<Dialer>,
    handshake_timeout: Duration,
}

impl Socks5Outbound {
    pub fn new(server: Address, credentials: Option<Credentials>, dialer: Arc<Dialer>) -> Self {
        Self {
            server,
            credentials,
            dialer,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// 方法协商 + 可选认证
    async fn negotiate(&self, stream: &mut (impl AsyncRead + AsyncWrite + Unpin)) -> Result<()> {
        match &self.credentials {
            Some(_) => stream.write_all(&[VERSION, 0x02, METHOD_NO_AUTH, METHOD_USER_PASS]).await?,
            None => stream.write_all(&[VERSION, 0x01, METHOD_NO_AUTH]).await?,
        }

        let mut resp = [0u8; 2];
        stream.read_exact(&mut resp).await?;
        if resp[0] != VERSION {
            return Err(ProxyError::Protocol(format!(
                "server replied with version 0x{:02x}, expected 0x05",
                resp[0]
            ))
            .into());
        }

        match (resp[1], &self.credentials) {
            (METHOD_NO_AUTH, _) => {
                debug!("socks5: no authentication required");
                Ok(())
            }
            (METHOD_USER_PASS, Some(cred)) => authenticate(stream, cred).await,
            (METHOD_REJECTED, _) => Err(ProxyError::AuthenticationFailed(
                "server rejected all authentication methods".into(),
            )
            .into()),
            (method, _) => Err(ProxyError::Protocol(format!(
                "server selected unoffered method 0x{:02x}",
                method
            ))
            .into()),
        }
    }

    /// 发送 CONNECT 并读完整个回复（含 BND.ADDR）
    async fn request_connect(
        &self,
        stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
        target: &Address,
    ) -> Result<Address> {
        let mut req = BytesMut::with_capacity(64);
        req.put_u8(VERSION);
        req.put_u8(CMD_CONNECT);
        req.put_u8(0x00);
        target.encode_socks5(&mut req)?;
        stream.write_all(&req).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(ProxyError::Protocol(format!(
                "invalid reply version 0x{:02x}",
                head[0]
            ))
            .into());
        }
        if head[1] != 0x00 {
            anyhow::bail!("request failed: {} (0x{:02x})", reply_reason(head[1]), head[1]);
        }

        let atyp = head[3];
        let addr_len = match atyp {
            0x01 => 4,
            0x04 => 16,
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            other => {
                return Err(ProxyError::Protocol(format!(
                    "unsupported bind address type 0x{:02x}",
                    other
                ))
                .into())
            }
        };
        let mut addr = vec![0u8; addr_len];
        stream.read_exact(&mut addr).await?;
        let port = stream.read_u16().await?;
        Address::from_socks5(atyp, &addr, port)
    }
}

async fn authenticate(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    cred: &Credentials,
) -> Result<()> {
    let (user, pass) = (cred.username.as_bytes(), cred.password.as_bytes());
    if user.len() > u8::MAX as usize || pass.len() > u8::MAX as usize {
        return Err(ProxyError::AuthenticationFailed("credentials longer than 255 bytes".into()).into());
    }

    let mut req = Vec::with_capacity(3 + user.len() + pass.len());
    req.push(AUTH_VERSION);
    req.push(user.len() as u8);
    req.extend_from_slice(user);
    req.push(pass.len() as u8);
    req.extend_from_slice(pass);
    stream.write_all(&req).await?;

    let mut resp = [0u8; 2];
    stream.read_exact(&mut resp).await?;
    if resp[0] != AUTH_VERSION {
        return Err(ProxyError::Protocol(format!(
            "unexpected auth version 0x{:02x}",
            resp[0]
        ))
        .into());
    }
    if resp[1] != 0x00 {
        return Err(ProxyError::AuthenticationFailed(format!(
            "username/password rejected (status 0x{:02x})",
            resp[1]
        ))
        .into());
    }
    debug!("socks5: authentication successful");
    Ok(())
}

fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

#[async_trait]
impl OutboundHandler for Socks5Outbound {
    fn kind(&self) -> &'static str {
        "socks5"
    }

    async fn connect(&self, target: &Address) -> Result<ProxyStream> {
        debug!(target = %target, server = %self.server, "socks5 CONNECT");

        let mut stream = self
            .dialer
            .connect_addr(&self.server)
            .await
            .map_err(|e| stage_error(HandshakeStage::Dial, e))?;

        run_stage(
            HandshakeStage::Auth,
            self.handshake_timeout,
            self.negotiate(&mut stream),
        )
        .await?;

        let bound = run_stage(
            HandshakeStage::Connect,
            self.handshake_timeout,
            self.request_connect(&mut stream, target),
        )
        .await?;

        debug!(target = %target, bound = %bound, "socks5 CONNECT tunnel established");
        Ok(Box::new(stream))
    }
}
