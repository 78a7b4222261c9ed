use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use super::{run_stage, stage_error, Credentials, OutboundHandler, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::common::{Address, Dialer, HandshakeStage, PrefixedStream, ProxyError, ProxyStream};

/// 响应头上限，防止恶意上游无限输出
const MAX_RESPONSE_HEADER: usize = 16 * 1024;

/// HTTP CONNECT 上游
pub struct HttpOutbound {
    server: Address,
    credentials: Option<Credentials>,
    dialer: Arc<Dialer>,
    handshake_timeout: Duration,
}

impl HttpOutbound {
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

    fn build_request(&self, target: &Address) -> String {
        let target_str = target.to_string();
        let mut request = format!(
            "CONNECT {} HTTP/1.1\r\nHost: {}\r\n",
            target_str, target_str
        );
        if let Some(cred) = &self.credentials {
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", cred.username, cred.password));
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
        }
        request.push_str("\r\n");
        request
    }

    async fn handshake(&self, mut stream: ProxyStream, target: &Address) -> Result<ProxyStream> {
        stream.write_all(self.build_request(target).as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let status_line = read_header_line(&mut reader, &mut 0).await?;
        if status_line.is_empty() {
            return Err(ProxyError::Protocol("proxy closed connection before responding".into()).into());
        }

        let status_code = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| {
                ProxyError::Protocol(format!("invalid CONNECT response: {}", status_line.trim()))
            })?;

        match status_code {
            200 => {}
            407 => {
                return Err(ProxyError::handshake(
                    HandshakeStage::Auth,
                    format!("proxy authentication required: {}", status_line.trim()),
                )
                .into())
            }
            _ => anyhow::bail!("CONNECT rejected: {}", status_line.trim()),
        }

        // 跳过剩余响应头
        let mut consumed = status_line.len();
        loop {
            let line = read_header_line(&mut reader, &mut consumed).await?;
            if line.trim().is_empty() {
                break;
            }
        }

        // 缓冲区里已读到的隧道数据要还给调用方
        let leftover = reader.buffer().to_vec();
        debug!(target = %target, leftover = leftover.len(), "http CONNECT tunnel established");
        Ok(PrefixedStream::wrap(leftover, reader.into_inner()))
    }
}

async fn read_header_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    consumed: &mut usize,
) -> Result<String> {
    let limit = MAX_RESPONSE_HEADER.saturating_sub(*consumed) as u64;
    let mut line = String::new();
    let n = (&mut *reader).take(limit).read_line(&mut line).await?;
    *consumed += n;
    if n as u64 == limit && !line.ends_with('\n') {
        return Err(ProxyError::Protocol("CONNECT response headers too large".into()).into());
    }
    Ok(line)
}

#[async_trait]
impl OutboundHandler for HttpOutbound {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn connect(&self, target: &Address) -> Result<ProxyStream> {
        debug!(target = %target, server = %self.server, "http CONNECT proxy");

        let stream = self
            .dialer
            .connect_addr(&self.server)
            .await
            .map_err(|e| stage_error(HandshakeStage::Dial, e))?;

        run_stage(
            HandshakeStage::Connect,
            self.handshake_timeout,
            self.handshake(Box::new(stream), target),
        )
        .await
    }
}
