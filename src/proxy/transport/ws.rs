use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::common::{Address, ProxyStream};
use crate::config::types::WsLayerConfig;

use super::TunnelLayer;

/// WebSocket 隧道层，数据走 Binary 帧
pub struct WsLayer {
    path: String,
    host: Option<String>,
}

impl WsLayer {
    pub fn new(path: impl Into<String>, host: Option<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self { path, host }
    }

    pub fn from_config(cfg: &WsLayerConfig) -> Self {
        Self::new(cfg.path.clone(), cfg.host.clone().filter(|h| !h.is_empty()))
    }
}

#[async_trait]
impl TunnelLayer for WsLayer {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn wrap(&self, stream: ProxyStream, target: &Address) -> Result<ProxyStream> {
        let host = self.host.clone().unwrap_or_else(|| target.host());
        let uri = format!("ws://{}:{}{}", host, target.port(), self.path);
        let request = Request::builder()
            .uri(&uri)
            .header("Host", host.as_str())
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .body(())?;

        let (ws_stream, _response) = tokio_tungstenite::client_async(request, stream)
            .await
            .map_err(|e| anyhow::anyhow!("websocket upgrade failed: {}", e))?;

        debug!(uri = %uri, "WebSocket tunnel established");
        Ok(Box::new(WsStream::new(ws_stream)))
    }
}

/// WebSocket 消息流到字节流的适配
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
        }
    }

    fn drain_into(&mut self, buf: &mut ReadBuf<'_>) {
        let remaining = &self.read_buf[self.read_pos..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        self.read_pos += n;
        if self.read_pos >= self.read_buf.len() {
            self.read_buf.clear();
            self.read_pos = 0;
        }
    }
}

fn ws_err(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::other(e)
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_pos < self.read_buf.len() {
            self.drain_into(buf);
            return Poll::Ready(Ok(()));
        }

        // 控制帧不产出数据，继续拉下一帧
        loop {
            let msg = match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => msg,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_err(e))),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            };
            let data: Vec<u8> = match msg {
                Message::Binary(data) => data.to_vec(),
                Message::Text(text) => text.as_str().as_bytes().to_vec(),
                Message::Close(_) => return Poll::Ready(Ok(())),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            if data.is_empty() {
                continue;
            }
            self.read_buf = data;
            self.read_pos = 0;
            self.drain_into(buf);
            return Poll::Ready(Ok(()));
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WsStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let msg = Message::Binary(buf.to_vec().into());
                match Pin::new(&mut self.inner).start_send(msg) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(e) => Poll::Ready(Err(ws_err(e))),
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(ws_err(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(ws_err)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(ws_err)
    }
}
