//! 首包分片。
//!
//! 连接建立后的前几次写入被拆成随机大小的小段逐段写出，
//! 使 ClientHello / HTTP 请求头无法在单个 TCP 段里被明文匹配。
//! 之后退化为直通。

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use crate::common::{Address, ProxyStream};
use crate::config::types::DpiConfig;

use super::TunnelLayer;

#[derive(Debug, Clone, Copy)]
pub struct FragmentLayer {
    min_len: usize,
    max_len: usize,
    packets: u32,
}

impl FragmentLayer {
    pub fn new(min_len: usize, max_len: usize, packets: u32) -> Self {
        let min_len = min_len.max(1);
        Self {
            min_len,
            max_len: max_len.max(min_len),
            packets,
        }
    }

    pub fn from_config(cfg: &DpiConfig) -> Self {
        Self::new(cfg.fragment_min, cfg.fragment_max, cfg.fragment_packets as u32)
    }
}

#[async_trait]
impl TunnelLayer for FragmentLayer {
    fn name(&self) -> &'static str {
        "fragment"
    }

    async fn wrap(&self, stream: ProxyStream, _target: &Address) -> Result<ProxyStream> {
        Ok(Box::new(FragmentStream::new(stream, *self)))
    }
}

pub struct FragmentStream<S> {
    inner: S,
    layer: FragmentLayer,
    pending: Vec<Vec<u8>>,
    current: usize,
    offset: usize,
    /// 已分片的写入次数
    fragmented_writes: u32,
}

impl<S> FragmentStream<S> {
    pub fn new(inner: S, layer: FragmentLayer) -> Self {
        Self {
            inner,
            layer,
            pending: Vec::new(),
            current: 0,
            offset: 0,
            fragmented_writes: 0,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn split(data: &[u8], min_len: usize, max_len: usize) -> Vec<Vec<u8>> {
        let mut rng = rand::thread_rng();
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let size = rng.gen_range(min_len..=max_len).min(data.len() - offset);
            out.push(data[offset..offset + size].to_vec());
            offset += size;
        }
        out
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FragmentStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> FragmentStream<S> {
    fn poll_send_pending(&mut self, cx: &mut Context<'_>, total: usize) -> Poll<io::Result<usize>> {
        while self.current < self.pending.len() {
            let frag = &self.pending[self.current];
            let remaining = &frag[self.offset..];
            match Pin::new(&mut self.inner).poll_write(cx, remaining) {
                Poll::Ready(Ok(0)) => {
                    self.pending.clear();
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    self.offset += n;
                    if self.offset >= frag.len() {
                        self.current += 1;
                        self.offset = 0;
                    }
                }
                Poll::Ready(Err(e)) => {
                    self.pending.clear();
                    return Poll::Ready(Err(e));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        self.pending.clear();
        self.current = 0;
        self.offset = 0;
        Poll::Ready(Ok(total))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FragmentStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // 上一次写入的分片还没发完：调用方会用同一个 buf 重试
        if !self.pending.is_empty() {
            let total: usize = self.pending.iter().map(Vec::len).sum();
            return self.poll_send_pending(cx, total);
        }
        if self.fragmented_writes >= self.layer.packets || buf.is_empty() {
            return Pin::new(&mut self.inner).poll_write(cx, buf);
        }

        self.fragmented_writes += 1;
        self.pending = Self::split(buf, self.layer.min_len, self.layer.max_len);
        self.current = 0;
        self.offset = 0;
        trace!(
            fragments = self.pending.len(),
            bytes = buf.len(),
            write = self.fragmented_writes,
            "fragmenting write"
        );
        self.poll_send_pending(cx, buf.len())
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
