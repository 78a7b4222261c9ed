use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::frame::{self, FrameDecoder};
use super::ObfsKey;

const READ_CHUNK: usize = 16 * 1024;

/// 对称混淆流：写入时分帧、填充、异或；读取时逆向还原
///
/// 写路径像 BufWriter：上一批编码数据写完之前不接受新数据。
pub struct ObfsStream<S> {
    inner: S,
    key: ObfsKey,
    padding_min: usize,
    padding_max: usize,
    decoder: FrameDecoder,
    ready: Bytes,
    write_buf: BytesMut,
}

impl<S> ObfsStream<S> {
    pub fn new(inner: S, key: &ObfsKey, padding_min: usize, padding_max: usize) -> Self {
        Self {
            inner,
            key: key.clone(),
            padding_min,
            padding_max,
            decoder: FrameDecoder::new(key),
            ready: Bytes::new(),
            write_buf: BytesMut::new(),
        }
    }
}

impl<S: AsyncWrite + Unpin> ObfsStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.write_buf) {
                Poll::Ready(Ok(0)) => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                Poll::Ready(Ok(n)) => self.write_buf.advance(n),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ObfsStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.ready.is_empty() {
                let n = self.ready.len().min(buf.remaining());
                let chunk = self.ready.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            if let Some(payload) = self.decoder.next_payload() {
                self.ready = payload;
                continue;
            }

            let mut raw = [0u8; READ_CHUNK];
            let mut raw_buf = ReadBuf::new(&mut raw);
            match Pin::new(&mut self.inner).poll_read(cx, &mut raw_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = raw_buf.filled();
                    if filled.is_empty() {
                        if self.decoder.buffered() > 0 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "truncated obfuscated frame",
                            )));
                        }
                        return Poll::Ready(Ok(()));
                    }
                    self.decoder.feed(filled);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ObfsStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other.map(|r| r.map(|_| 0)),
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        frame::encode(buf, &this.key, this.padding_min, this.padding_max, &mut this.write_buf);

        // 数据已进入缓冲；没写完的部分由下一次 write / flush 继续
        match this.poll_drain(cx) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            _ => Poll::Ready(Ok(buf.len())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn key() -> ObfsKey {
        ObfsKey::from_bytes(b"an obfuscation key of some bytes").unwrap()
    }

    #[tokio::test]
    async fn both_ends_see_plaintext() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = ObfsStream::new(a, &key(), 0, 64);
        let mut server = ObfsStream::new(b, &key(), 8, 32);

        let msg = vec![0x42u8; 10_000];
        let expected = msg.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&msg).await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn wire_bytes_are_not_plaintext() {
        let (a, mut raw) = tokio::io::duplex(4096);
        let mut client = ObfsStream::new(a, &key(), 0, 0);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        client.flush().await.unwrap();

        let mut wire = vec![0u8; 4 + 16];
        raw.read_exact(&mut wire).await.unwrap();
        assert!(!wire.windows(3).any(|w| w == b"GET"));
    }

    #[tokio::test]
    async fn cover_frames_are_invisible_to_reader() {
        let key = key();
        let (mut raw, b) = tokio::io::duplex(8192);
        let mut server = ObfsStream::new(b, &key, 0, 16);

        let mut wire = BytesMut::new();
        frame::encode_frame(&[], &[7u8; 300], &key, &mut wire);
        frame::encode(b"real", &key, 0, 16, &mut wire);
        frame::encode_frame(&[], &[8u8; 120], &key, &mut wire);
        raw.write_all(&wire).await.unwrap();
        drop(raw);

        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"real");
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut raw, b) = tokio::io::duplex(64);
        let mut server = ObfsStream::new(b, &key(), 0, 0);
        raw.write_all(&[1, 2, 3]).await.unwrap();
        drop(raw);

        let mut got = Vec::new();
        let err = server.read_to_end(&mut got).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
