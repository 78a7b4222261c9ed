use std::time::Duration;

use bytes::BytesMut;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::frame::{self, FrameDecoder, MAX_PADDING};
use super::ObfsKey;
use crate::common::ProxyStream;

pub const COVER_MIN: usize = 100;
pub const COVER_MAX: usize = 500;

const PUMP_BUFFER: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct CoverConfig {
    pub interval: Duration,
    pub queue: usize,
}

impl Default for CoverConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            queue: 100,
        }
    }
}

fn cover_chunk() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut chunk = vec![0u8; rng.gen_range(COVER_MIN..=COVER_MAX)];
    rng.fill(chunk.as_mut_slice());
    chunk
}

/// 启动掩护流量任务，返回接收端
///
/// 队列满时跳过本轮；接收端被丢弃或取消时任务结束。
pub fn spawn_cover_task(cfg: CoverConfig, cancel: CancellationToken) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(cfg.queue.max(1));
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + cfg.interval, cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match tx.try_send(cover_chunk()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => trace!("cover queue full, skipping"),
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
            }
        }
        trace!("cover traffic task stopped");
    });
    rx
}

/// 带掩护流量的混淆连接
///
/// 后台任务独占底层连接，调用方拿到 duplex 的另一端读写明文。
/// 上行任务同时等待明文和掩护块，谁先到就编码写出，空闲连接也会按节拍发掩护帧。
pub fn spawn_cover_pump(
    inner: ProxyStream,
    key: ObfsKey,
    padding_min: usize,
    padding_max: usize,
    mut cover: mpsc::Receiver<Vec<u8>>,
) -> DuplexStream {
    let (app, pump) = tokio::io::duplex(PUMP_BUFFER);
    let (mut plain_rd, mut plain_wr) = tokio::io::split(pump);
    let (mut wire_rd, mut wire_wr) = tokio::io::split(inner);

    let up_key = key.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut out = BytesMut::new();
        let mut cover_open = true;
        loop {
            tokio::select! {
                read = plain_rd.read(&mut buf) => {
                    let n = match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    frame::encode(&buf[..n], &up_key, padding_min, padding_max, &mut out);
                }
                chunk = cover.recv(), if cover_open => {
                    let Some(mut chunk) = chunk else {
                        cover_open = false;
                        continue;
                    };
                    chunk.truncate(MAX_PADDING);
                    frame::encode_frame(&[], &chunk, &up_key, &mut out);
                }
            }
            if wire_wr.write_all(&out).await.is_err() || wire_wr.flush().await.is_err() {
                break;
            }
            out.clear();
        }
        let _ = wire_wr.shutdown().await;
        trace!("obfuscation writer stopped");
    });

    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new(&key);
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match wire_rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            decoder.feed(&buf[..n]);
            while let Some(payload) = decoder.next_payload() {
                if plain_wr.write_all(&payload).await.is_err() {
                    return;
                }
            }
        }
        if decoder.buffered() > 0 {
            debug!(buffered = decoder.buffered(), "obfuscated peer closed mid-frame");
        }
        let _ = plain_wr.shutdown().await;
    });

    app
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::obfs::ObfsStream;

    #[tokio::test(start_paused = true)]
    async fn queue_is_bounded_and_never_blocks() {
        let cancel = CancellationToken::new();
        let mut rx = spawn_cover_task(
            CoverConfig {
                interval: Duration::from_millis(10),
                queue: 3,
            },
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut got = 0;
        while let Ok(chunk) = rx.try_recv() {
            assert!((COVER_MIN..=COVER_MAX).contains(&chunk.len()));
            got += 1;
        }
        assert_eq!(got, 3);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_cancel() {
        let cancel = CancellationToken::new();
        let mut rx = spawn_cover_task(CoverConfig::default(), cancel.clone());
        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn pump_relays_both_directions_and_half_closes() {
        let key = ObfsKey::generate();
        let (wire, peer) = tokio::io::duplex(16 * 1024);
        let cancel = CancellationToken::new();
        let rx = spawn_cover_task(
            CoverConfig {
                interval: Duration::from_millis(5),
                queue: 4,
            },
            cancel.clone(),
        );
        let mut app = spawn_cover_pump(Box::new(wire), key.clone(), 0, 8, rx);
        let mut peer = ObfsStream::new(peer, &key, 0, 8);

        app.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");

        peer.write_all(b"world").await.unwrap();
        peer.flush().await.unwrap();
        app.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"world");

        app.shutdown().await.unwrap();
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        cancel.cancel();
    }
}
