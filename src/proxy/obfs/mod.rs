pub mod cover;
pub mod frame;
pub mod stream;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use base64::Engine;
use bytes::BytesMut;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::{ProxyError, ProxyStream};
use crate::config::types::ObfuscationConfig;

pub use cover::{spawn_cover_pump, spawn_cover_task, CoverConfig};
pub use frame::{encode_frame, FrameDecoder};
pub use stream::ObfsStream;

pub const KEY_LEN: usize = 32;

/// 每个引擎一把的混淆密钥
#[derive(Clone)]
pub struct ObfsKey(Arc<[u8]>);

impl ObfsKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(Arc::from(&key[..]))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(ProxyError::Config("obfuscation key must not be empty".into()).into());
        }
        Ok(Self(Arc::from(bytes)))
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ProxyError::Config(format!("invalid obfuscation key: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ObfsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObfsKey({} bytes)", self.0.len())
    }
}

/// 流量混淆器：包装连接，加随机填充并做可逆变换，可选掩护流量
#[derive(Debug, Clone)]
pub struct TrafficObfuscator {
    key: ObfsKey,
    padding_min: usize,
    padding_max: usize,
    cover: Option<CoverConfig>,
}

impl TrafficObfuscator {
    pub fn new(key: ObfsKey, padding_min: usize, padding_max: usize) -> Self {
        let padding_max = padding_max.min(frame::MAX_PADDING);
        Self {
            key,
            padding_min: padding_min.min(padding_max),
            padding_max,
            cover: None,
        }
    }

    pub fn from_config(cfg: &ObfuscationConfig) -> Result<Self> {
        let key = match cfg.key.as_deref().filter(|k| !k.is_empty()) {
            Some(encoded) => ObfsKey::from_base64(encoded)?,
            None => ObfsKey::generate(),
        };
        let mut obfs = Self::new(key, cfg.padding_min, cfg.padding_max);
        if cfg.dummy_traffic {
            obfs = obfs.with_cover_traffic(CoverConfig {
                interval: Duration::from_secs(cfg.dummy_interval_secs.max(1)),
                queue: cfg.dummy_queue,
            });
        }
        Ok(obfs)
    }

    pub fn with_cover_traffic(mut self, cover: CoverConfig) -> Self {
        self.cover = Some(cover);
        self
    }

    pub fn key(&self) -> &ObfsKey {
        &self.key
    }

    pub fn cover_enabled(&self) -> bool {
        self.cover.is_some()
    }

    /// 包装连接；掩护任务挂在 `cancel` 下，连接丢弃后自行退出
    pub fn wrap(&self, stream: ProxyStream, cancel: &CancellationToken) -> ProxyStream {
        match self.cover {
            Some(cover) => {
                let rx = spawn_cover_task(cover, cancel.child_token());
                debug!(interval_ms = cover.interval.as_millis() as u64, "obfuscated stream with cover traffic");
                Box::new(spawn_cover_pump(
                    stream,
                    self.key.clone(),
                    self.padding_min,
                    self.padding_max,
                    rx,
                ))
            }
            None => Box::new(ObfsStream::new(stream, &self.key, self.padding_min, self.padding_max)),
        }
    }

    /// 一次性编码，等价于写入 ObfsStream 的线上字节
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        frame::encode(payload, &self.key, self.padding_min, self.padding_max, &mut out);
        out.to_vec()
    }

    /// `encode` 的逆；不完整的尾帧视为错误
    pub fn decode(&self, wire: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = FrameDecoder::new(&self.key);
        decoder.feed(wire);
        let mut out = Vec::with_capacity(wire.len());
        while let Some(payload) = decoder.next_payload() {
            out.extend_from_slice(&payload);
        }
        if decoder.buffered() > 0 {
            return Err(ProxyError::Protocol("truncated obfuscated frame".into()).into());
        }
        Ok(out)
    }
}
