pub mod fragment;
pub mod tls;
pub mod ws;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::common::{Address, ProxyError, ProxyStream};
use crate::config::types::{DpiConfig, TunnelConfig};

pub use fragment::{FragmentLayer, FragmentStream};
pub use tls::TlsLayer;
pub use ws::{WsLayer, WsStream};

const DEFAULT_LAYER_TIMEOUT: Duration = Duration::from_secs(10);

/// 隧道层：消费下层连接，返回一个读写语义相同的新连接
#[async_trait]
pub trait TunnelLayer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn wrap(&self, stream: ProxyStream, target: &Address) -> Result<ProxyStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Tls,
    WebSocket,
    Fragment,
}

impl LayerKind {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tls" => Some(LayerKind::Tls),
            "websocket" | "ws" => Some(LayerKind::WebSocket),
            "fragment" => Some(LayerKind::Fragment),
            _ => None,
        }
    }
}

/// 按顺序叠加的隧道层
pub struct TunnelStack {
    layers: Vec<Box<dyn TunnelLayer>>,
    layer_timeout: Duration,
}

impl TunnelStack {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            layer_timeout: DEFAULT_LAYER_TIMEOUT,
        }
    }

    /// `tunneling` 关闭时只保留 DPI 分片层（如启用）
    pub fn from_config(
        tunnel: &TunnelConfig,
        dpi: Option<&DpiConfig>,
        tunneling: bool,
    ) -> Result<Self> {
        let mut stack = Self::new();
        if let Some(dpi) = dpi.filter(|d| d.fragmentation) {
            stack.push(FragmentLayer::from_config(dpi));
        }
        if tunneling {
            for name in &tunnel.protocols {
                match LayerKind::from_str_opt(name) {
                    Some(LayerKind::Tls) => stack.push(TlsLayer::from_config(&tunnel.tls)?),
                    Some(LayerKind::WebSocket) => stack.push(WsLayer::from_config(&tunnel.websocket)),
                    Some(LayerKind::Fragment) => match dpi {
                        Some(dpi) => stack.push(FragmentLayer::from_config(dpi)),
                        None => stack.push(FragmentLayer::new(1, 64, 3)),
                    },
                    None => {
                        return Err(ProxyError::Config(format!("unknown tunnel protocol '{}'", name)).into())
                    }
                }
            }
        }
        debug!(layers = ?stack.names(), "tunnel stack built");
        Ok(stack)
    }

    pub fn push(&mut self, layer: impl TunnelLayer + 'static) {
        self.layers.push(Box::new(layer));
    }

    pub fn with_layer_timeout(mut self, timeout: Duration) -> Self {
        self.layer_timeout = timeout;
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// 逐层包装；任一层失败时已包装的连接随之丢弃，错误中带出失败层名
    pub async fn wrap(&self, stream: ProxyStream, target: &Address) -> Result<ProxyStream> {
        let mut current = stream;
        for layer in &self.layers {
            current = match tokio::time::timeout(self.layer_timeout, layer.wrap(current, target)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => return Err(ProxyError::tunnel(layer.name(), format!("{:#}", e)).into()),
                Err(_) => {
                    return Err(ProxyError::tunnel(
                        layer.name(),
                        format!("timed out after {:?}", self.layer_timeout),
                    )
                    .into())
                }
            };
            debug!(layer = layer.name(), target = %target, "tunnel layer applied");
        }
        Ok(current)
    }
}

impl Default for TunnelStack {
    fn default() -> Self {
        Self::new()
    }
}
