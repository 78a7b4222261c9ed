use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::{Address, Dialer, ProxyStream};
use crate::config::Config;
use crate::proxy::group::UpstreamEndpoint;
use crate::proxy::obfs::TrafficObfuscator;
use crate::proxy::outbound::{
    DirectOutbound, HttpOutbound, OutboundHandler, Socks5Outbound, UpstreamKind,
    DEFAULT_HANDSHAKE_TIMEOUT,
};
use crate::proxy::transport::TunnelStack;

/// 隐匿连接器：直连或经上游握手，然后叠加隧道层与混淆
pub struct StealthConnector {
    dialer: Arc<Dialer>,
    handshake_timeout: Duration,
    tunnel: TunnelStack,
    obfuscator: Option<TrafficObfuscator>,
    cancel: CancellationToken,
}

impl StealthConnector {
    pub fn new(dialer: Arc<Dialer>) -> Self {
        Self {
            dialer,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tunnel: TunnelStack::new(),
            obfuscator: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(cfg: &Config, dialer: Arc<Dialer>, cancel: CancellationToken) -> Result<Self> {
        let features = &cfg.features;
        let dpi = features.dpi_evasion.then_some(&cfg.dpi);
        let tunnel = TunnelStack::from_config(&cfg.tunnel, dpi, features.tunneling)?
            .with_layer_timeout(cfg.timeouts.handshake());
        let mut connector = Self::new(dialer)
            .with_handshake_timeout(cfg.timeouts.handshake())
            .with_tunnel(tunnel)
            .with_cancel(cancel);
        if features.obfuscation {
            connector = connector.with_obfuscator(TrafficObfuscator::from_config(&cfg.obfuscation)?);
        }
        Ok(connector)
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_tunnel(mut self, tunnel: TunnelStack) -> Self {
        self.tunnel = tunnel;
        self
    }

    pub fn with_obfuscator(mut self, obfuscator: TrafficObfuscator) -> Self {
        self.obfuscator = Some(obfuscator);
        self
    }

    /// 掩护流量任务挂在这个 token 下
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn tunnel(&self) -> &TunnelStack {
        &self.tunnel
    }

    pub fn is_tunneled(&self) -> bool {
        !self.tunnel.is_empty()
    }

    pub fn is_obfuscated(&self) -> bool {
        self.obfuscator.is_some()
    }

    fn outbound_for(&self, upstream: Option<&UpstreamEndpoint>) -> Box<dyn OutboundHandler> {
        let dialer = self.dialer.clone();
        match upstream {
            None => Box::new(DirectOutbound::new(dialer)),
            Some(ep) => match ep.kind {
                UpstreamKind::Http => Box::new(
                    HttpOutbound::new(ep.server(), ep.credentials.clone(), dialer)
                        .with_handshake_timeout(self.handshake_timeout),
                ),
                UpstreamKind::Socks5 => Box::new(
                    Socks5Outbound::new(ep.server(), ep.credentials.clone(), dialer)
                        .with_handshake_timeout(self.handshake_timeout),
                ),
            },
        }
    }

    /// 建立到 `target` 的连接；任何一步失败都会丢弃已建立的部分连接
    pub async fn connect(&self, target: &Address, upstream: Option<&UpstreamEndpoint>) -> Result<ProxyStream> {
        let outbound = self.outbound_for(upstream);
        let stream = outbound.connect(target).await?;
        let stream = self.tunnel.wrap(stream, target).await?;
        let stream = match &self.obfuscator {
            Some(obfs) => obfs.wrap(stream, &self.cancel),
            None => stream,
        };
        debug!(
            target = %target,
            via = upstream.map_or("direct", |u| u.name.as_str()),
            outbound = outbound.kind(),
            layers = ?self.tunnel.names(),
            obfuscated = self.obfuscator.is_some(),
            "stealth connection ready"
        );
        Ok(stream)
    }
}
