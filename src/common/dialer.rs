//! TCP dialer shared by the connector, the health monitor and the pipeline.
//!
//! Every dial carries an explicit deadline; a dial that exceeds it drops the
//! half-open socket and reports `ProxyError::ConnectionTimeout`.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::debug;

use crate::common::{Address, ProxyError};
use crate::dns::DnsResolver;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Socket options applied to every outbound dial.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Bind to a specific source IP address.
    #[serde(rename = "bind-address")]
    pub bind_address: Option<String>,

    /// Connect timeout in milliseconds. Default: 30000.
    #[serde(rename = "connect-timeout")]
    pub connect_timeout_ms: Option<u64>,

    /// TCP keep-alive interval in seconds. 0 = disabled.
    #[serde(rename = "tcp-keep-alive")]
    pub tcp_keep_alive_secs: Option<u64>,
}

impl DialerConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            connect_timeout_ms: Some(timeout.as_millis() as u64),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS))
    }
}

pub struct Dialer {
    config: DialerConfig,
    resolver: Option<Arc<dyn DnsResolver>>,
}

impl Dialer {
    pub fn new(config: DialerConfig) -> Self {
        Self {
            config,
            resolver: None,
        }
    }

    /// Create a dialer that resolves domains through `resolver` instead of system DNS.
    pub fn with_resolver(config: DialerConfig, resolver: Arc<dyn DnsResolver>) -> Self {
        Self {
            config,
            resolver: Some(resolver),
        }
    }

    pub fn default_dialer() -> Self {
        Self::new(DialerConfig::default())
    }

    pub fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout()
    }

    /// Connect to the given socket address, applying the configured socket options.
    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        let timeout = self.config.connect_timeout();

        let stream = tokio::time::timeout(timeout, self.connect_inner(addr))
            .await
            .map_err(|_| {
                ProxyError::ConnectionTimeout(format!("{} after {:?}", addr, timeout))
            })??;

        self.apply_post_connect(&stream)?;
        debug!(addr = %addr, "dialer connected");
        Ok(stream)
    }

    /// Connect to an `Address`, resolving domains first.
    pub async fn connect_addr(&self, addr: &Address) -> Result<TcpStream> {
        match addr {
            Address::Ip(sa) => self.connect(*sa).await,
            Address::Domain(host, port) => {
                let sa = self.resolve_host(host, *port).await?;
                self.connect(sa).await
            }
        }
    }

    async fn resolve_host(&self, host: &str, port: u16) -> Result<SocketAddr> {
        match &self.resolver {
            Some(resolver) => {
                let ips = resolver.resolve(host).await?;
                let ip = ips.into_iter().next().ok_or_else(|| {
                    ProxyError::DnsResolutionFailed(format!("no addresses for {}", host))
                })?;
                Ok(SocketAddr::new(ip, port))
            }
            None => Address::Domain(host.to_string(), port).resolve().await,
        }
    }

    async fn connect_inner(&self, addr: SocketAddr) -> Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            tokio::net::TcpSocket::new_v4()?
        } else {
            tokio::net::TcpSocket::new_v6()?
        };

        if let Some(ref bind_addr) = self.config.bind_address {
            let ip: IpAddr = bind_addr
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid bind address '{}': {}", bind_addr, e))?;
            socket.bind(SocketAddr::new(ip, 0))?;
        }

        let stream = socket.connect(addr).await?;
        Ok(stream)
    }

    fn apply_post_connect(&self, stream: &TcpStream) -> Result<()> {
        if let Some(interval) = self.config.tcp_keep_alive_secs {
            if interval > 0 {
                let sock_ref = socket2::SockRef::from(stream);
                let keepalive =
                    socket2::TcpKeepalive::new().with_time(Duration::from_secs(interval));
                sock_ref.set_tcp_keepalive(&keepalive)?;
            }
        }

        // 代理流量一律关闭 Nagle
        stream.set_nodelay(true)?;
        Ok(())
    }
}
