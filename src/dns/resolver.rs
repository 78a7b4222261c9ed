use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use hickory_resolver::config::{
    NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts,
};
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, info};

use super::{DnsResolver, Lookup};

/// 系统 DNS 解析器（使用 tokio::net::lookup_host）
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let mut addrs: Vec<IpAddr> = tokio::net::lookup_host(format!("{}:0", host))
            .await?
            .map(|a| a.ip())
            .collect();
        addrs.dedup();
        if addrs.is_empty() {
            anyhow::bail!("DNS resolution failed: no addresses for {}", host);
        }
        debug!(host = host, count = addrs.len(), "system DNS resolved");
        Ok(addrs)
    }

    fn name(&self) -> &str {
        "system"
    }
}

/// 基于 hickory-resolver 的 DNS 解析器
pub struct HickoryResolver {
    resolver: TokioAsyncResolver,
    address: String,
}

impl HickoryResolver {
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let (config, mut opts) = parse_dns_address(address)?;
        opts.timeout = timeout;
        opts.attempts = 1;
        let resolver = TokioAsyncResolver::tokio(config, opts);
        info!(address = address, "hickory DNS resolver created");
        Ok(Self {
            resolver,
            address: address.to_string(),
        })
    }
}

#[async_trait]
impl DnsResolver for HickoryResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        Ok(self.lookup(host).await?.addrs)
    }

    async fn lookup(&self, host: &str) -> Result<Lookup> {
        let response = self.resolver.lookup_ip(host).await?;
        let addrs: Vec<IpAddr> = response.iter().collect();
        if addrs.is_empty() {
            anyhow::bail!("DNS resolution failed: no addresses for {}", host);
        }
        let ttl = response
            .valid_until()
            .checked_duration_since(Instant::now())
            .unwrap_or_default();
        debug!(host = host, count = addrs.len(), ttl = ?ttl, "hickory DNS resolved");
        Ok(Lookup {
            addrs,
            ttl: Some(ttl),
        })
    }

    fn name(&self) -> &str {
        &self.address
    }
}

/// 按地址字符串构造上游解析器：`system`、`8.8.8.8`、`udp://`、`tcp://`、`tls://ip[@name]`
pub fn build_resolver(address: &str, timeout: Duration) -> Result<Arc<dyn DnsResolver>> {
    if address == "system" {
        return Ok(Arc::new(SystemResolver));
    }
    Ok(Arc::new(HickoryResolver::new(address, timeout)?))
}

fn parse_dns_address(address: &str) -> Result<(ResolverConfig, ResolverOpts)> {
    let mut opts = ResolverOpts::default();
    opts.use_hosts_file = false;

    let single = |socket_addr: SocketAddr, protocol: Protocol, tls_dns_name: Option<String>| {
        let ns = NameServerConfig {
            socket_addr,
            protocol,
            tls_dns_name,
            trust_negative_responses: true,
            tls_config: None,
            bind_addr: None,
        };
        ResolverConfig::from_parts(None, vec![], NameServerConfigGroup::from(vec![ns]))
    };

    if let Some(tls_addr) = address.strip_prefix("tls://") {
        // tls://1.1.1.1@cloudflare-dns.com，@ 后为证书校验用的名字
        let (addr_part, name) = match tls_addr.split_once('@') {
            Some((a, n)) => (a, Some(n.to_string())),
            None => (tls_addr, None),
        };
        let (ip, port) = parse_ip_port(addr_part, 853)?;
        let name = name.unwrap_or_else(|| ip.to_string());
        Ok((single(SocketAddr::new(ip, port), Protocol::Tls, Some(name)), opts))
    } else if let Some(tcp_addr) = address.strip_prefix("tcp://") {
        let (ip, port) = parse_ip_port(tcp_addr, 53)?;
        Ok((single(SocketAddr::new(ip, port), Protocol::Tcp, None), opts))
    } else {
        let udp_addr = address.strip_prefix("udp://").unwrap_or(address);
        let (ip, port) = parse_ip_port(udp_addr, 53)?;
        Ok((single(SocketAddr::new(ip, port), Protocol::Udp, None), opts))
    }
}

/// 解析 "ip" 或 "ip:port" 或 "[ipv6]" 或 "[ipv6]:port" 格式
fn parse_ip_port(s: &str, default_port: u16) -> Result<(IpAddr, u16)> {
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok((ip, default_port));
    }
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok((addr.ip(), addr.port()));
    }
    let stripped = s.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = stripped.parse::<IpAddr>() {
        return Ok((ip, default_port));
    }
    anyhow::bail!("invalid DNS address: {}", s)
}
