use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use anyhow::Result;
use bytes::{BufMut, BytesMut};

/// 连接目标地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// host 是 IP 字面量时得到 `Ip`，否则得到 `Domain`
    pub fn from_host_port(host: &str, port: u16) -> Self {
        let stripped = host.trim_start_matches('[').trim_end_matches(']');
        match stripped.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            Address::Domain(domain, _) => Some(domain),
            Address::Ip(_) => None,
        }
    }

    /// 编码为 SOCKS5 地址格式 [ATYP][ADDR][PORT]
    pub fn encode_socks5(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(0x01);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(0x04);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Domain(domain, port) => {
                if domain.len() > u8::MAX as usize {
                    anyhow::bail!("domain too long for SOCKS5: {} bytes", domain.len());
                }
                buf.put_u8(0x03);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    /// 从 SOCKS5 地址格式解析
    /// atyp: 0x01=IPv4, 0x03=Domain, 0x04=IPv6
    pub fn from_socks5(atyp: u8, data: &[u8], port: u16) -> Result<Self> {
        match atyp {
            0x01 => {
                if data.len() < 4 {
                    anyhow::bail!("invalid IPv4 address length");
                }
                let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
                Ok(Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            0x03 => {
                let domain = String::from_utf8(data.to_vec())?;
                Ok(Address::Domain(domain, port))
            }
            0x04 => {
                if data.len() < 16 {
                    anyhow::bail!("invalid IPv6 address length");
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[..16]);
                let ip = Ipv6Addr::from(octets);
                Ok(Address::Ip(SocketAddr::new(IpAddr::V6(ip), port)))
            }
            _ => anyhow::bail!("unsupported SOCKS5 address type: 0x{:02x}", atyp),
        }
    }

    /// 系统 DNS 解析为 SocketAddr
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(domain, port) => {
                let addr_str = format!("{}:{}", domain, port);
                let port = *port;
                let resolved = tokio::task::spawn_blocking(move || addr_str.to_socket_addrs())
                    .await??
                    .next()
                    .ok_or_else(|| {
                        anyhow::anyhow!("DNS resolution failed for {}:{}", domain, port)
                    })?;
                Ok(resolved)
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl std::str::FromStr for Address {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Ip(addr));
        }
        if let Some((host, port_str)) = s.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                if !host.is_empty() {
                    return Ok(Address::from_host_port(host, port));
                }
            }
        }
        anyhow::bail!("invalid address: {}", s)
    }
}
