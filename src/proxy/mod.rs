pub mod connector;
pub mod dpi;
pub mod group;
pub mod obfs;
pub mod outbound;
pub mod relay;
pub mod sniff;
pub mod transport;

use std::fmt;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::common::Address;

/// 流量单元的协议分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Dns,
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Dns => "dns",
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次待判定的流量：一个连接、一个 DNS 查询或一个被截获的包
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficUnit {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub source_ip: Option<IpAddr>,
    #[serde(default)]
    pub source_port: u16,
    #[serde(default)]
    pub dest_ip: Option<IpAddr>,
    pub dest_port: u16,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub payload: Option<Vec<u8>>,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub process_name: Option<String>,
    #[serde(default = "now_millis")]
    pub timestamp_ms: u64,
}

impl TrafficUnit {
    pub fn new(protocol: Protocol, dest_port: u16) -> Self {
        Self {
            protocol,
            dest_port,
            timestamp_ms: now_millis(),
            ..Default::default()
        }
    }

    pub fn with_dest_ip(mut self, ip: IpAddr) -> Self {
        self.dest_ip = Some(ip);
        self
    }

    pub fn with_source(mut self, ip: IpAddr, port: u16) -> Self {
        self.source_ip = Some(ip);
        self.source_port = port;
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_process(mut self, pid: u32, name: impl Into<String>) -> Self {
        self.process_id = Some(pid);
        self.process_name = Some(name.into());
        self
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }

    /// 连接目标：有域名用域名，否则用目的 IP
    ///
    /// DNS 查询的域名是被查询的名字而不是服务器，优先发往目的 IP。
    pub fn target(&self) -> Option<Address> {
        let ip_target = self
            .dest_ip
            .map(|ip| Address::Ip(std::net::SocketAddr::new(ip, self.dest_port)));
        if self.protocol == Protocol::Dns && ip_target.is_some() {
            return ip_target;
        }
        if let Some(domain) = self.domain.as_deref().filter(|d| !d.is_empty()) {
            return Some(Address::from_host_port(domain, self.dest_port));
        }
        ip_target
    }
}

impl fmt::Display for TrafficUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dest = match (&self.domain, &self.dest_ip) {
            (Some(d), _) => d.clone(),
            (None, Some(ip)) => ip.to_string(),
            (None, None) => "-".to_string(),
        };
        write!(f, "{} {}:{}", self.protocol, dest, self.dest_port)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
