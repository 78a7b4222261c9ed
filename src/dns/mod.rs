pub mod blocklist;
pub mod cache;
pub mod filter;
pub mod resolver;

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use blocklist::{DomainList, Whitelist};
pub use cache::DnsCache;
pub use filter::{DnsAction, DnsFilter, DnsVerdict, VerdictSource};
pub use resolver::{build_resolver, HickoryResolver, SystemResolver};

/// 一次上游查询的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub addrs: Vec<IpAddr>,
    /// 上游给出的 TTL；None 表示由调用方决定
    pub ttl: Option<Duration>,
}

/// DNS 解析器 trait
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// 将域名解析为 IP 地址列表
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;

    /// 带 TTL 的解析，默认实现不提供 TTL
    async fn lookup(&self, host: &str) -> Result<Lookup> {
        Ok(Lookup {
            addrs: self.resolve(host).await?,
            ttl: None,
        })
    }

    fn name(&self) -> &str {
        "resolver"
    }
}

/// 域名规范化：小写、去掉结尾的点
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}
