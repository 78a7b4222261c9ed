use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::blocklist::{DomainList, Whitelist};
use super::cache::DnsCache;
use super::resolver::build_resolver;
use super::{normalize_domain, DnsResolver};
use crate::common::ProxyError;
use crate::config::types::DnsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsAction {
    Allow,
    Block,
}

/// 判定来自哪一步
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictSource {
    Whitelist,
    Blocklist,
    Cache,
    Upstream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsVerdict {
    pub action: DnsAction,
    pub reason: String,
    pub addrs: Vec<IpAddr>,
    pub source: VerdictSource,
}

impl DnsVerdict {
    fn allow(reason: impl Into<String>, addrs: Vec<IpAddr>, source: VerdictSource) -> Self {
        Self {
            action: DnsAction::Allow,
            reason: reason.into(),
            addrs,
            source,
        }
    }

    fn block(list: &str) -> Self {
        Self {
            action: DnsAction::Block,
            reason: list.to_string(),
            addrs: Vec::new(),
            source: VerdictSource::Blocklist,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.action == DnsAction::Block
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DnsStats {
    pub queries: u64,
    pub blocked: u64,
    pub cache_hits: u64,
}

#[derive(Default)]
struct FilterLists {
    whitelist: Whitelist,
    blocklists: Vec<DomainList>,
}

/// DNS 过滤器：白名单 → 黑名单 → 缓存 → 上游
pub struct DnsFilter {
    lists: RwLock<FilterLists>,
    cache: tokio::sync::RwLock<DnsCache>,
    upstreams: Vec<Arc<dyn DnsResolver>>,
    query_timeout: Duration,
    default_ttl: Duration,
    min_ttl: Duration,
    max_ttl: Duration,
    queries: AtomicU64,
    blocked: AtomicU64,
    cache_hits: AtomicU64,
}

impl DnsFilter {
    pub fn new(upstreams: Vec<Arc<dyn DnsResolver>>) -> Self {
        let defaults = DnsConfig::default();
        Self {
            lists: RwLock::new(FilterLists::default()),
            cache: tokio::sync::RwLock::new(DnsCache::new(defaults.cache_size)),
            upstreams,
            query_timeout: Duration::from_secs(defaults.query_timeout_secs),
            default_ttl: Duration::from_secs(defaults.cache_ttl_secs),
            min_ttl: Duration::from_secs(defaults.min_ttl_secs),
            max_ttl: Duration::from_secs(defaults.max_ttl_secs),
            queries: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    pub fn from_config(cfg: &DnsConfig) -> Result<Self> {
        let timeout = Duration::from_secs(cfg.query_timeout_secs);
        let upstreams = cfg
            .servers
            .iter()
            .map(|s| build_resolver(s, timeout))
            .collect::<Result<Vec<_>>>()?;
        let (whitelist, blocklists) = build_lists(cfg)?;

        let filter = Self::new(upstreams)
            .with_cache_size(cfg.cache_size)
            .with_query_timeout(timeout)
            .with_ttl(
                Duration::from_secs(cfg.cache_ttl_secs),
                Duration::from_secs(cfg.min_ttl_secs),
                Duration::from_secs(cfg.max_ttl_secs),
            );
        filter.reload(whitelist, blocklists);
        info!(
            upstreams = filter.upstreams.len(),
            cache_size = cfg.cache_size,
            "DNS filter initialized"
        );
        Ok(filter)
    }

    pub fn with_cache_size(mut self, max_entries: usize) -> Self {
        self.cache = tokio::sync::RwLock::new(DnsCache::new(max_entries));
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// 设置默认 TTL 及上游 TTL 的截断区间
    pub fn with_ttl(mut self, default: Duration, min: Duration, max: Duration) -> Self {
        self.default_ttl = default;
        self.min_ttl = min;
        self.max_ttl = max.max(min);
        self
    }

    fn lists(&self) -> RwLockReadGuard<'_, FilterLists> {
        self.lists.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lists_mut(&self) -> RwLockWriteGuard<'_, FilterLists> {
        self.lists.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 整体替换白名单和黑名单
    pub fn reload(&self, whitelist: Whitelist, blocklists: Vec<DomainList>) {
        let mut lists = self.lists_mut();
        info!(
            whitelist = whitelist.len(),
            blocklists = blocklists.len(),
            "DNS filter lists reloaded"
        );
        *lists = FilterLists {
            whitelist,
            blocklists,
        };
    }

    /// 重新读取配置中的名单文件；读取失败时保留旧名单
    pub fn reload_from_config(&self, cfg: &DnsConfig) -> Result<()> {
        let (whitelist, blocklists) = build_lists(cfg)?;
        self.reload(whitelist, blocklists);
        Ok(())
    }

    /// 添加黑名单；同名的旧名单被替换
    pub fn add_blocklist(&self, list: DomainList) {
        let mut lists = self.lists_mut();
        lists.blocklists.retain(|l| l.name != list.name);
        lists.blocklists.push(list);
    }

    pub fn add_whitelist_domain(&self, domain: &str) {
        self.lists_mut().whitelist.insert(domain);
    }

    /// 只查名单，不解析
    pub fn check(&self, domain: &str) -> Option<DnsVerdict> {
        self.check_lists(&normalize_domain(domain))
    }

    fn check_lists(&self, domain: &str) -> Option<DnsVerdict> {
        let lists = self.lists();
        if lists.whitelist.contains(domain) {
            return Some(DnsVerdict::allow("whitelisted", Vec::new(), VerdictSource::Whitelist));
        }
        lists
            .blocklists
            .iter()
            .filter(|l| l.enabled)
            .find(|l| l.matches(domain))
            .map(|l| DnsVerdict::block(&l.name))
    }

    pub async fn resolve(&self, domain: &str) -> Result<DnsVerdict> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let verdict = self.filter_domain(domain, true).await?;
        if verdict.is_blocked() {
            self.blocked.fetch_add(1, Ordering::Relaxed);
        }
        Ok(verdict)
    }

    /// 名单 → 缓存 → 上游；`count` 为 false 时不计入统计
    async fn filter_domain(&self, domain: &str, count: bool) -> Result<DnsVerdict> {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return Err(ProxyError::DnsResolutionFailed("empty domain".into()).into());
        }

        if let Some(verdict) = self.check_lists(&domain) {
            if verdict.is_blocked() {
                info!(domain = %domain, list = %verdict.reason, "DNS query blocked");
            } else {
                debug!(domain = %domain, "DNS query whitelisted");
            }
            return Ok(verdict);
        }

        self.lookup_addrs(&domain, count).await
    }

    /// 缓存 → 上游，不经过名单
    async fn lookup_addrs(&self, domain: &str, count: bool) -> Result<DnsVerdict> {
        if let Some(addrs) = self.cache.read().await.get(domain) {
            if count {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
            debug!(domain = domain, "DNS cache hit");
            return Ok(DnsVerdict::allow("cached", addrs, VerdictSource::Cache));
        }

        for upstream in &self.upstreams {
            match tokio::time::timeout(self.query_timeout, upstream.lookup(domain)).await {
                Ok(Ok(lookup)) if !lookup.addrs.is_empty() => {
                    let ttl = lookup
                        .ttl
                        .unwrap_or(self.default_ttl)
                        .max(self.min_ttl)
                        .min(self.max_ttl);
                    self.cache
                        .write()
                        .await
                        .insert(domain, lookup.addrs.clone(), ttl);
                    debug!(
                        domain = domain,
                        upstream = upstream.name(),
                        count = lookup.addrs.len(),
                        ttl = ?ttl,
                        "DNS resolved"
                    );
                    return Ok(DnsVerdict::allow(
                        format!("resolved via {}", upstream.name()),
                        lookup.addrs,
                        VerdictSource::Upstream,
                    ));
                }
                Ok(Ok(_)) => {
                    warn!(domain = domain, upstream = upstream.name(), "DNS upstream returned no addresses");
                }
                Ok(Err(e)) => {
                    warn!(domain = domain, upstream = upstream.name(), error = %e, "DNS upstream failed");
                }
                Err(_) => {
                    warn!(domain = domain, upstream = upstream.name(), "DNS upstream timed out");
                }
            }
        }

        Err(ProxyError::DnsResolutionFailed(format!("{}: all upstreams failed", domain)).into())
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn purge_expired(&self) -> usize {
        self.cache.write().await.purge_expired()
    }

    pub fn upstream_count(&self) -> usize {
        self.upstreams.len()
    }

    pub fn stats(&self) -> DnsStats {
        DnsStats {
            queries: self.queries.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// 周期清理过期缓存，直到取消
    pub async fn run_purger(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.purge_expired().await;
                    if removed > 0 {
                        debug!(removed, "DNS cache purge");
                    }
                }
            }
        }
    }
}

/// 作为拨号器的解析器：被拦截的域名解析失败，白名单域名直接查上游
///
/// 流水线已经对同一域名调用过 `DnsFilter::resolve`，这里不再计数。
#[async_trait]
impl DnsResolver for DnsFilter {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let verdict = self.filter_domain(host, false).await?;
        if verdict.is_blocked() {
            return Err(ProxyError::DnsResolutionFailed(format!(
                "{} blocked by {}",
                host, verdict.reason
            ))
            .into());
        }
        if verdict.addrs.is_empty() {
            return Ok(self.lookup_addrs(&normalize_domain(host), false).await?.addrs);
        }
        Ok(verdict.addrs)
    }

    fn name(&self) -> &str {
        "filter"
    }
}

fn build_lists(cfg: &DnsConfig) -> Result<(Whitelist, Vec<DomainList>)> {
    let whitelist = Whitelist::new(&cfg.whitelist);
    let blocklists = cfg
        .blocklists
        .iter()
        .map(DomainList::from_config)
        .collect::<Result<Vec<_>>>()?;
    Ok((whitelist, blocklists))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dns::Lookup;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    /// 固定应答的解析器，记录调用次数
    pub(crate) struct StaticResolver {
        pub answers: HashMap<String, Vec<IpAddr>>,
        pub ttl: Option<Duration>,
        pub calls: AtomicUsize,
    }

    impl StaticResolver {
        pub(crate) fn new(pairs: &[(&str, &str)]) -> Self {
            Self {
                answers: pairs
                    .iter()
                    .map(|(d, ip)| (d.to_string(), vec![ip.parse().unwrap()]))
                    .collect(),
                ttl: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DnsResolver for StaticResolver {
        async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
            Ok(self.lookup(host).await?.addrs)
        }

        async fn lookup(&self, host: &str) -> Result<Lookup> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answers.get(host) {
                Some(addrs) => Ok(Lookup {
                    addrs: addrs.clone(),
                    ttl: self.ttl,
                }),
                None => anyhow::bail!("NXDOMAIN {}", host),
            }
        }

        fn name(&self) -> &str {
            "static"
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl DnsResolver for FailingResolver {
        async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>> {
            anyhow::bail!("server failure")
        }
    }

    struct HangingResolver;

    #[async_trait]
    impl DnsResolver for HangingResolver {
        async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>> {
            std::future::pending().await
        }
    }

    fn ads_list() -> DomainList {
        let mut list = DomainList::new("ads");
        list.insert_domain("ads.example.com");
        list.add_pattern(r"^track\.").unwrap();
        list
    }

    #[tokio::test]
    async fn whitelist_overrides_blocklist() {
        let filter = DnsFilter::new(vec![]);
        filter.add_blocklist(ads_list());
        filter.add_whitelist_domain("example.com");
        let v = filter.resolve("ads.example.com").await.unwrap();
        assert_eq!(v.action, DnsAction::Allow);
        assert_eq!(v.source, VerdictSource::Whitelist);
        assert!(v.addrs.is_empty());
        assert_eq!(filter.stats().blocked, 0);
    }

    #[tokio::test]
    async fn blocklist_names_reason() {
        let filter = DnsFilter::new(vec![]);
        filter.add_blocklist(ads_list());
        let v = filter.resolve("TRACK.site.org.").await.unwrap();
        assert!(v.is_blocked());
        assert_eq!(v.reason, "ads");
        assert_eq!(filter.stats().blocked, 1);
    }

    #[tokio::test]
    async fn disabled_blocklist_ignored() {
        let mut list = ads_list();
        list.enabled = false;
        let upstream = Arc::new(StaticResolver::new(&[("ads.example.com", "10.0.0.1")]));
        let filter = DnsFilter::new(vec![upstream as Arc<dyn DnsResolver>]);
        filter.add_blocklist(list);
        assert_eq!(
            filter.resolve("ads.example.com").await.unwrap().action,
            DnsAction::Allow
        );
    }

    #[tokio::test]
    async fn caches_upstream_answers() {
        let upstream = Arc::new(StaticResolver::new(&[("a.com", "1.2.3.4")]));
        let filter = DnsFilter::new(vec![upstream.clone() as Arc<dyn DnsResolver>]);

        let first = filter.resolve("a.com").await.unwrap();
        assert_eq!(first.source, VerdictSource::Upstream);
        let second = filter.resolve("a.com").await.unwrap();
        assert_eq!(second.source, VerdictSource::Cache);
        assert_eq!(second.addrs, first.addrs);

        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        let stats = filter.stats();
        assert_eq!(stats.queries, 2);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(filter.cache_len().await, 1);
    }

    #[tokio::test]
    async fn dialer_lookups_are_not_counted() {
        let upstream = Arc::new(StaticResolver::new(&[("a.com", "1.2.3.4")]));
        let filter = DnsFilter::new(vec![upstream as Arc<dyn DnsResolver>]);
        filter.add_blocklist(ads_list());

        filter.resolve("a.com").await.unwrap();
        let as_resolver: &dyn DnsResolver = &filter;
        let addrs = as_resolver.resolve("a.com").await.unwrap();
        assert_eq!(addrs, vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
        assert!(as_resolver.resolve("ads.example.com").await.is_err());

        let stats = filter.stats();
        assert_eq!(stats.queries, 1);
        assert_eq!(stats.cache_hits, 0);
        assert_eq!(stats.blocked, 0);
    }

    #[tokio::test]
    async fn falls_through_failing_upstreams() {
        let good = Arc::new(StaticResolver::new(&[("a.com", "1.2.3.4")]));
        let upstreams: Vec<Arc<dyn DnsResolver>> =
            vec![Arc::new(FailingResolver), Arc::new(HangingResolver), good];
        let filter = DnsFilter::new(upstreams).with_query_timeout(Duration::from_millis(20));
        let v = filter.resolve("a.com").await.unwrap();
        assert_eq!(v.addrs, vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn all_upstreams_failing_is_error() {
        let filter = DnsFilter::new(vec![Arc::new(FailingResolver) as Arc<dyn DnsResolver>]);
        let err = filter.resolve("a.com").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProxyError>(),
            Some(ProxyError::DnsResolutionFailed(_))
        ));
        assert!(DnsFilter::new(vec![]).resolve("a.com").await.is_err());
    }

    #[tokio::test]
    async fn upstream_ttl_is_clamped() {
        let mut upstream = StaticResolver::new(&[("a.com", "1.2.3.4")]);
        upstream.ttl = Some(Duration::ZERO);
        let filter = DnsFilter::new(vec![Arc::new(upstream) as Arc<dyn DnsResolver>]).with_ttl(
            Duration::from_secs(300),
            Duration::from_secs(60),
            Duration::from_secs(600),
        );
        filter.resolve("a.com").await.unwrap();
        let ttl = filter.cache.read().await.entry("a.com").unwrap().ttl;
        assert_eq!(ttl, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn reload_swaps_lists() {
        let filter = DnsFilter::new(vec![]);
        filter.add_blocklist(ads_list());
        assert!(filter.check("ads.example.com").is_some());

        let mut fresh = DomainList::new("fresh");
        fresh.insert_domain("new.bad");
        filter.reload(Whitelist::default(), vec![fresh]);
        assert!(filter.check("ads.example.com").is_none());
        assert_eq!(filter.check("new.bad").unwrap().reason, "fresh");
    }

    #[tokio::test]
    async fn resolver_impl_rejects_blocked_and_resolves_whitelisted() {
        let upstream = Arc::new(StaticResolver::new(&[("ok.example.com", "5.6.7.8")]));
        let filter = DnsFilter::new(vec![upstream as Arc<dyn DnsResolver>]);
        filter.add_blocklist(ads_list());
        filter.add_whitelist_domain("ok.example.com");

        assert!(DnsResolver::resolve(&filter, "ads.example.com").await.is_err());
        let addrs = DnsResolver::resolve(&filter, "ok.example.com").await.unwrap();
        assert_eq!(addrs, vec!["5.6.7.8".parse::<IpAddr>().unwrap()]);
    }
}
