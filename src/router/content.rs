//! HTTP/HTTPS 内容过滤：URL 黑名单 + 分类（域名、关键字、正则）
//!
//! 只看 80/443 端口或已识别为 HTTP/HTTPS 的单元。HTTPS 只能拿到 SNI，
//! URL 形如 `https://host/`。

use std::collections::HashSet;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::types::{CategoryConfig, ContentFilterConfig};
use crate::proxy::sniff::parse_http_target;
use crate::proxy::{Protocol, TrafficUnit};

use super::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryAction {
    Block,
    Warn,
    Log,
}

impl CategoryAction {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Some(Self::Block),
            "warn" => Some(Self::Warn),
            "log" => Some(Self::Log),
            _ => None,
        }
    }
}

/// 从流量单元还原出的 URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUrl {
    pub url: String,
    pub host: String,
}

impl fmt::Display for ContentUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

fn is_web(unit: &TrafficUnit) -> bool {
    matches!(unit.protocol, Protocol::Http | Protocol::Https) || matches!(unit.dest_port, 80 | 443)
}

/// 需要单元带域名；HTTP 请求取请求行目标，代理式绝对 URL 原样使用
pub fn extract_url(unit: &TrafficUnit) -> Option<ContentUrl> {
    if !is_web(unit) {
        return None;
    }
    let host = unit.domain.as_deref().filter(|d| !d.is_empty())?.to_ascii_lowercase();

    let target = unit.payload.as_deref().and_then(parse_http_target);
    let url = match target {
        Some(t) if t.starts_with("http://") || t.starts_with("https://") => t,
        Some(t) if t.starts_with('/') => format!("http://{}{}", host, t),
        _ if unit.protocol == Protocol::Https || unit.dest_port == 443 => format!("https://{}/", host),
        _ => format!("http://{}/", host),
    };
    Some(ContentUrl { url, host })
}

/// 末尾的 `/` 不参与比较
fn url_key(url: &str) -> String {
    let url = url.trim();
    let (scheme, rest) = url.split_once("://").unwrap_or(("", url));
    let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
    format!(
        "{}://{}/{}",
        scheme.to_ascii_lowercase(),
        host.to_ascii_lowercase(),
        path.trim_end_matches('/')
    )
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.strip_suffix(domain).is_some_and(|rest| rest.ends_with('.'))
}

#[derive(Debug, Clone)]
pub struct Category {
    pub name: String,
    pub enabled: bool,
    pub action: CategoryAction,
    domains: Vec<String>,
    keywords: Vec<String>,
    patterns: Vec<Regex>,
}

impl Category {
    pub fn new(name: impl Into<String>, action: CategoryAction) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            action,
            domains: Vec::new(),
            keywords: Vec::new(),
            patterns: Vec::new(),
        }
    }

    pub fn from_config(cfg: &CategoryConfig) -> Result<Self> {
        let action = CategoryAction::from_str_opt(&cfg.action)
            .with_context(|| format!("category '{}': unknown action '{}'", cfg.name, cfg.action))?;
        let mut cat = Self::new(&cfg.name, action);
        cat.enabled = cfg.enabled;
        for d in &cfg.domains {
            cat.add_domain(d);
        }
        for k in &cfg.keywords {
            cat.add_keyword(k);
        }
        for p in &cfg.patterns {
            cat.add_pattern(p)
                .with_context(|| format!("category '{}'", cfg.name))?;
        }
        Ok(cat)
    }

    pub fn add_domain(&mut self, domain: &str) {
        let d = domain.trim().trim_start_matches("*.").trim_end_matches('.').to_ascii_lowercase();
        if !d.is_empty() {
            self.domains.push(d);
        }
    }

    pub fn add_keyword(&mut self, keyword: &str) {
        let k = keyword.trim().to_ascii_lowercase();
        if !k.is_empty() {
            self.keywords.push(k);
        }
    }

    pub fn add_pattern(&mut self, pattern: &str) -> Result<()> {
        let re = Regex::new(pattern).with_context(|| format!("invalid pattern '{}'", pattern))?;
        self.patterns.push(re);
        Ok(())
    }

    /// 返回命中的描述
    fn matches(&self, url: &ContentUrl) -> Option<String> {
        if let Some(d) = self.domains.iter().find(|d| host_matches(&url.host, d)) {
            return Some(format!("domain {}", d));
        }
        let lower = url.url.to_ascii_lowercase();
        if let Some(k) = self.keywords.iter().find(|k| lower.contains(k.as_str())) {
            return Some(format!("keyword {}", k));
        }
        self.patterns
            .iter()
            .find(|re| re.is_match(&url.url))
            .map(|re| format!("pattern {}", re.as_str()))
    }
}

/// 内容过滤器；URL 黑名单优先，然后按声明顺序检查分类，第一个命中的分类决定结果
#[derive(Debug, Default)]
pub struct ContentFilter {
    blocked_urls: RwLock<HashSet<String>>,
    categories: RwLock<Vec<Category>>,
}

impl ContentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &ContentFilterConfig) -> Result<Self> {
        let filter = Self::new();
        for url in &cfg.blocked_urls {
            filter.block_url(url);
        }
        for cat in &cfg.categories {
            filter.add_category(Category::from_config(cat)?);
        }
        info!(
            urls = cfg.blocked_urls.len(),
            categories = filter.category_count(),
            "content filter loaded"
        );
        Ok(filter)
    }

    pub fn block_url(&self, url: &str) {
        if url.trim().is_empty() {
            return;
        }
        self.blocked_urls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url_key(url));
    }

    /// 同名分类被替换
    pub fn add_category(&self, category: Category) {
        let mut cats = self.categories.write().unwrap_or_else(PoisonError::into_inner);
        cats.retain(|c| c.name != category.name);
        cats.push(category);
    }

    pub fn category_count(&self) -> usize {
        self.categories.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// 命中 block 返回阻断；warn / log 分类返回 Log 决定，不阻断
    pub fn check(&self, unit: &TrafficUnit) -> Option<Decision> {
        let url = extract_url(unit)?;

        let blocked = self
            .blocked_urls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&url_key(&url.url));
        if blocked {
            debug!(url = %url, "URL blocked");
            return Some(Decision::block(format!("URL {} is blocked", url)));
        }

        let cats = self.categories.read().unwrap_or_else(PoisonError::into_inner);
        let (cat, hit) = cats
            .iter()
            .filter(|c| c.enabled)
            .find_map(|c| c.matches(&url).map(|hit| (c, hit)))?;
        let reason = format!("URL {} matches {} in category {}", url, hit, cat.name);
        match cat.action {
            CategoryAction::Block => {
                debug!(url = %url, category = %cat.name, "content category blocked");
                Some(Decision::block(reason))
            }
            CategoryAction::Warn => {
                warn!(url = %url, category = %cat.name, "content category matched");
                Some(Decision::log(reason))
            }
            CategoryAction::Log => {
                info!(url = %url, category = %cat.name, "content category matched");
                Some(Decision::log(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::sniff::tests::client_hello;

    fn http_unit(host: &str, path: &str) -> TrafficUnit {
        let req = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, host);
        TrafficUnit::new(Protocol::Http, 80)
            .with_domain(host)
            .with_payload(req.into_bytes())
    }

    #[test]
    fn url_from_http_and_tls() {
        let url = extract_url(&http_unit("news.example", "/a?b=1")).unwrap();
        assert_eq!(url.url, "http://news.example/a?b=1");
        assert_eq!(url.host, "news.example");

        let tls = TrafficUnit::new(Protocol::Tcp, 443)
            .with_domain("video.example")
            .with_payload(client_hello("video.example"));
        assert_eq!(extract_url(&tls).unwrap().url, "https://video.example/");

        // 非 web 端口不处理
        assert!(extract_url(&TrafficUnit::new(Protocol::Tcp, 22).with_domain("a.example")).is_none());
        assert!(extract_url(&TrafficUnit::new(Protocol::Tcp, 80)).is_none());
    }

    #[test]
    fn blocked_url_ignores_trailing_slash_and_host_case() {
        let filter = ContentFilter::new();
        filter.block_url("http://News.Example/bad/");
        let d = filter.check(&http_unit("news.example", "/bad")).unwrap();
        assert!(d.is_block());
        assert!(filter.check(&http_unit("news.example", "/good")).is_none());
    }

    #[test]
    fn category_domains_keywords_and_patterns() {
        let filter = ContentFilter::new();
        let mut gambling = Category::new("gambling", CategoryAction::Block);
        gambling.add_domain("casino.example");
        gambling.add_keyword("Poker");
        filter.add_category(gambling);
        let mut social = Category::new("social", CategoryAction::Log);
        social.add_pattern(r"^https://[^/]*social\.").unwrap();
        filter.add_category(social);

        let d = filter.check(&http_unit("www.casino.example", "/")).unwrap();
        assert!(d.is_block());
        assert!(d.reason.contains("gambling"));
        assert!(filter.check(&http_unit("games.example", "/poker/table")).unwrap().is_block());
        // 后缀匹配要求在标签边界
        assert!(filter.check(&http_unit("notcasino.example", "/")).is_none());

        let tls = TrafficUnit::new(Protocol::Https, 443).with_domain("m.social.example");
        let d = filter.check(&tls).unwrap();
        assert!(!d.stops_pipeline());
        assert!(d.reason.contains("social"));
    }

    #[test]
    fn disabled_category_and_config() {
        let cfg: ContentFilterConfig = serde_yml::from_str(
            r#"
blocked_urls: ["http://bad.example/x"]
categories:
  - name: adult
    enabled: false
    domains: ["adult.example"]
  - name: tracking
    action: warn
    patterns: ["/collect\\?"]
"#,
        )
        .unwrap();
        let filter = ContentFilter::from_config(&cfg).unwrap();
        assert_eq!(filter.category_count(), 2);
        assert!(filter.check(&http_unit("adult.example", "/")).is_none());
        assert!(filter.check(&http_unit("bad.example", "/x")).unwrap().is_block());
        let d = filter.check(&http_unit("a.example", "/collect?id=1")).unwrap();
        assert!(!d.is_block());
    }
}
