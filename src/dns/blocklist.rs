use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{info, warn};

use super::normalize_domain;
use crate::config::types::BlocklistConfig;

/// 命名域名列表：精确集合 + 预编译正则
#[derive(Debug, Clone)]
pub struct DomainList {
    pub name: String,
    pub source: Option<String>,
    pub enabled: bool,
    domains: HashSet<String>,
    patterns: Vec<Regex>,
}

impl DomainList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            enabled: true,
            domains: HashSet::new(),
            patterns: Vec::new(),
        }
    }

    pub fn from_config(cfg: &BlocklistConfig) -> Result<Self> {
        let mut list = Self::new(&cfg.name);
        list.enabled = cfg.enabled;
        if let Some(source) = &cfg.source {
            list.load_file(source)?;
        }
        for domain in &cfg.domains {
            list.insert_domain(domain);
        }
        for pattern in &cfg.patterns {
            list.add_pattern(pattern)
                .with_context(|| format!("blocklist '{}'", cfg.name))?;
        }
        info!(
            name = %list.name,
            domains = list.domains.len(),
            patterns = list.patterns.len(),
            enabled = list.enabled,
            "blocklist loaded"
        );
        Ok(list)
    }

    /// 读取列表文件；坏行记录后跳过
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read blocklist {}", path.display()))?;
        self.source = Some(path.display().to_string());
        self.load_text(&text);
        Ok(())
    }

    /// 支持的行格式：
    /// - `example.com`
    /// - hosts 格式 `0.0.0.0 example.com [more.com ...]`
    /// - `*.example.com`（自身及所有子域）
    /// - `/regex/`
    ///
    /// `#` 和 `!` 开头为注释。
    pub fn load_text(&mut self, text: &str) {
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() || line.starts_with('!') {
                continue;
            }

            if line.len() > 2 && line.starts_with('/') && line.ends_with('/') {
                if let Err(e) = self.add_pattern(&line[1..line.len() - 1]) {
                    warn!(list = %self.name, line = lineno + 1, error = %e, "skipping bad pattern");
                }
                continue;
            }

            let mut tokens = line.split_whitespace();
            let Some(first) = tokens.next() else { continue };
            if first.parse::<IpAddr>().is_ok() {
                for host in tokens {
                    // hosts 文件中的本地名不算拦截项
                    if host != "localhost" && host.contains('.') {
                        self.insert_domain(host);
                    }
                }
            } else if let Some(suffix) = first.strip_prefix("*.") {
                let pattern = format!(r"(?:^|\.){}$", regex::escape(&normalize_domain(suffix)));
                if let Err(e) = self.add_pattern(&pattern) {
                    warn!(list = %self.name, line = lineno + 1, error = %e, "skipping bad wildcard");
                }
            } else {
                self.insert_domain(first);
            }
        }
    }

    pub fn insert_domain(&mut self, domain: &str) {
        let d = normalize_domain(domain);
        if !d.is_empty() {
            self.domains.insert(d);
        }
    }

    pub fn add_pattern(&mut self, pattern: &str) -> Result<()> {
        let re = Regex::new(pattern).with_context(|| format!("invalid pattern '{}'", pattern))?;
        self.patterns.push(re);
        Ok(())
    }

    /// 先查精确集合，再逐个正则；domain 需已规范化
    pub fn matches(&self, domain: &str) -> bool {
        self.domains.contains(domain) || self.patterns.iter().any(|re| re.is_match(domain))
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

/// 白名单：精确或后缀匹配（`x.example.com` 命中 `example.com`）
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    domains: HashSet<String>,
}

impl Whitelist {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();
        for d in domains {
            list.insert(d.as_ref());
        }
        list
    }

    pub fn insert(&mut self, domain: &str) {
        let d = normalize_domain(domain);
        if !d.is_empty() {
            self.domains.insert(d);
        }
    }

    /// 依次检查 domain 本身及每一级父域
    pub fn contains(&self, domain: &str) -> bool {
        let mut rest = domain;
        loop {
            if self.domains.contains(rest) {
                return true;
            }
            match rest.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => rest = parent,
                _ => return false,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_mixed_formats() {
        let mut list = DomainList::new("ads");
        list.load_text(
            "# comment\n\
             ads.example.com\n\
             0.0.0.0 tracker.net beacon.io # trailing\n\
             127.0.0.1 localhost\n\
             *.doubleclick.net\n\
             /^ad[0-9]+\\./\n\
             ! adblock comment\n\
             /([bad/\n",
        );
        assert_eq!(list.domain_count(), 3);
        assert_eq!(list.pattern_count(), 2);

        assert!(list.matches("ads.example.com"));
        assert!(list.matches("beacon.io"));
        assert!(!list.matches("localhost"));
        assert!(list.matches("doubleclick.net"));
        assert!(list.matches("stats.g.doubleclick.net"));
        assert!(!list.matches("notdoubleclick.net"));
        assert!(list.matches("ad42.cdn.com"));
        assert!(!list.matches("example.com"));
    }

    #[test]
    fn from_config_reads_file_and_inline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0.0.0.0 malware.test").unwrap();
        let cfg = BlocklistConfig {
            name: "mixed".into(),
            source: Some(file.path().display().to_string()),
            domains: vec!["Inline.Test.".into()],
            patterns: vec![r"\.evil$".into()],
            enabled: true,
        };
        let list = DomainList::from_config(&cfg).unwrap();
        assert!(list.matches("malware.test"));
        assert!(list.matches("inline.test"));
        assert!(list.matches("very.evil"));
        assert!(list.source.is_some());
    }

    #[test]
    fn from_config_rejects_bad_inline_pattern() {
        let cfg = BlocklistConfig {
            name: "bad".into(),
            source: None,
            domains: vec![],
            patterns: vec!["(".into()],
            enabled: true,
        };
        assert!(DomainList::from_config(&cfg).is_err());
    }

    #[test]
    fn missing_file_is_error() {
        let mut list = DomainList::new("x");
        assert!(list.load_file("/nonexistent/blocklist.txt").is_err());
    }

    #[test]
    fn whitelist_suffix_match() {
        let wl = Whitelist::new(["Example.com."]);
        assert!(wl.contains("example.com"));
        assert!(wl.contains("x.example.com"));
        assert!(wl.contains("a.b.example.com"));
        assert!(!wl.contains("badexample.com"));
        assert!(!wl.contains("com"));
    }
}
