use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

/// 单条缓存
#[derive(Debug)]
pub struct DnsCacheEntry {
    pub domain: String,
    pub addrs: Vec<IpAddr>,
    pub ttl: Duration,
    pub inserted_at: Instant,
    hits: AtomicU64,
}

impl DnsCacheEntry {
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.inserted_at + self.ttl
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

/// 有界 DNS 缓存，满时淘汰最早插入的条目
///
/// 本身不加锁，由 DnsFilter 外层的 RwLock 保护；命中计数是原子的，读锁下即可更新。
pub struct DnsCache {
    entries: HashMap<String, DnsCacheEntry>,
    /// 队首最旧，队尾最新
    order: VecDeque<String>,
    max_entries: usize,
}

impl DnsCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries,
        }
    }

    /// 命中且未过期时返回地址并累加命中数
    pub fn get(&self, domain: &str) -> Option<Vec<IpAddr>> {
        let entry = self.entries.get(domain)?;
        if !entry.is_live(Instant::now()) {
            return None;
        }
        entry.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.addrs.clone())
    }

    pub fn entry(&self, domain: &str) -> Option<&DnsCacheEntry> {
        self.entries.get(domain)
    }

    pub fn insert(&mut self, domain: &str, addrs: Vec<IpAddr>, ttl: Duration) {
        if self.max_entries == 0 {
            return;
        }
        if self.entries.contains_key(domain) {
            self.order.retain(|d| d != domain);
        } else if self.entries.len() >= self.max_entries {
            self.purge_expired();
            while self.entries.len() >= self.max_entries {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.entries.remove(&oldest);
                debug!(domain = %oldest, "DNS cache evicted oldest entry");
            }
        }

        self.entries.insert(
            domain.to_string(),
            DnsCacheEntry {
                domain: domain.to_string(),
                addrs,
                ttl,
                inserted_at: Instant::now(),
                hits: AtomicU64::new(0),
            },
        );
        self.order.push_back(domain.to_string());
    }

    /// 删除过期条目，返回删除数量
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live(now));
        let entries = &self.entries;
        self.order.retain(|d| entries.contains_key(d));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }
}
