use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::router::{Decision, RuleStats, Verdict};

/// 引擎级计数器，全部为原子量
#[derive(Debug, Default)]
pub struct Metrics {
    requests_processed: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    dns_queries: AtomicU64,
    dns_blocked: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
    redirected: AtomicU64,
    failed: AtomicU64,
    load_balancer_hits: AtomicU64,
    tunneled_connections: AtomicU64,
    obfuscated_connections: AtomicU64,
    dpi_evasions: AtomicU64,
    latency_total_us: AtomicU64,
    latency_samples: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        bump(&self.requests_processed);
    }

    pub fn record_decision(&self, decision: &Decision) {
        match decision.action {
            Verdict::Allow | Verdict::Log => bump(&self.allowed),
            Verdict::Block => bump(&self.blocked),
            Verdict::Redirect => bump(&self.redirected),
        }
    }

    pub fn record_failure(&self) {
        bump(&self.failed);
    }

    pub fn record_dns_query(&self, blocked: bool) {
        bump(&self.dns_queries);
        if blocked {
            bump(&self.dns_blocked);
        }
    }

    pub fn record_upstream_selected(&self) {
        bump(&self.load_balancer_hits);
    }

    pub fn record_connection(&self, tunneled: bool, obfuscated: bool) {
        if tunneled {
            bump(&self.tunneled_connections);
        }
        if obfuscated {
            bump(&self.obfuscated_connections);
        }
    }

    pub fn record_dpi_evasion(&self) {
        bump(&self.dpi_evasions);
    }

    pub fn record_bytes(&self, sent: u64, received: u64) {
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
    }

    pub fn record_latency(&self, latency: Duration) {
        self.latency_total_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        bump(&self.latency_samples);
    }

    pub fn average_latency(&self) -> Duration {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency_total_us.load(Ordering::Relaxed) / samples)
    }

    pub fn snapshot(&self, rules: Vec<RuleStats>, active_connections: usize) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let sent = load(&self.bytes_sent);
        let received = load(&self.bytes_received);
        MetricsSnapshot {
            requests_processed: load(&self.requests_processed),
            bytes_sent: sent,
            bytes_received: received,
            bytes_transferred: sent + received,
            dns_queries: load(&self.dns_queries),
            dns_blocked: load(&self.dns_blocked),
            allowed: load(&self.allowed),
            blocked: load(&self.blocked),
            redirected: load(&self.redirected),
            failed: load(&self.failed),
            load_balancer_hits: load(&self.load_balancer_hits),
            tunneled_connections: load(&self.tunneled_connections),
            obfuscated_connections: load(&self.obfuscated_connections),
            dpi_evasions: load(&self.dpi_evasions),
            average_latency_ms: self.average_latency().as_micros() as f64 / 1000.0,
            active_connections,
            rules,
        }
    }
}

/// 可序列化的指标快照
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_processed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bytes_transferred: u64,
    pub dns_queries: u64,
    pub dns_blocked: u64,
    pub allowed: u64,
    pub blocked: u64,
    pub redirected: u64,
    pub failed: u64,
    pub load_balancer_hits: u64,
    pub tunneled_connections: u64,
    pub obfuscated_connections: u64,
    pub dpi_evasions: u64,
    pub average_latency_ms: f64,
    pub active_connections: usize,
    pub rules: Vec<RuleStats>,
}
