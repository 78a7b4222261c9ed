use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::{debug, info};

use super::{EndpointStatus, HealthMonitor, UpstreamEndpoint};
use crate::config::types::{LoadBalancerConfig, UpstreamConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbStrategy {
    RoundRobin,
    Weighted,
    LeastConnections,
}

impl LbStrategy {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "round_robin" | "round-robin" | "roundrobin" => Some(LbStrategy::RoundRobin),
            "weighted" | "weighted_random" => Some(LbStrategy::Weighted),
            "least_connections" | "least-connections" | "leastconn" => {
                Some(LbStrategy::LeastConnections)
            }
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LbStrategy::RoundRobin => "round_robin",
            LbStrategy::Weighted => "weighted",
            LbStrategy::LeastConnections => "least_connections",
        }
    }

    fn build(self) -> Box<dyn Strategy> {
        match self {
            LbStrategy::RoundRobin => Box::new(RoundRobin {
                cursor: AtomicUsize::new(0),
            }),
            LbStrategy::Weighted => Box::new(Weighted),
            LbStrategy::LeastConnections => Box::new(LeastConnections),
        }
    }
}

/// 在健康子集中挑一个，返回其下标
trait Strategy: Send + Sync {
    fn pick(&self, healthy: &[&Arc<UpstreamEndpoint>]) -> usize;
}

struct RoundRobin {
    cursor: AtomicUsize,
}

impl Strategy for RoundRobin {
    fn pick(&self, healthy: &[&Arc<UpstreamEndpoint>]) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len()
    }
}

/// 按权重随机；权重全为 0 时退化为均匀随机
struct Weighted;

impl Strategy for Weighted {
    fn pick(&self, healthy: &[&Arc<UpstreamEndpoint>]) -> usize {
        let mut rng = rand::thread_rng();
        let total: u64 = healthy.iter().map(|e| e.weight as u64).sum();
        if total == 0 {
            return rng.gen_range(0..healthy.len());
        }
        let mut point = rng.gen_range(0..total);
        for (idx, ep) in healthy.iter().enumerate() {
            let w = ep.weight as u64;
            if point < w {
                return idx;
            }
            point -= w;
        }
        healthy.len() - 1
    }
}

/// 活跃连接最少者；并列时取声明顺序靠前的
struct LeastConnections;

impl Strategy for LeastConnections {
    fn pick(&self, healthy: &[&Arc<UpstreamEndpoint>]) -> usize {
        healthy
            .iter()
            .enumerate()
            .min_by_key(|(_, ep)| ep.active_connections())
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }
}

/// 上游租约：持有期间计入端点的活跃连接数
#[derive(Debug)]
pub struct UpstreamLease {
    endpoint: Arc<UpstreamEndpoint>,
}

impl UpstreamLease {
    fn new(endpoint: Arc<UpstreamEndpoint>) -> Self {
        endpoint.active.fetch_add(1, Ordering::Relaxed);
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Arc<UpstreamEndpoint> {
        &self.endpoint
    }
}

impl Deref for UpstreamLease {
    type Target = UpstreamEndpoint;

    fn deref(&self) -> &UpstreamEndpoint {
        &self.endpoint
    }
}

impl Drop for UpstreamLease {
    fn drop(&mut self) {
        self.endpoint.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// 负载均衡器：只在健康端点中选择
pub struct LoadBalancer {
    endpoints: Vec<Arc<UpstreamEndpoint>>,
    kind: LbStrategy,
    strategy: Box<dyn Strategy>,
}

impl LoadBalancer {
    pub fn new(endpoints: Vec<Arc<UpstreamEndpoint>>, kind: LbStrategy) -> Self {
        Self {
            endpoints,
            kind,
            strategy: kind.build(),
        }
    }

    pub fn from_config(upstreams: &[UpstreamConfig], cfg: &LoadBalancerConfig) -> Result<Self> {
        let kind = LbStrategy::from_str_opt(&cfg.strategy).ok_or_else(|| {
            anyhow::anyhow!("unknown load balancing strategy '{}'", cfg.strategy)
        })?;
        let endpoints = upstreams
            .iter()
            .map(|u| UpstreamEndpoint::from_config(u).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        info!(
            strategy = kind.as_str(),
            upstreams = endpoints.len(),
            "load balancer initialized"
        );
        Ok(Self::new(endpoints, kind))
    }

    /// 选出一个健康端点；没有健康端点时返回 None
    pub fn select_upstream(&self) -> Option<UpstreamLease> {
        self.select_upstream_excluding(&[])
    }

    /// 同上，但跳过 `tried` 中已失败的端点
    pub fn select_upstream_excluding(&self, tried: &[String]) -> Option<UpstreamLease> {
        let healthy: Vec<&Arc<UpstreamEndpoint>> = self
            .endpoints
            .iter()
            .filter(|e| e.is_healthy() && !tried.contains(&e.name))
            .collect();
        if healthy.is_empty() {
            debug!(total = self.endpoints.len(), "no healthy upstream");
            return None;
        }
        let chosen = healthy[self.strategy.pick(&healthy)];
        debug!(
            upstream = %chosen.name,
            strategy = self.kind.as_str(),
            active = chosen.active_connections(),
            "upstream selected"
        );
        Some(UpstreamLease::new(Arc::clone(chosen)))
    }

    pub fn strategy(&self) -> LbStrategy {
        self.kind
    }

    pub fn endpoints(&self) -> &[Arc<UpstreamEndpoint>] {
        &self.endpoints
    }

    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.is_healthy()).count()
    }

    pub fn snapshot(&self) -> Vec<EndpointStatus> {
        self.endpoints.iter().map(|e| e.status()).collect()
    }

    /// 为同一组端点构造健康检查器
    pub fn health_monitor(&self, interval: Duration, timeout: Duration) -> HealthMonitor {
        HealthMonitor::new(self.endpoints.clone(), interval, timeout)
    }
}
