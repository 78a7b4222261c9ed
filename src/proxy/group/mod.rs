pub mod health;
pub mod loadbalance;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::common::Address;
use crate::config::types::UpstreamConfig;
use crate::proxy::now_millis;
use crate::proxy::outbound::{Credentials, UpstreamKind};

pub use health::HealthMonitor;
pub use loadbalance::{LbStrategy, LoadBalancer, UpstreamLease};

#[derive(Debug, Clone, Copy)]
struct HealthState {
    healthy: bool,
    latency: Option<Duration>,
    consecutive_errors: u32,
    last_check_ms: Option<u64>,
}

/// 上游端点：静态配置 + 运行时健康状态
///
/// 健康状态只由 HealthMonitor 写入，LoadBalancer 选择时读取；
/// 活跃连接数由 UpstreamLease 维护。
#[derive(Debug)]
pub struct UpstreamEndpoint {
    pub name: String,
    pub kind: UpstreamKind,
    pub address: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub weight: u32,
    state: RwLock<HealthState>,
    active: AtomicUsize,
}

impl UpstreamEndpoint {
    /// 新端点默认视为健康，直到第一次探测失败
    pub fn new(name: impl Into<String>, kind: UpstreamKind, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            kind,
            address: address.into(),
            port,
            credentials: None,
            weight: 1,
            state: RwLock::new(HealthState {
                healthy: true,
                latency: None,
                consecutive_errors: 0,
                last_check_ms: None,
            }),
            active: AtomicUsize::new(0),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn from_config(cfg: &UpstreamConfig) -> Result<Self> {
        let kind = UpstreamKind::from_str_opt(&cfg.kind).ok_or_else(|| {
            anyhow::anyhow!("upstream '{}': unknown type '{}'", cfg.name, cfg.kind)
        })?;
        Ok(Self::new(&cfg.name, kind, &cfg.address, cfg.port)
            .with_weight(cfg.weight)
            .with_credentials(Credentials::from_parts(
                cfg.username.as_deref(),
                cfg.password.as_deref(),
            )))
    }

    pub fn server(&self) -> Address {
        Address::from_host_port(&self.address, self.port)
    }

    fn state(&self) -> HealthState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_healthy(&self) -> bool {
        self.state().healthy
    }

    pub fn latency(&self) -> Option<Duration> {
        self.state().latency
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.state().consecutive_errors
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// 探测成功：恢复健康、记录延迟、清零错误计数
    pub fn mark_success(&self, latency: Duration) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.healthy = true;
        state.latency = Some(latency);
        state.consecutive_errors = 0;
        state.last_check_ms = Some(now_millis());
    }

    /// 探测失败：标记不健康、错误计数加一
    pub fn mark_failure(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.healthy = false;
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        state.last_check_ms = Some(now_millis());
    }

    pub fn status(&self) -> EndpointStatus {
        let state = self.state();
        EndpointStatus {
            name: self.name.clone(),
            kind: self.kind,
            server: self.server().to_string(),
            weight: self.weight,
            healthy: state.healthy,
            latency_ms: state.latency.map(|d| d.as_millis() as u64),
            consecutive_errors: state.consecutive_errors,
            active_connections: self.active_connections(),
            last_check_ms: state.last_check_ms,
        }
    }
}

/// 端点状态快照
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub kind: UpstreamKind,
    pub server: String,
    pub weight: u32,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub consecutive_errors: u32,
    pub active_connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check_ms: Option<u64>,
}
