use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::config::types::ProcessRuleConfig;
use crate::proxy::TrafficUnit;

use super::Decision;

/// 按进程限制网络访问
#[derive(Debug, Clone)]
pub struct ProcessPolicy {
    /// 子串匹配，大小写不敏感
    pub process_name: String,
    pub network_access: bool,
    pub blocked_ports: Vec<u16>,
    pub blocked_hosts: Vec<String>,
    pub enabled: bool,
}

impl ProcessPolicy {
    pub fn from_config(cfg: &ProcessRuleConfig) -> Self {
        Self {
            process_name: cfg.process_name.to_ascii_lowercase(),
            network_access: cfg.network_access,
            blocked_ports: cfg.blocked_ports.clone(),
            blocked_hosts: cfg
                .blocked_hosts
                .iter()
                .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            enabled: cfg.enabled,
        }
    }

    fn applies_to(&self, process: &str) -> bool {
        self.enabled && !self.process_name.is_empty() && process.contains(&self.process_name)
    }

    /// 主机名按后缀匹配，IP 按字面相等
    fn host_blocked(&self, unit: &TrafficUnit) -> Option<&str> {
        let domain = unit.domain.as_deref().map(str::to_ascii_lowercase);
        let ip = unit.dest_ip.map(|ip| ip.to_string());
        self.blocked_hosts.iter().map(String::as_str).find(|host| {
            let domain_hit = domain.as_deref().is_some_and(|d| {
                d == *host || d.strip_suffix(host).is_some_and(|rest| rest.ends_with('.'))
            });
            domain_hit || ip.as_deref() == Some(*host)
        })
    }

    fn check(&self, process: &str, unit: &TrafficUnit) -> Option<Decision> {
        if !self.network_access {
            return Some(Decision::block(format!("network access denied for process {}", process)));
        }
        if let Some(host) = self.host_blocked(unit) {
            return Some(Decision::block(format!("process {} blocked from host {}", process, host)));
        }
        if self.blocked_ports.contains(&unit.dest_port) {
            return Some(Decision::block(format!(
                "process {} blocked from port {}",
                process, unit.dest_port
            )));
        }
        None
    }
}

/// 进程策略集合；按声明顺序检查，第一个产生阻断的策略生效
#[derive(Debug, Default)]
pub struct ProcessPolicies {
    policies: RwLock<Vec<ProcessPolicy>>,
}

impl ProcessPolicies {
    pub fn new(policies: Vec<ProcessPolicy>) -> Self {
        Self {
            policies: RwLock::new(policies),
        }
    }

    pub fn from_config(configs: &[ProcessRuleConfig]) -> Self {
        Self::new(configs.iter().map(ProcessPolicy::from_config).collect())
    }

    pub fn replace(&self, policies: Vec<ProcessPolicy>) {
        *self.policies.write().unwrap_or_else(PoisonError::into_inner) = policies;
    }

    pub fn len(&self) -> usize {
        self.policies.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 没有进程信息的单元不受进程策略影响
    pub fn check(&self, unit: &TrafficUnit) -> Option<Decision> {
        let process = extract_process_name(unit.process_name.as_deref()?).to_ascii_lowercase();
        let policies = self.policies.read().unwrap_or_else(PoisonError::into_inner);
        let decision = policies
            .iter()
            .filter(|p| p.applies_to(&process))
            .find_map(|p| p.check(&process, unit))?;
        debug!(process = %process, unit = %unit, decision = %decision, "process policy matched");
        Some(decision)
    }
}

/// 取路径最后一段作为进程名
pub fn extract_process_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
