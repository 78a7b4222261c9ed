pub mod condition;
pub mod content;
pub mod process;
pub mod rules;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::types::RuleConfig;
use crate::proxy::{now_millis, TrafficUnit};

pub use condition::{Condition, Field, Operator};
pub use content::{Category, CategoryAction, ContentFilter};
pub use process::{ProcessPolicies, ProcessPolicy};
pub use rules::{Decision, Rule, RuleAction, RuleStats, Verdict};

/// 规则引擎：按优先级（高者优先）、同优先级按注册顺序求值，第一条命中即短路
pub struct RuleEngine {
    /// 始终按 (priority desc, seq asc) 排好序
    rules: RwLock<Vec<Rule>>,
    next_seq: AtomicU64,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn from_config(configs: &[RuleConfig]) -> Result<Self> {
        let engine = Self::new();
        for cfg in configs {
            engine.add_rule(Rule::from_config(cfg)?);
        }
        info!(count = engine.len(), "rule engine loaded");
        Ok(engine)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Rule>> {
        self.rules.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Rule>> {
        self.rules.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 插入规则；同 id 的旧规则被替换，新规则排在同优先级规则之后
    pub fn add_rule(&self, mut rule: Rule) {
        rule.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut rules = self.write();
        rules.retain(|r| r.id != rule.id);
        let pos = rules.partition_point(|r| r.priority >= rule.priority);
        debug!(rule = %rule, position = pos, "rule added");
        rules.insert(pos, rule);
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut rules = self.write();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        before != rules.len()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut rules = self.write();
        match rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// 删除已过期规则，返回删除数量
    pub fn sweep_expired(&self) -> usize {
        let now = now_millis();
        let mut rules = self.write();
        let before = rules.len();
        rules.retain(|r| {
            let expired = r.is_expired(now);
            if expired {
                info!(rule = %r.id, "expired rule removed");
            }
            !expired
        });
        before - rules.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn stats(&self) -> Vec<RuleStats> {
        self.read().iter().map(Rule::stats).collect()
    }

    /// 对流量单元求值，恰好返回一个 Decision
    pub fn evaluate(&self, unit: &TrafficUnit) -> Decision {
        let now = now_millis();
        let rules = self.read();

        let Some(rule) = rules.iter().find(|r| r.is_active(now) && r.matches(unit)) else {
            debug!(unit = %unit, "no rule matched");
            return Decision::allow("no rule matched");
        };

        rule.record_match(now);
        for action in &rule.actions {
            rule.record_action();
            let reason = format!("matched rule {}", rule.label());
            let decision = match action {
                RuleAction::Log => {
                    info!(rule = %rule.id, unit = %unit, "rule log action");
                    continue;
                }
                RuleAction::Allow => Decision::allow(reason),
                RuleAction::Block => Decision::block(reason),
                RuleAction::Redirect(target) => Decision::redirect(target.clone(), reason),
            };
            debug!(rule = %rule.id, unit = %unit, decision = %decision, "rule matched");
            return decision.with_rule(&rule.id);
        }

        // 只有 log 动作：记录后放行
        Decision::log(format!("matched rule {} (log only)", rule.label())).with_rule(&rule.id)
    }

    /// 周期清理过期规则，直到取消
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.sweep_expired();
                    if removed > 0 {
                        debug!(removed, "rule sweep");
                    }
                }
            }
        }
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}
