use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use serde::Serialize;

use super::condition::Condition;
use crate::config::types::RuleConfig;
use crate::proxy::TrafficUnit;

/// 规则动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Block,
    Redirect(String),
    /// 只记录，不终止
    Log,
}

impl RuleAction {
    /// 解析动作名；`redirect` 的目标取自 `redirect:host:port` 或规则的 `redirect_to`
    pub fn parse(s: &str, redirect_to: Option<&str>) -> Result<Self> {
        let (name, arg) = match s.split_once(':') {
            Some((n, a)) => (n, Some(a)),
            None => (s, None),
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "allow" | "accept" => Ok(RuleAction::Allow),
            "block" | "deny" | "drop" => Ok(RuleAction::Block),
            "log" => Ok(RuleAction::Log),
            "redirect" => {
                let target = arg
                    .or(redirect_to)
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("redirect action requires a target"))?;
                Ok(RuleAction::Redirect(target.to_string()))
            }
            other => anyhow::bail!("unknown rule action '{}'", other),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RuleAction::Log)
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Allow => f.write_str("allow"),
            RuleAction::Block => f.write_str("block"),
            RuleAction::Redirect(t) => write!(f, "redirect:{}", t),
            RuleAction::Log => f.write_str("log"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Block,
    Redirect,
    Log,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Block => "block",
            Verdict::Redirect => "redirect",
            Verdict::Log => "log",
        }
    }
}

/// 判定结果：每个流量单元恰好产生一个
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub action: Verdict,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl Decision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self::new(Verdict::Allow, reason)
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self::new(Verdict::Block, reason)
    }

    pub fn log(reason: impl Into<String>) -> Self {
        Self::new(Verdict::Log, reason)
    }

    pub fn redirect(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Self::new(Verdict::Redirect, reason)
        }
    }

    fn new(action: Verdict, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
            target: None,
            rule_id: None,
        }
    }

    pub fn with_rule(mut self, id: &str) -> Self {
        self.rule_id = Some(id.to_string());
        self
    }

    /// block / redirect 会终止流水线
    pub fn stops_pipeline(&self) -> bool {
        matches!(self.action, Verdict::Block | Verdict::Redirect)
    }

    pub fn is_block(&self) -> bool {
        self.action == Verdict::Block
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.action.as_str(), self.reason)?;
        if let Some(t) = &self.target {
            write!(f, " -> {}", t)?;
        }
        Ok(())
    }
}

/// 过滤规则
#[derive(Debug)]
pub struct Rule {
    pub id: String,
    pub name: Option<String>,
    pub conditions: Vec<Condition>,
    pub actions: Vec<RuleAction>,
    pub priority: i32,
    pub enabled: bool,
    /// 过期时间（unix 毫秒）
    pub expires_at_ms: Option<u64>,
    pub(super) seq: u64,
    match_count: AtomicU64,
    action_count: AtomicU64,
    last_matched_ms: AtomicU64,
}

impl Rule {
    pub fn new(id: impl Into<String>, priority: i32) -> Self {
        Self {
            id: id.into(),
            name: None,
            conditions: Vec::new(),
            actions: Vec::new(),
            priority,
            enabled: true,
            expires_at_ms: None,
            seq: 0,
            match_count: AtomicU64::new(0),
            action_count: AtomicU64::new(0),
            last_matched_ms: AtomicU64::new(0),
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn then(mut self, action: RuleAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn expires_at(mut self, unix_ms: u64) -> Self {
        self.expires_at_ms = Some(unix_ms);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn from_config(cfg: &RuleConfig) -> Result<Self> {
        let conditions = cfg
            .conditions
            .iter()
            .map(Condition::from_config)
            .collect::<Result<Vec<_>>>()?;
        let actions = cfg
            .actions
            .iter()
            .map(|a| RuleAction::parse(a, cfg.redirect_to.as_deref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: cfg.name.clone(),
            conditions,
            actions,
            enabled: cfg.enabled,
            expires_at_ms: cfg.expires_at.map(|s| s.saturating_mul(1000)),
            ..Self::new(cfg.id.clone(), cfg.priority)
        })
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|t| t <= now_ms)
    }

    pub fn is_active(&self, now_ms: u64) -> bool {
        self.enabled && !self.is_expired(now_ms)
    }

    /// 所有条件 AND；无条件的规则匹配一切
    pub fn matches(&self, unit: &TrafficUnit) -> bool {
        self.conditions.iter().all(|c| c.matches(unit))
    }

    pub(super) fn record_match(&self, now_ms: u64) {
        self.match_count.fetch_add(1, Ordering::Relaxed);
        self.last_matched_ms.store(now_ms, Ordering::Relaxed);
    }

    pub(super) fn record_action(&self) {
        self.action_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn stats(&self) -> RuleStats {
        let last = self.last_matched_ms.load(Ordering::Relaxed);
        RuleStats {
            id: self.id.clone(),
            priority: self.priority,
            enabled: self.enabled,
            match_count: self.match_count.load(Ordering::Relaxed),
            action_count: self.action_count.load(Ordering::Relaxed),
            last_matched_ms: (last > 0).then_some(last),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let conds: Vec<String> = self.conditions.iter().map(|c| c.to_string()).collect();
        let acts: Vec<String> = self.actions.iter().map(|a| a.to_string()).collect();
        write!(
            f,
            "{}[p={}]({}) => {}",
            self.id,
            self.priority,
            conds.join(" && "),
            acts.join(",")
        )
    }
}

/// 规则统计快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleStats {
    pub id: String,
    pub priority: i32,
    pub enabled: bool,
    pub match_count: u64,
    pub action_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_matched_ms: Option<u64>,
}
