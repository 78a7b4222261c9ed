use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Deserializer};

use crate::common::ProxyError;
use crate::proxy::group::LbStrategy;
use crate::proxy::outbound::UpstreamKind;
use crate::proxy::transport::LayerKind;
use crate::router::{CategoryAction, Field, Operator, RuleAction};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub features: FeatureToggles,
    pub upstreams: Vec<UpstreamConfig>,
    pub load_balancer: LoadBalancerConfig,
    pub dns: DnsConfig,
    pub rules: Vec<RuleConfig>,
    pub process_rules: Vec<ProcessRuleConfig>,
    pub content_filter: ContentFilterConfig,
    pub tunnel: TunnelConfig,
    pub obfuscation: ObfuscationConfig,
    pub dpi: DpiConfig,
    pub timeouts: TimeoutConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.features.load_balancing && self.upstreams.is_empty() {
            return Err(config_err("load balancing is enabled but no upstreams are configured"));
        }
        if self.features.dns_filtering && self.dns.servers.is_empty() {
            return Err(config_err("DNS filtering is enabled but no DNS servers are configured"));
        }
        if LbStrategy::from_str_opt(&self.load_balancer.strategy).is_none() {
            return Err(config_err(format!(
                "unknown load balancing strategy '{}'",
                self.load_balancer.strategy
            )));
        }

        for up in &self.upstreams {
            if UpstreamKind::from_str_opt(&up.kind).is_none() {
                return Err(config_err(format!(
                    "upstream '{}': unknown type '{}'",
                    up.name, up.kind
                )));
            }
            if up.address.is_empty() || up.port == 0 {
                return Err(config_err(format!(
                    "upstream '{}': address and port are required",
                    up.name
                )));
            }
        }

        for name in &self.tunnel.protocols {
            if LayerKind::from_str_opt(name).is_none() {
                return Err(config_err(format!("unknown tunnel protocol '{}'", name)));
            }
        }

        for rule in &self.rules {
            if rule.id.is_empty() {
                return Err(config_err("rule id must not be empty"));
            }
            for cond in &rule.conditions {
                if Field::from_str_opt(&cond.field).is_none() {
                    return Err(config_err(format!(
                        "rule '{}': unknown condition field '{}'",
                        rule.id, cond.field
                    )));
                }
                if Operator::from_str_opt(&cond.operator).is_none() {
                    return Err(config_err(format!(
                        "rule '{}': unknown operator '{}'",
                        rule.id, cond.operator
                    )));
                }
            }
            for action in &rule.actions {
                RuleAction::parse(action, rule.redirect_to.as_deref()).map_err(|e| {
                    config_err(format!("rule '{}': {}", rule.id, e))
                })?;
            }
        }

        for cat in &self.content_filter.categories {
            if CategoryAction::from_str_opt(&cat.action).is_none() {
                return Err(config_err(format!(
                    "content category '{}': unknown action '{}'",
                    cat.name, cat.action
                )));
            }
            for pattern in &cat.patterns {
                if let Err(e) = regex::Regex::new(pattern) {
                    return Err(config_err(format!(
                        "content category '{}': invalid pattern '{}': {}",
                        cat.name, pattern, e
                    )));
                }
            }
        }

        if self.obfuscation.padding_min > self.obfuscation.padding_max {
            return Err(config_err("obfuscation padding_min is larger than padding_max"));
        }
        if self.obfuscation.padding_max > u16::MAX as usize {
            return Err(config_err("obfuscation padding_max must fit in 16 bits"));
        }
        if self.dpi.fragment_min == 0 || self.dpi.fragment_min > self.dpi.fragment_max {
            return Err(config_err("dpi fragment range is invalid"));
        }
        Ok(())
    }
}

fn config_err(msg: impl Into<String>) -> anyhow::Error {
    ProxyError::Config(msg.into()).into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 各子系统开关
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeatureToggles {
    pub obfuscation: bool,
    pub dpi_evasion: bool,
    pub tunneling: bool,
    pub load_balancing: bool,
    pub dns_filtering: bool,
    pub process_filtering: bool,
    pub content_filtering: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: String,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: "round_robin".to_string(),
            health_check_interval_secs: 30,
            health_check_timeout_secs: 10,
        }
    }
}

impl LoadBalancerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub servers: Vec<String>,
    pub cache_size: usize,
    pub cache_ttl_secs: u64,
    pub min_ttl_secs: u64,
    pub max_ttl_secs: u64,
    pub query_timeout_secs: u64,
    pub whitelist: Vec<String>,
    pub blocklists: Vec<BlocklistConfig>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            cache_size: 10_000,
            cache_ttl_secs: 300,
            min_ttl_secs: 1,
            max_ttl_secs: 86_400,
            query_timeout_secs: 5,
            whitelist: Vec::new(),
            blocklists: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlocklistConfig {
    pub name: String,
    /// 列表文件路径，每行一个域名
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,
    pub actions: Vec<String>,
    #[serde(default)]
    pub redirect_to: Option<String>,
    /// 过期时间（unix 秒），临时规则使用
    #[serde(default)]
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionConfig {
    pub field: String,
    pub operator: String,
    #[serde(deserialize_with = "scalar_string")]
    pub value: String,
    #[serde(default)]
    pub negate: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessRuleConfig {
    pub process_name: String,
    #[serde(default = "default_true")]
    pub network_access: bool,
    #[serde(default)]
    pub blocked_ports: Vec<u16>,
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// HTTP/HTTPS 单元的 URL 与分类过滤
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContentFilterConfig {
    pub blocked_urls: Vec<String>,
    pub categories: Vec<CategoryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// 按主机名后缀匹配
    #[serde(default)]
    pub domains: Vec<String>,
    /// URL 子串，大小写不敏感
    #[serde(default)]
    pub keywords: Vec<String>,
    /// 对完整 URL 求值的正则
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// block / warn / log
    #[serde(default = "default_category_action")]
    pub action: String,
}

fn default_category_action() -> String {
    "block".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub protocols: Vec<String>,
    pub tls: TlsLayerConfig,
    pub websocket: WsLayerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsLayerConfig {
    pub server_name: Option<String>,
    /// 域前置：TLS SNI 使用该域名，真实目标放在内层
    pub front_domain: Option<String>,
    pub allow_insecure: bool,
    pub alpn: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsLayerConfig {
    pub path: String,
    pub host: Option<String>,
}

impl Default for WsLayerConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            host: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObfuscationConfig {
    /// base64 编码的密钥，缺省时每个引擎实例随机生成
    pub key: Option<String>,
    pub padding_min: usize,
    pub padding_max: usize,
    pub dummy_traffic: bool,
    pub dummy_interval_secs: u64,
    pub dummy_queue: usize,
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            key: None,
            padding_min: 0,
            padding_max: 256,
            dummy_traffic: false,
            dummy_interval_secs: 5,
            dummy_queue: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DpiConfig {
    pub fragmentation: bool,
    pub header_obfuscation: bool,
    pub fragment_min: usize,
    pub fragment_max: usize,
    pub fragment_packets: usize,
}

impl Default for DpiConfig {
    fn default() -> Self {
        Self {
            fragmentation: true,
            header_obfuscation: true,
            fragment_min: 1,
            fragment_max: 64,
            fragment_packets: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub dial_secs: u64,
    pub handshake_secs: u64,
    pub read_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dial_secs: 30,
            handshake_secs: 10,
            read_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn dial(&self) -> Duration {
        Duration::from_secs(self.dial_secs.max(1))
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs.max(1))
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs.max(1))
    }
}

fn default_true() -> bool {
    true
}

/// 条件值允许写成字符串、数字或布尔，统一转成字符串
fn scalar_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Str(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Str(s) => s,
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Bool(b) => b.to_string(),
    })
}
