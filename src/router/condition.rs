use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;

use anyhow::Result;
use ipnet::IpNet;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::types::ConditionConfig;
use crate::proxy::TrafficUnit;

/// 条件可引用的流量字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Protocol,
    SourceIp,
    DestIp,
    SourcePort,
    DestPort,
    ProcessName,
    ProcessId,
    Domain,
    PayloadSize,
}

impl Field {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "protocol" => Field::Protocol,
            "source_ip" | "src_ip" => Field::SourceIp,
            "dest_ip" | "dst_ip" => Field::DestIp,
            "source_port" | "src_port" => Field::SourcePort,
            "dest_port" | "dst_port" => Field::DestPort,
            "process_name" => Field::ProcessName,
            "process_id" | "pid" => Field::ProcessId,
            "domain" | "host" => Field::Domain,
            "payload_size" => Field::PayloadSize,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Field::Protocol => "protocol",
            Field::SourceIp => "source_ip",
            Field::DestIp => "dest_ip",
            Field::SourcePort => "source_port",
            Field::DestPort => "dest_port",
            Field::ProcessName => "process_name",
            Field::ProcessId => "process_id",
            Field::Domain => "domain",
            Field::PayloadSize => "payload_size",
        }
    }

    /// 从流量单元中取值；缺失返回 None
    fn extract<'a>(self, unit: &'a TrafficUnit) -> Option<Value<'a>> {
        match self {
            Field::Protocol => Some(Value::Str(Cow::Borrowed(unit.protocol.as_str()))),
            Field::SourceIp => unit.source_ip.map(Value::Ip),
            Field::DestIp => unit.dest_ip.map(Value::Ip),
            Field::SourcePort => Some(Value::Num(unit.source_port as f64)),
            Field::DestPort => Some(Value::Num(unit.dest_port as f64)),
            Field::ProcessName => unit
                .process_name
                .as_deref()
                .map(|s| Value::Str(Cow::Borrowed(s))),
            Field::ProcessId => unit.process_id.map(|p| Value::Num(p as f64)),
            Field::Domain => unit.domain.as_deref().map(|s| Value::Str(Cow::Borrowed(s))),
            Field::PayloadSize => Some(Value::Num(unit.payload_len() as f64)),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    Contains,
    Matches,
    Greater,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    InCidr,
}

impl Operator {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "equals" | "eq" | "==" => Operator::Equals,
            "contains" => Operator::Contains,
            "matches" | "regex" => Operator::Matches,
            "greater" | "gt" | ">" => Operator::Greater,
            "less" | "lt" | "<" => Operator::Less,
            "greater_or_equal" | "ge" | ">=" => Operator::GreaterOrEqual,
            "less_or_equal" | "le" | "<=" => Operator::LessOrEqual,
            "in_cidr" | "cidr" => Operator::InCidr,
            _ => return None,
        })
    }

    fn is_numeric(self) -> bool {
        matches!(
            self,
            Operator::Greater | Operator::Less | Operator::GreaterOrEqual | Operator::LessOrEqual
        )
    }
}

enum Value<'a> {
    Str(Cow<'a, str>),
    Num(f64),
    Ip(IpAddr),
}

impl Value<'_> {
    fn as_text(&self) -> Cow<'_, str> {
        match self {
            Value::Str(s) => Cow::Borrowed(s.as_ref()),
            Value::Num(n) => Cow::Owned(format_num(*n)),
            Value::Ip(ip) => Cow::Owned(ip.to_string()),
        }
    }
}

fn format_num(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// 构造时预编译的条件值
#[derive(Debug)]
enum Compiled {
    Text(String),
    Number(f64),
    Pattern(Regex),
    Cidr(IpNet),
    /// 构造失败：求值时一律不匹配
    Invalid(String),
}

/// 单个条件；构造后不可变
#[derive(Debug)]
pub struct Condition {
    field: Field,
    op: Operator,
    raw: String,
    negate: bool,
    compiled: Compiled,
}

impl Condition {
    /// 值无法编译（坏正则、非数字等）不会报错，条件被标记为无效并在求值时视为不匹配
    pub fn new(field: Field, op: Operator, value: impl Into<String>, negate: bool) -> Self {
        let raw = value.into();
        let compiled = compile(op, &raw);
        if let Compiled::Invalid(reason) = &compiled {
            warn!(field = %field, value = %raw, reason = %reason, "invalid rule condition");
        }
        Self {
            field,
            op,
            raw,
            negate,
            compiled,
        }
    }

    pub fn from_config(cfg: &ConditionConfig) -> Result<Self> {
        let field = Field::from_str_opt(&cfg.field)
            .ok_or_else(|| anyhow::anyhow!("unknown condition field '{}'", cfg.field))?;
        let op = Operator::from_str_opt(&cfg.operator)
            .ok_or_else(|| anyhow::anyhow!("unknown operator '{}'", cfg.operator))?;
        Ok(Self::new(field, op, cfg.value.clone(), cfg.negate))
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self.compiled, Compiled::Invalid(_))
    }

    pub fn matches(&self, unit: &TrafficUnit) -> bool {
        if let Compiled::Invalid(reason) = &self.compiled {
            debug!(field = %self.field, value = %self.raw, reason = %reason, "skipping invalid condition");
            return false;
        }
        let raw = match self.field.extract(unit) {
            Some(v) => self.apply(&v),
            None => false,
        };
        raw != self.negate
    }

    fn apply(&self, value: &Value<'_>) -> bool {
        match (&self.compiled, self.op) {
            (Compiled::Number(want), Operator::Equals) => match value {
                Value::Num(n) => n == want,
                other => other.as_text().trim() == format_num(*want),
            },
            (Compiled::Number(want), op) => match value {
                Value::Num(n) => match op {
                    Operator::Greater => n > want,
                    Operator::Less => n < want,
                    Operator::GreaterOrEqual => n >= want,
                    Operator::LessOrEqual => n <= want,
                    _ => false,
                },
                _ => false,
            },
            (Compiled::Text(want), Operator::Equals) => match value {
                Value::Ip(ip) => want.parse::<IpAddr>().map_or(false, |w| w == *ip),
                other => other.as_text().eq_ignore_ascii_case(want),
            },
            (Compiled::Text(want), Operator::Contains) => value
                .as_text()
                .to_ascii_lowercase()
                .contains(want.as_str()),
            (Compiled::Pattern(re), _) => re.is_match(&value.as_text()),
            (Compiled::Cidr(net), _) => match value {
                Value::Ip(ip) => net.contains(ip),
                _ => false,
            },
            _ => false,
        }
    }
}

fn compile(op: Operator, raw: &str) -> Compiled {
    match op {
        Operator::Matches => match Regex::new(raw) {
            Ok(re) => Compiled::Pattern(re),
            Err(e) => Compiled::Invalid(format!("bad regex: {}", e)),
        },
        Operator::InCidr => {
            let parsed = raw
                .parse::<IpNet>()
                .or_else(|_| raw.parse::<IpAddr>().map(IpNet::from));
            match parsed {
                Ok(net) => Compiled::Cidr(net),
                Err(_) => Compiled::Invalid(format!("bad cidr: {}", raw)),
            }
        }
        _ if op.is_numeric() => match raw.trim().parse::<f64>() {
            Ok(n) => Compiled::Number(n),
            Err(_) => Compiled::Invalid(format!("not a number: {}", raw)),
        },
        Operator::Equals => match raw.trim().parse::<f64>() {
            Ok(n) => Compiled::Number(n),
            Err(_) => Compiled::Text(raw.to_string()),
        },
        _ => Compiled::Text(raw.to_ascii_lowercase()),
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} {:?} {}",
            if self.negate { "!" } else { "" },
            self.field,
            self.op,
            self.raw
        )
    }
}
