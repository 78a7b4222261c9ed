pub mod direct;
pub mod http;
pub mod socks5;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::common::{Address, HandshakeStage, ProxyError, ProxyStream};

pub use direct::DirectOutbound;
pub use http::HttpOutbound;
pub use socks5::Socks5Outbound;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 上游代理类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Http,
    Socks5,
}

impl UpstreamKind {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" | "http_proxy" | "connect" => Some(UpstreamKind::Http),
            "socks5" | "socks" => Some(UpstreamKind::Socks5),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UpstreamKind::Http => "http",
            UpstreamKind::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 上游认证信息
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// 用户名和密码都存在时才算配置了认证
    pub fn from_parts(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        match (username, password) {
            (Some(u), Some(p)) => Some(Self {
                username: u.to_string(),
                password: p.to_string(),
            }),
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// 建立到目标的基础连接（直连或经上游握手）
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn connect(&self, target: &Address) -> Result<ProxyStream>;
}

/// 把错误标注为某个握手阶段；已标注的错误保持原样
pub(crate) fn stage_error(stage: HandshakeStage, err: anyhow::Error) -> anyhow::Error {
    match err.downcast_ref::<ProxyError>() {
        Some(ProxyError::Handshake { .. }) => err,
        _ => ProxyError::handshake(stage, format!("{:#}", err)).into(),
    }
}

/// 带超时执行一个握手阶段
pub(crate) async fn run_stage<T, F>(stage: HandshakeStage, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(|e| stage_error(stage, e)),
        Err(_) => Err(ProxyError::handshake(stage, format!("timed out after {:?}", timeout)).into()),
    }
}
