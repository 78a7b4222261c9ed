use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::{stage_error, OutboundHandler};
use crate::common::{Address, Dialer, HandshakeStage, ProxyStream};

/// 不经上游，直接拨号目标
pub struct DirectOutbound {
    dialer: Arc<Dialer>,
}

impl DirectOutbound {
    pub fn new(dialer: Arc<Dialer>) -> Self {
        Self { dialer }
    }
}

#[async_trait]
impl OutboundHandler for DirectOutbound {
    fn kind(&self) -> &'static str {
        "direct"
    }

    async fn connect(&self, target: &Address) -> Result<ProxyStream> {
        let stream = self
            .dialer
            .connect_addr(target)
            .await
            .map_err(|e| stage_error(HandshakeStage::Dial, e))?;
        debug!(target = %target, "direct connect");
        Ok(Box::new(stream))
    }
}
