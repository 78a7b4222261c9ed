use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::UpstreamEndpoint;
use crate::common::{Dialer, DialerConfig};

/// 上游健康检查器：周期性地对每个端点做一次限时 TCP 拨号
pub struct HealthMonitor {
    endpoints: Vec<Arc<UpstreamEndpoint>>,
    dialer: Dialer,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(endpoints: Vec<Arc<UpstreamEndpoint>>, interval: Duration, timeout: Duration) -> Self {
        Self {
            endpoints,
            dialer: Dialer::new(DialerConfig::with_timeout(timeout)),
            interval,
        }
    }

    /// 探测单个端点，返回是否健康
    pub async fn check_one(&self, endpoint: &UpstreamEndpoint) -> bool {
        let was_healthy = endpoint.is_healthy();
        let start = Instant::now();
        match self.dialer.connect_addr(&endpoint.server()).await {
            Ok(_stream) => {
                let latency = start.elapsed();
                endpoint.mark_success(latency);
                if !was_healthy {
                    info!(upstream = %endpoint.name, latency_ms = latency.as_millis() as u64, "upstream recovered");
                } else {
                    debug!(upstream = %endpoint.name, latency_ms = latency.as_millis() as u64, "health check ok");
                }
                true
            }
            Err(e) => {
                endpoint.mark_failure();
                warn!(
                    upstream = %endpoint.name,
                    errors = endpoint.consecutive_errors(),
                    error = %e,
                    "health check failed"
                );
                false
            }
        }
    }

    /// 并发探测全部端点，返回健康数量
    pub async fn check_all(&self) -> usize {
        let results = join_all(self.endpoints.iter().map(|ep| self.check_one(ep))).await;
        results.into_iter().filter(|ok| *ok).count()
    }

    /// 立即探测一轮，之后按间隔循环，直到取消
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            upstreams = self.endpoints.len(),
            interval_secs = self.interval.as_secs(),
            "starting health check loop"
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let healthy = self.check_all().await;
                    debug!(healthy, total = self.endpoints.len(), "health check round");
                }
            }
        }
        debug!("health check loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::outbound::UpstreamKind;
    use tokio::net::TcpListener;

    fn endpoint(port: u16) -> Arc<UpstreamEndpoint> {
        Arc::new(UpstreamEndpoint::new("p1", UpstreamKind::Http, "127.0.0.1", port))
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn failure_then_recovery() {
        let port = closed_port().await;
        let ep = endpoint(port);
        let monitor = HealthMonitor::new(vec![ep.clone()], Duration::from_secs(30), Duration::from_secs(2));

        assert!(!monitor.check_one(&ep).await);
        assert!(!ep.is_healthy());
        assert_eq!(ep.consecutive_errors(), 1);

        let _listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        assert!(monitor.check_one(&ep).await);
        assert!(ep.is_healthy());
        assert_eq!(ep.consecutive_errors(), 0);
        assert!(ep.latency().is_some());
    }

    #[tokio::test]
    async fn check_all_counts_healthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up = endpoint(listener.local_addr().unwrap().port());
        let down = endpoint(closed_port().await);
        let monitor = HealthMonitor::new(vec![up, down.clone()], Duration::from_secs(30), Duration::from_secs(2));
        assert_eq!(monitor.check_all().await, 1);
        assert!(!down.is_healthy());
    }

    #[tokio::test]
    async fn run_checks_immediately_and_stops_on_cancel() {
        let ep = endpoint(closed_port().await);
        let monitor = Arc::new(HealthMonitor::new(
            vec![ep.clone()],
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!ep.is_healthy());
        cancel.cancel();
        task.await.unwrap();
    }
}
