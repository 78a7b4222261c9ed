use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::app::metrics::Metrics;
use crate::app::tracker::ConnectionTracker;
use crate::common::{Address, ProxyError, ProxyStream};
use crate::dns::{normalize_domain, DnsFilter};
use crate::proxy::connector::StealthConnector;
use crate::proxy::dpi::DpiEvasion;
use crate::proxy::group::{LoadBalancer, UpstreamLease};
use crate::proxy::relay::{exchange, relay};
use crate::proxy::sniff::sniff;
use crate::proxy::TrafficUnit;
use crate::router::{ContentFilter, Decision, ProcessPolicies, RuleEngine};

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RESPONSE: usize = 4 * 1024 * 1024;
/// 单个单元最多尝试的上游数
const MAX_UPSTREAM_ATTEMPTS: usize = 3;

/// 单个流量单元的处理结果
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    #[serde(serialize_with = "as_millis")]
    pub latency: Duration,
    #[serde(skip)]
    pub response: Vec<u8>,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl Outcome {
    fn stopped(decision: Decision, latency: Duration) -> Self {
        Self {
            decision,
            upstream: None,
            bytes_sent: 0,
            bytes_received: 0,
            latency,
            response: Vec::new(),
        }
    }
}

/// 放行后建立好的出站连接
struct Established {
    stream: ProxyStream,
    target: Address,
    lease: Option<UpstreamLease>,
    payload: Vec<u8>,
}

/// 请求流水线：分类 → 规则 → 进程策略 → DNS → 内容过滤 → 选上游 → 连接 → 转发
pub struct RequestPipeline {
    rules: Arc<RuleEngine>,
    processes: Option<Arc<ProcessPolicies>>,
    dns: Option<Arc<DnsFilter>>,
    content: Option<Arc<ContentFilter>>,
    balancer: Option<Arc<LoadBalancer>>,
    connector: Arc<StealthConnector>,
    dpi: Option<DpiEvasion>,
    metrics: Arc<Metrics>,
    tracker: Arc<ConnectionTracker>,
    read_timeout: Duration,
}

impl RequestPipeline {
    pub fn new(rules: Arc<RuleEngine>, connector: Arc<StealthConnector>) -> Self {
        Self {
            rules,
            processes: None,
            dns: None,
            content: None,
            balancer: None,
            connector,
            dpi: None,
            metrics: Arc::new(Metrics::new()),
            tracker: Arc::new(ConnectionTracker::new()),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_process_policies(mut self, policies: Arc<ProcessPolicies>) -> Self {
        self.processes = Some(policies);
        self
    }

    pub fn with_dns_filter(mut self, dns: Arc<DnsFilter>) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn with_content_filter(mut self, content: Arc<ContentFilter>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_load_balancer(mut self, balancer: Arc<LoadBalancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    pub fn with_dpi(mut self, dpi: DpiEvasion) -> Self {
        self.dpi = Some(dpi);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<ConnectionTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    /// 从负载补全协议与域名
    pub fn classify(unit: &mut TrafficUnit) {
        if let Some(domain) = unit.domain.as_deref() {
            let normalized = normalize_domain(domain);
            unit.domain = (!normalized.is_empty()).then_some(normalized);
        }
        let Some(payload) = unit.payload.as_deref() else {
            return;
        };
        let sniffed = sniff(payload, unit.dest_port);
        if let Some(protocol) = sniffed.protocol {
            unit.protocol = protocol;
        }
        if unit.domain.is_none() {
            unit.domain = sniffed.domain;
        }
    }

    /// 只做判定，不建立连接
    pub async fn decide(&self, unit: &mut TrafficUnit) -> Decision {
        Self::classify(unit);

        let decision = self.rules.evaluate(unit);
        if decision.stops_pipeline() {
            return decision;
        }

        if let Some(blocked) = self.processes.as_ref().and_then(|p| p.check(unit)) {
            return blocked;
        }

        if let (Some(dns), Some(domain)) = (&self.dns, unit.domain.as_deref()) {
            match dns.resolve(domain).await {
                Ok(verdict) => {
                    self.metrics.record_dns_query(verdict.is_blocked());
                    if verdict.is_blocked() {
                        return Decision::block(format!("domain {} blocked by {}", domain, verdict.reason));
                    }
                }
                Err(e) => {
                    self.metrics.record_dns_query(false);
                    // 交给连接器自行解析
                    warn!(domain = %domain, error = %e, "DNS filter lookup failed, continuing");
                }
            }
        }

        if let Some(content) = self.content.as_ref().and_then(|c| c.check(unit)) {
            if content.is_block() {
                return content;
            }
        }
        decision
    }

    async fn establish(&self, unit: &TrafficUnit) -> Result<Established> {
        let target = unit
            .target()
            .ok_or_else(|| ProxyError::Protocol(format!("traffic unit {} has no destination", unit)))?;

        let mut payload = unit.payload.clone().unwrap_or_default();
        if let Some(rewritten) = self.dpi.as_ref().and_then(|d| d.rewrite_payload(&payload)) {
            self.metrics.record_dpi_evasion();
            payload = rewritten;
        }

        let (stream, lease) = self.connect(&target).await?;
        self.metrics
            .record_connection(self.connector.is_tunneled(), self.connector.is_obfuscated());
        Ok(Established {
            stream,
            target,
            lease,
            payload,
        })
    }

    /// 选上游并连接；值得换上游的失败会在下一个未试过的健康上游上重试
    async fn connect(&self, target: &Address) -> Result<(ProxyStream, Option<UpstreamLease>)> {
        let Some(lb) = &self.balancer else {
            return Ok((self.connector.connect(target, None).await?, None));
        };

        let mut tried: Vec<String> = Vec::new();
        let mut last_err = None;
        while tried.len() < MAX_UPSTREAM_ATTEMPTS {
            let Some(lease) = lb.select_upstream_excluding(&tried) else {
                break;
            };
            self.metrics.record_upstream_selected();
            match self.connector.connect(target, Some(lease.endpoint().as_ref())).await {
                Ok(stream) => return Ok((stream, Some(lease))),
                Err(e) => {
                    let switch = e
                        .downcast_ref::<ProxyError>()
                        .is_some_and(ProxyError::should_switch_upstream);
                    if !switch {
                        return Err(e);
                    }
                    warn!(upstream = %lease.name, target = %target, error = %e, "upstream failed, trying another");
                    tried.push(lease.name.clone());
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ProxyError::NoUpstream.into()))
    }

    fn finish(&self, decision: &Decision, result: &Result<Outcome>, started: Instant) {
        match result {
            Ok(outcome) => {
                self.metrics.record_decision(decision);
                self.metrics.record_bytes(outcome.bytes_sent, outcome.bytes_received);
            }
            Err(_) => self.metrics.record_failure(),
        }
        self.metrics.record_latency(started.elapsed());
    }

    /// 处理一个流量单元：判定，放行则经连接器发送负载并读回应答
    pub async fn process(&self, mut unit: TrafficUnit) -> Result<Outcome> {
        let started = Instant::now();
        self.metrics.record_request();

        let decision = self.decide(&mut unit).await;
        if decision.stops_pipeline() {
            info!(unit = %unit, decision = %decision, "traffic stopped");
            self.metrics.record_decision(&decision);
            self.metrics.record_latency(started.elapsed());
            return Ok(Outcome::stopped(decision, started.elapsed()));
        }

        let result = async {
            let mut est = self.establish(&unit).await?;
            let upstream = est.lease.as_ref().map(|l| l.name.clone());
            let guard = self.tracker.track(est.target.to_string(), upstream.as_deref());
            let (sent, response) =
                exchange(&mut est.stream, &est.payload, self.read_timeout, MAX_RESPONSE).await?;
            guard.add_traffic(sent, response.len() as u64);
            Ok(Outcome {
                decision: decision.clone(),
                upstream,
                bytes_sent: sent,
                bytes_received: response.len() as u64,
                latency: started.elapsed(),
                response,
            })
        }
        .await;

        if let Err(e) = &result {
            warn!(unit = %unit, error = %e, "traffic unit failed");
        } else {
            debug!(unit = %unit, "traffic unit forwarded");
        }
        self.finish(&decision, &result, started);
        result
    }

    /// 处理一个活连接：判定后把客户端与出站连接双向对接
    ///
    /// `unit.payload` 视为已从客户端读出的首包，会先发给出站端。
    pub async fn handle_stream<S>(&self, mut unit: TrafficUnit, mut client: S) -> Result<Outcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let started = Instant::now();
        self.metrics.record_request();

        let decision = self.decide(&mut unit).await;
        if decision.stops_pipeline() {
            info!(unit = %unit, decision = %decision, "connection stopped");
            let _ = client.shutdown().await;
            self.metrics.record_decision(&decision);
            self.metrics.record_latency(started.elapsed());
            return Ok(Outcome::stopped(decision, started.elapsed()));
        }

        let result = async {
            let mut est = self.establish(&unit).await?;
            let upstream = est.lease.as_ref().map(|l| l.name.clone());
            let guard = self.tracker.track(est.target.to_string(), upstream.as_deref());
            if !est.payload.is_empty() {
                est.stream.write_all(&est.payload).await?;
            }
            let (up, down) = relay(&mut client, &mut est.stream).await?;
            let sent = up + est.payload.len() as u64;
            guard.add_traffic(sent, down);
            Ok(Outcome {
                decision: decision.clone(),
                upstream,
                bytes_sent: sent,
                bytes_received: down,
                latency: started.elapsed(),
                response: Vec::new(),
            })
        }
        .await;

        if let Err(e) = &result {
            warn!(unit = %unit, error = %e, "connection failed");
        }
        self.finish(&decision, &result, started);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dialer;
    use crate::dns::filter::tests::StaticResolver;
    use crate::dns::{DnsResolver, DomainList};
    use crate::proxy::group::{LbStrategy, UpstreamEndpoint};
    use crate::proxy::outbound::UpstreamKind;
    use crate::proxy::sniff::tests::dns_query;
    use crate::proxy::Protocol;
    use crate::router::{Category, CategoryAction, Condition, Field, Operator, Rule, RuleAction};
    use std::net::SocketAddr;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
    use tokio::net::TcpListener;

    /// 单次应答的 HTTP CONNECT 代理；200 时把 4 字节回显
    async fn http_proxy(status: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut sock = BufReader::new(sock);
            loop {
                let mut line = String::new();
                sock.read_line(&mut line).await.unwrap();
                if line.trim_end().is_empty() {
                    break;
                }
            }
            let reply = format!("HTTP/1.1 {}\r\n\r\n", status);
            sock.get_mut().write_all(reply.as_bytes()).await.unwrap();
            if status.starts_with("200") {
                let mut buf = [0u8; 4];
                sock.read_exact(&mut buf).await.unwrap();
                sock.get_mut().write_all(&buf).await.unwrap();
            }
        });
        addr
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn balancer(upstreams: &[(&str, u16)]) -> Arc<LoadBalancer> {
        let eps = upstreams
            .iter()
            .map(|(name, port)| Arc::new(UpstreamEndpoint::new(*name, UpstreamKind::Http, "127.0.0.1", *port)))
            .collect();
        Arc::new(LoadBalancer::new(eps, LbStrategy::LeastConnections))
    }

    fn pipeline(rules: RuleEngine) -> RequestPipeline {
        let connector = StealthConnector::new(Arc::new(Dialer::default_dialer()));
        RequestPipeline::new(Arc::new(rules), Arc::new(connector)).with_read_timeout(Duration::from_secs(2))
    }

    fn block_port(port: u16) -> Rule {
        Rule::new("block-port", 10)
            .when(Condition::new(Field::DestPort, Operator::Equals, port.to_string(), false))
            .then(RuleAction::Block)
    }

    #[test]
    fn classify_sniffs_http_host() {
        let mut unit = TrafficUnit::new(Protocol::Tcp, 80)
            .with_payload(b"GET / HTTP/1.1\r\nHost: Example.COM\r\n\r\n".to_vec());
        RequestPipeline::classify(&mut unit);
        assert_eq!(unit.protocol, Protocol::Http);
        assert_eq!(unit.domain.as_deref(), Some("example.com"));

        let mut unit = TrafficUnit::new(Protocol::Tcp, 443).with_domain("WWW.Example.com.");
        RequestPipeline::classify(&mut unit);
        assert_eq!(unit.domain.as_deref(), Some("www.example.com"));
    }

    #[test]
    fn dns_query_keeps_resolver_as_target() {
        let mut unit = TrafficUnit::new(Protocol::Udp, 53)
            .with_dest_ip("8.8.8.8".parse().unwrap())
            .with_payload(dns_query("example.com"));
        RequestPipeline::classify(&mut unit);
        assert_eq!(unit.protocol, Protocol::Dns);
        assert_eq!(unit.domain.as_deref(), Some("example.com"));
        assert_eq!(unit.target(), Some(Address::Ip("8.8.8.8:53".parse().unwrap())));
    }

    #[tokio::test]
    async fn dns_unit_is_forwarded_to_dest_ip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let query = dns_query("example.com");
        let expected = query.clone();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; expected.len()];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, expected);
            sock.write_all(b"answer").await.unwrap();
        });

        let p = pipeline(RuleEngine::new());
        let unit = TrafficUnit::new(Protocol::Dns, addr.port())
            .with_dest_ip(addr.ip())
            .with_domain("example.com")
            .with_payload(query);
        let outcome = p.process(unit).await.unwrap();
        assert_eq!(outcome.response, b"answer");
    }

    #[tokio::test]
    async fn content_category_blocks_after_rules() {
        let content = ContentFilter::new();
        let mut cat = Category::new("gambling", CategoryAction::Block);
        cat.add_domain("casino.example");
        content.add_category(cat);
        let p = pipeline(RuleEngine::new()).with_content_filter(Arc::new(content));

        let mut unit = TrafficUnit::new(Protocol::Tcp, 80)
            .with_payload(b"GET /slots HTTP/1.1\r\nHost: www.casino.example\r\n\r\n".to_vec());
        let d = p.decide(&mut unit).await;
        assert!(d.is_block());
        assert!(d.reason.contains("http://www.casino.example/slots"));

        let mut other = TrafficUnit::new(Protocol::Tcp, 443).with_domain("news.example");
        assert!(!p.decide(&mut other).await.stops_pipeline());
    }

    #[tokio::test]
    async fn failed_upstream_is_skipped_for_the_next() {
        let dead = closed_port().await;
        let good = http_proxy("200 Connection established").await;
        let p = pipeline(RuleEngine::new()).with_load_balancer(balancer(&[("p1", dead), ("p2", good.port())]));

        let unit = TrafficUnit::new(Protocol::Tcp, 443)
            .with_dest_ip("10.0.0.1".parse().unwrap())
            .with_payload(b"ping".to_vec());
        let outcome = p.process(unit).await.unwrap();
        assert_eq!(outcome.upstream.as_deref(), Some("p2"));
        assert_eq!(outcome.response, b"ping");
        assert_eq!(p.metrics().snapshot(Vec::new(), 0).load_balancer_hits, 2);
    }

    #[tokio::test]
    async fn auth_failure_does_not_switch_upstream() {
        let rejecting = http_proxy("407 Proxy Authentication Required").await;
        let untouched = closed_port().await;
        let p = pipeline(RuleEngine::new())
            .with_load_balancer(balancer(&[("p1", rejecting.port()), ("p2", untouched)]));

        let unit = TrafficUnit::new(Protocol::Tcp, 443).with_dest_ip("10.0.0.1".parse().unwrap());
        let err = p.process(unit).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProxyError>(),
            Some(ProxyError::Handshake { stage: crate::common::HandshakeStage::Auth, .. })
        ));
        assert_eq!(p.metrics().snapshot(Vec::new(), 0).load_balancer_hits, 1);
    }

    #[tokio::test]
    async fn blocked_unit_never_dials() {
        let rules = RuleEngine::new();
        rules.add_rule(block_port(853));
        let p = pipeline(rules);

        let unit = TrafficUnit::new(Protocol::Tcp, 853).with_dest_ip("127.0.0.1".parse().unwrap());
        let outcome = p.process(unit).await.unwrap();
        assert!(outcome.decision.is_block());
        assert_eq!(outcome.bytes_sent, 0);
        let snap = p.metrics().snapshot(Vec::new(), 0);
        assert_eq!(snap.blocked, 1);
        assert_eq!(snap.requests_processed, 1);
    }

    #[tokio::test]
    async fn dns_block_stops_and_failure_continues() {
        let mut ads = DomainList::new("ads");
        ads.insert_domain("ads.example");
        let dns = DnsFilter::new(vec![Arc::new(StaticResolver::new(&[])) as Arc<dyn DnsResolver>]);
        dns.add_blocklist(ads);
        let p = pipeline(RuleEngine::new()).with_dns_filter(Arc::new(dns));

        let mut unit = TrafficUnit::new(Protocol::Https, 443).with_domain("ads.example");
        let d = p.decide(&mut unit).await;
        assert!(d.is_block());
        assert!(d.reason.contains("ads"));

        // 解析失败不阻断
        let mut unit = TrafficUnit::new(Protocol::Https, 443).with_domain("unknown.example");
        let d = p.decide(&mut unit).await;
        assert!(!d.stops_pipeline());
        let snap = p.metrics().snapshot(Vec::new(), 0);
        assert_eq!(snap.dns_queries, 2);
        assert_eq!(snap.dns_blocked, 1);
    }

    #[tokio::test]
    async fn allowed_unit_is_forwarded_directly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"pong").await.unwrap();
        });

        let p = pipeline(RuleEngine::new());
        let unit = TrafficUnit::new(Protocol::Tcp, addr.port())
            .with_dest_ip(addr.ip())
            .with_payload(b"ping".to_vec());
        let outcome = p.process(unit).await.unwrap();
        assert_eq!(outcome.response, b"pong");
        assert_eq!(outcome.bytes_sent, 4);
        assert_eq!(outcome.bytes_received, 4);
        assert!(outcome.upstream.is_none());
        assert_eq!(p.tracker().active_count(), 0);
    }

    #[tokio::test]
    async fn missing_destination_is_an_error() {
        let p = pipeline(RuleEngine::new());
        assert!(p.process(TrafficUnit::new(Protocol::Tcp, 80)).await.is_err());
        assert_eq!(p.metrics().snapshot(Vec::new(), 0).failed, 1);
    }
}
