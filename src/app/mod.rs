pub mod metrics;
pub mod pipeline;
pub mod tracker;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::common::{Dialer, DialerConfig, ProxyError};
use crate::config::Config;
use crate::dns::{DnsFilter, DnsResolver};
use crate::proxy::connector::StealthConnector;
use crate::proxy::dpi::DpiEvasion;
use crate::proxy::group::LoadBalancer;
use crate::proxy::TrafficUnit;
use crate::router::{ContentFilter, ProcessPolicies, RuleEngine};

use metrics::{Metrics, MetricsSnapshot};
use pipeline::{Outcome, RequestPipeline};
use tracker::ConnectionTracker;

const RULE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DNS_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// 引擎：持有全部组件，负责后台任务的启停
pub struct Engine {
    config: Config,
    rules: Arc<RuleEngine>,
    dns: Option<Arc<DnsFilter>>,
    balancer: Option<Arc<LoadBalancer>>,
    pipeline: Arc<RequestPipeline>,
    metrics: Arc<Metrics>,
    tracker: Arc<ConnectionTracker>,
    /// 掩护流量任务的根 token，引擎销毁时取消
    root: CancellationToken,
    tasks: TaskTracker,
    running: Mutex<Option<CancellationToken>>,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let features = &config.features;

        let rules = Arc::new(RuleEngine::from_config(&config.rules)?);

        let dns = if features.dns_filtering {
            Some(Arc::new(DnsFilter::from_config(&config.dns)?))
        } else {
            None
        };

        let dialer_cfg = DialerConfig::with_timeout(config.timeouts.dial());
        let dialer = match &dns {
            Some(filter) => Dialer::with_resolver(dialer_cfg, filter.clone() as Arc<dyn DnsResolver>),
            None => Dialer::new(dialer_cfg),
        };

        let balancer = if features.load_balancing {
            Some(Arc::new(LoadBalancer::from_config(
                &config.upstreams,
                &config.load_balancer,
            )?))
        } else {
            None
        };

        let root = CancellationToken::new();
        let connector = StealthConnector::from_config(&config, Arc::new(dialer), root.clone())?;

        let metrics = Arc::new(Metrics::new());
        let tracker = Arc::new(ConnectionTracker::new());
        let mut pipeline = RequestPipeline::new(rules.clone(), Arc::new(connector))
            .with_metrics(metrics.clone())
            .with_tracker(tracker.clone())
            .with_read_timeout(config.timeouts.read());
        if features.process_filtering {
            pipeline = pipeline.with_process_policies(Arc::new(ProcessPolicies::from_config(
                &config.process_rules,
            )));
        }
        if let Some(dns) = &dns {
            pipeline = pipeline.with_dns_filter(dns.clone());
        }
        if let Some(lb) = &balancer {
            pipeline = pipeline.with_load_balancer(lb.clone());
        }
        if features.content_filtering {
            pipeline = pipeline.with_content_filter(Arc::new(ContentFilter::from_config(
                &config.content_filter,
            )?));
        }
        if features.dpi_evasion {
            pipeline = pipeline.with_dpi(DpiEvasion::from_config(&config.dpi));
        }

        info!(
            rules = rules.len(),
            upstreams = balancer.as_ref().map_or(0, |lb| lb.endpoints().len()),
            dns_filtering = dns.is_some(),
            obfuscation = features.obfuscation,
            tunneling = features.tunneling,
            "engine initialized"
        );

        Ok(Self {
            config,
            rules,
            dns,
            balancer,
            pipeline: Arc::new(pipeline),
            metrics,
            tracker,
            root,
            tasks: TaskTracker::new(),
            running: Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 启动后台任务：健康检查、规则过期清理、DNS 缓存清理
    pub fn start(&self) -> Result<()> {
        let mut state = self.state();
        if state.is_some() {
            return Err(ProxyError::AlreadyRunning.into());
        }
        let cancel = self.root.child_token();
        self.tasks.reopen();

        if let Some(lb) = &self.balancer {
            let monitor = Arc::new(lb.health_monitor(
                self.config.load_balancer.health_check_interval(),
                self.config.load_balancer.health_check_timeout(),
            ));
            self.tasks.spawn(monitor.run(cancel.clone()));
        }
        self.tasks
            .spawn(self.rules.clone().run_sweeper(RULE_SWEEP_INTERVAL, cancel.clone()));
        if let Some(dns) = &self.dns {
            self.tasks
                .spawn(dns.clone().run_purger(DNS_PURGE_INTERVAL, cancel.clone()));
        }

        *state = Some(cancel);
        info!("engine started");
        Ok(())
    }

    /// 停止：取消后台任务与在途单元，等待其退出，返回停止时仍打开的连接数
    pub async fn stop(&self) -> Result<usize> {
        let cancel = self.state().take().ok_or(ProxyError::NotRunning)?;
        let open = self.tracker.active_count();
        cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!(open_connections = open, "engine stopped");
        Ok(open)
    }

    pub fn is_running(&self) -> bool {
        self.state().is_some()
    }

    fn run_token(&self) -> Result<CancellationToken> {
        self.state().clone().ok_or_else(|| ProxyError::NotRunning.into())
    }

    /// 每个单元一个任务，失败只影响自身
    pub fn spawn_unit(&self, unit: TrafficUnit) -> Result<JoinHandle<Result<Outcome>>> {
        let cancel = self.run_token()?;
        let pipeline = self.pipeline.clone();
        Ok(self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(unit = %unit, "unit cancelled");
                    Err(ProxyError::Cancelled.into())
                }
                outcome = pipeline.process(unit.clone()) => outcome,
            }
        }))
    }

    pub fn spawn_stream<S>(&self, unit: TrafficUnit, client: S) -> Result<JoinHandle<Result<Outcome>>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = self.run_token()?;
        let pipeline = self.pipeline.clone();
        Ok(self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(ProxyError::Cancelled.into()),
                outcome = pipeline.handle_stream(unit, client) => outcome,
            }
        }))
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.rules.stats(), self.tracker.active_count())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub fn dns(&self) -> Option<&Arc<DnsFilter>> {
        self.dns.as_ref()
    }

    pub fn balancer(&self) -> Option<&Arc<LoadBalancer>> {
        self.balancer.as_ref()
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
