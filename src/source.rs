use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::SourceConfig;
use crate::error::{ConfigError, OutboundError};
use crate::handshake::{parse_support_protocols, Protocol};
use crate::loader;
use crate::looper::Looper;
use crate::outbound::{ActiveProxyIp, IpPool, Offer};
use crate::resource::ProxyIp;
use crate::trace::{Scope, SharedRecorder, TracingRecorder};

const FIRST_LOAD_DELAY: Duration = Duration::from_millis(500);
const OFFER_BATCH: usize = 10;
// share of the reload interval the paced offers are spread over
const OFFER_SPREAD: f64 = 0.3;

/// Read-only facts about a source, plus the counters its queue publishes so
/// the router can read them without a round trip.
pub struct SourceMeta {
    pub config: SourceConfig,
    protocols: Vec<Protocol>,
    pub recorder: SharedRecorder,
    online: AtomicUsize,
    overflow: AtomicUsize,
}

impl SourceMeta {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    pub(crate) fn publish_counts(&self, online: usize, overflow: usize) {
        self.online.store(online, Ordering::Release);
        self.overflow.store(overflow, Ordering::Release);
    }

    pub fn online_count(&self) -> usize {
        self.online.load(Ordering::Acquire)
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow.load(Ordering::Acquire)
    }

    pub fn pool_empty(&self) -> bool {
        self.online_count() == 0
    }

    /// `(online + overflow) * 100 / pool_size`
    pub fn health_score(&self) -> f64 {
        (self.online_count() + self.overflow_count()) as f64 * 100.0
            / self.config.pool_size.max(1) as f64
    }

    /// Sends one event to both the source trace and the request trace.
    pub fn record_composed(&self, recorder: &SharedRecorder, message: &str) {
        self.recorder.record_event(message);
        recorder.record_event(message);
    }
}

/// One configured supplier bound to its ip pool and task queue.
#[derive(Clone)]
pub struct RuntimeIpSource {
    meta: Arc<SourceMeta>,
    looper: Looper<IpPool>,
}

impl RuntimeIpSource {
    /// Spawns the source queue and its reload / warm-connection schedules.
    pub fn start(config: SourceConfig) -> Result<Self, ConfigError> {
        let protocols = parse_support_protocols(&config.support_protocol)?;
        if protocols.is_empty() {
            return Err(ConfigError::UnknownProtocol(config.support_protocol.clone()));
        }
        let meta = Arc::new(SourceMeta {
            recorder: TracingRecorder::shared(Scope::Source, config.name.clone()),
            config,
            protocols,
            online: AtomicUsize::new(0),
            overflow: AtomicUsize::new(0),
        });
        let looper = Looper::spawn(
            format!("source-{}", meta.name()),
            IpPool::new(Arc::clone(&meta)),
        );
        let source = Self { meta, looper };
        source.schedule();

        info!(
            source = %source.name(),
            pool_size = source.meta.config.pool_size,
            protocols = ?source.meta.protocols,
            "ip source started"
        );
        Ok(source)
    }

    pub(crate) fn from_parts(meta: Arc<SourceMeta>, looper: Looper<IpPool>) -> Self {
        Self { meta, looper }
    }

    fn schedule(&self) {
        let config = &self.meta.config;
        if !config.load_url.trim().is_empty() {
            let source = self.clone();
            self.looper
                .post_delay(FIRST_LOAD_DELAY, move |pool, _| source.begin_load(pool));
            let source = self.clone();
            self.looper
                .schedule_at_fixed_rate(config.reload_interval(), move |pool, _| {
                    source.begin_load(pool)
                });
        }
        if config.make_conn_interval_ms > 0 {
            self.looper.schedule_at_fixed_rate(
                Duration::from_millis(config.make_conn_interval_ms),
                |pool, looper| pool.make_cache(looper),
            );
        }
    }

    /// Starts a download unless the previous one is still running.
    pub(crate) fn begin_load(&self, pool: &mut IpPool) {
        self.looper.check_looper();
        if pool.loading {
            self.meta
                .recorder
                .record_event("last download task not finished, skip this round");
            return;
        }
        pool.loading = true;

        let source = self.clone();
        tokio::spawn(async move {
            match loader::load(&source.meta.config).await {
                Ok(resources) => {
                    source
                        .meta
                        .recorder
                        .record_event(&format!("download {} proxy resources", resources.len()));
                    source.offer_paced(resources);
                }
                Err(err) => {
                    warn!(source = %source.name(), error = %err, "resource download failed");
                    source.meta.recorder.record_error("resource download failed", &err);
                }
            }
            source.looper.post(|pool, _| pool.loading = false);
        });
    }

    /// Offers `resources` in batches spread over the first part of the
    /// reload interval, so a large feed does not land all at once.
    pub fn offer_paced(&self, resources: Vec<ProxyIp>) {
        let count = resources.len();
        if count == 0 {
            return;
        }
        let reload_ms = self.meta.config.reload_interval().as_millis() as f64;
        let step_ms = reload_ms * OFFER_SPREAD / count as f64;

        for (i, batch) in resources.chunks(OFFER_BATCH).enumerate() {
            let batch: Vec<ProxyIp> = batch.iter().cloned().map(|r| self.fill_credentials(r)).collect();
            let delay = Duration::from_millis((step_ms * (OFFER_BATCH * i) as f64) as u64);
            self.looper.post_delay(delay, move |pool, looper| {
                let mut rejected = 0usize;
                for resource in batch {
                    if matches!(pool.offer_proxy(looper, resource), Offer::Invalid | Offer::Expired) {
                        rejected += 1;
                    }
                }
                if rejected > 0 {
                    pool.meta()
                        .recorder
                        .record_event(&format!("{} invalid or expired resources dropped", rejected));
                }
            });
        }
    }

    /// Offers a single resource right away.
    pub fn offer(&self, resource: ProxyIp) {
        let resource = self.fill_credentials(resource);
        self.looper.post(move |pool, looper| {
            pool.offer_proxy(looper, resource);
        });
    }

    fn fill_credentials(&self, mut resource: ProxyIp) -> ProxyIp {
        let config = &self.meta.config;
        if resource.user_pass().is_none() && !config.upstream_auth_user.trim().is_empty() {
            resource.user_name = Some(config.upstream_auth_user.clone());
            resource.password = Some(config.upstream_auth_password.clone());
        }
        resource
    }

    pub fn looper(&self) -> &Looper<IpPool> {
        &self.looper
    }

    pub fn meta(&self) -> &Arc<SourceMeta> {
        &self.meta
    }

    pub fn name(&self) -> &str {
        self.meta.name()
    }

    pub fn protocols(&self) -> &[Protocol] {
        self.meta.protocols()
    }

    pub fn pool_empty(&self) -> bool {
        self.meta.pool_empty()
    }

    pub fn online_count(&self) -> usize {
        self.meta.online_count()
    }

    pub fn overflow_count(&self) -> usize {
        self.meta.overflow_count()
    }

    pub fn health_score(&self) -> f64 {
        self.meta.health_score()
    }

    /// Picks the ip owning `hash` on this source's ring.
    pub async fn allocate_ip(
        &self,
        hash: u64,
        recorder: &SharedRecorder,
    ) -> Result<Arc<ActiveProxyIp>, OutboundError> {
        let ip = self
            .looper
            .call(move |pool, _| pool.allocate_ip(hash))
            .await?;
        match ip {
            Some(ip) => {
                recorder.record_event(&format!("allocate ip {} from source {}", ip, self.name()));
                Ok(ip)
            }
            None => Err(OutboundError::PoolEmpty(self.name().to_string())),
        }
    }

    /// Drops every ip and stops the queue once queued work is done.
    pub fn close(&self) {
        self.looper.post(|pool, looper| pool.destroy_all(looper));
        self.looper.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace;

    fn inline_source(load_url: &str, pool_size: usize) -> SourceConfig {
        SourceConfig {
            name: "inline".into(),
            enable: true,
            load_url: load_url.into(),
            pool_size,
            reload_interval_secs: 10,
            make_conn_interval_ms: 0,
            ..SourceConfig::default()
        }
    }

    async fn settle(source: &RuntimeIpSource) {
        source.looper().call(|_, _| ()).await.unwrap();
    }

    #[tokio::test]
    async fn start_rejects_empty_protocol_list() {
        let mut config = inline_source("", 1);
        config.support_protocol = " ".into();
        assert!(matches!(
            RuntimeIpSource::start(config),
            Err(ConfigError::UnknownProtocol(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_offers_in_paced_batches() {
        let source = RuntimeIpSource::start(inline_source("127.0.0.1:1000-1011", 20)).unwrap();
        assert!(source.pool_empty());

        // first load fires after 500ms, first batch lands immediately
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle(&source).await;
        assert_eq!(source.online_count(), 10);

        // 10s * 0.3 / 12 * 10 = 2.5s until the second batch
        tokio::time::sleep(Duration::from_secs(3)).await;
        settle(&source).await;
        assert_eq!(source.online_count(), 12);
        assert_eq!(source.health_score(), 60.0);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_loads_are_skipped() {
        let source = RuntimeIpSource::start(inline_source("127.0.0.1:2000", 5)).unwrap();
        source
            .looper()
            .call(|pool, _| pool.loading = true)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle(&source).await;
        assert!(source.pool_empty());
    }

    #[tokio::test]
    async fn source_credentials_fill_blank_resources() {
        let mut config = inline_source("", 2);
        config.upstream_auth_user = "vendor".into();
        config.upstream_auth_password = "secret".into();
        let source = RuntimeIpSource::start(config).unwrap();

        let mut own = ProxyIp::new("127.0.0.1", 3001);
        own.user_name = Some("mine".into());
        own.password = Some("pw".into());
        source.offer(ProxyIp::new("127.0.0.1", 3000));
        source.offer(own);
        settle(&source).await;

        let a = source.allocate_ip(0, &trace::nop()).await.unwrap();
        let creds: Vec<(String, String)> = source
            .looper()
            .call(|pool, _| {
                pool.online_ips()
                    .iter()
                    .filter_map(|ip| {
                        ip.resource()
                            .user_pass()
                            .map(|(u, p)| (u.to_string(), p.to_string()))
                    })
                    .collect()
            })
            .await
            .unwrap();
        assert!(a.resource().user_pass().is_some());
        assert_eq!(
            creds,
            vec![
                ("vendor".to_string(), "secret".to_string()),
                ("mine".to_string(), "pw".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn empty_pool_allocation_fails() {
        let source = RuntimeIpSource::start(inline_source("", 1)).unwrap();
        let err = source.allocate_ip(1, &trace::nop()).await.unwrap_err();
        assert!(matches!(err, OutboundError::PoolEmpty(name) if name == "inline"));
    }

    #[tokio::test]
    async fn close_destroys_ips() {
        let source = RuntimeIpSource::start(inline_source("", 1)).unwrap();
        source.offer(ProxyIp::new("127.0.0.1", 4000));
        let ip = source.allocate_ip(5, &trace::nop()).await.unwrap();

        source.close();
        while !source.looper().is_closed() {
            tokio::task::yield_now().await;
        }
        assert_eq!(ip.status(), crate::outbound::ActiveStatus::Destroy);
        assert!(source.pool_empty());
    }
}
