//! Top-level routing: which source serves a session, and which ip a session
//! stuck to last time.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::GlobalSettings;
use crate::connection::UpstreamConn;
use crate::error::OutboundError;
use crate::hashring::{hash_key, HashRing};
use crate::looper::Looper;
use crate::outbound::{ActiveProxyIp, ActiveStatus};
use crate::source::RuntimeIpSource;
use crate::trace::SharedRecorder;

const RATIO_RELOAD_INTERVAL: Duration = Duration::from_secs(300);
const ROUTE_TTL: Duration = Duration::from_secs(60);
const ROUTE_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Scales configured ratios by source health.
///
/// Small ratios are first tripled so that scaling still leaves room to tell
/// sources apart. Every result is floored at 1, a configured 0 included; only
/// fixed ratios take a source off the ring.
pub fn float_ratios(ratios: &[(u32, f64)]) -> Vec<u32> {
    let expand = ratios.iter().any(|(r, _)| *r == 1 || *r == 2);
    ratios
        .iter()
        .map(|&(ratio, health)| {
            let ratio = if expand { ratio * 3 } else { ratio };
            ((ratio as f64 * health / 100.0) as u32).max(1)
        })
        .collect()
}

struct Route {
    ip: Arc<ActiveProxyIp>,
    last_access: Instant,
}

/// Session hash to ip affinity, expiring after a minute without access.
/// Every entry holds one reference on its ip, released on eviction.
pub struct RouteCache {
    routes: HashMap<u64, Route>,
    ttl: Duration,
}

impl RouteCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            routes: HashMap::new(),
            ttl,
        }
    }

    pub fn get(&mut self, session_hash: u64, now: Instant) -> Option<Arc<ActiveProxyIp>> {
        let route = self.routes.get_mut(&session_hash)?;
        if now.duration_since(route.last_access) < self.ttl
            && route.ip.status() != ActiveStatus::Destroy
        {
            route.last_access = now;
            return Some(Arc::clone(&route.ip));
        }
        self.evict(session_hash);
        None
    }

    pub fn put(&mut self, session_hash: u64, ip: Arc<ActiveProxyIp>, now: Instant) {
        if let Some(route) = self.routes.get_mut(&session_hash) {
            if Arc::ptr_eq(&route.ip, &ip) {
                route.last_access = now;
                return;
            }
        }
        ip.refresh_ref_session_hash(session_hash, true);
        let replaced = self.routes.insert(
            session_hash,
            Route {
                ip,
                last_access: now,
            },
        );
        if let Some(old) = replaced {
            old.ip.refresh_ref_session_hash(session_hash, false);
        }
    }

    fn evict(&mut self, session_hash: u64) {
        if let Some(route) = self.routes.remove(&session_hash) {
            route.ip.refresh_ref_session_hash(session_hash, false);
        }
    }

    /// Drops expired routes, returns how many went.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<u64> = self
            .routes
            .iter()
            .filter(|(_, route)| now.duration_since(route.last_access) >= self.ttl)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &expired {
            self.evict(*hash);
        }
        expired.len()
    }

    pub fn clear(&mut self) {
        let hashes: Vec<u64> = self.routes.keys().copied().collect();
        for hash in hashes {
            self.evict(hash);
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Routing state, owned by the compose queue.
pub struct Router {
    sources: HashMap<String, RuntimeIpSource>,
    ratios: Vec<(String, u32)>,
    source_keys: Vec<String>,
    ring: HashRing<String>,
    routes: RouteCache,
    enable_float_ratio: bool,
}

impl Router {
    fn new(sources: Vec<RuntimeIpSource>, enable_float_ratio: bool) -> Self {
        let ratios = sources
            .iter()
            .map(|s| (s.name().to_string(), s.meta().config.ratio))
            .collect();
        let source_keys = sources
            .iter()
            .map(|s| s.name().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Self {
            sources: sources
                .into_iter()
                .map(|s| (s.name().to_string(), s))
                .collect(),
            ratios,
            source_keys,
            ring: HashRing::new(),
            routes: RouteCache::new(ROUTE_TTL),
            enable_float_ratio,
        }
    }

    /// Rebuilds the source ring from the configured ratios.
    pub fn reload_ratio(&mut self) {
        let effective: Vec<u32> = if self.enable_float_ratio {
            let inputs: Vec<(u32, f64)> = self
                .ratios
                .iter()
                .map(|(name, ratio)| {
                    let health = self.sources.get(name).map_or(0.0, |s| s.health_score());
                    (*ratio, health)
                })
                .collect();
            float_ratios(&inputs)
        } else {
            self.ratios.iter().map(|(_, ratio)| *ratio).collect()
        };

        let mut ring = HashRing::new();
        for ((name, _), ratio) in self.ratios.iter().zip(&effective) {
            for i in 1..=*ratio {
                ring.insert(hash_key(&format!("{}_##_{}", name, i)), name.clone());
            }
        }
        debug!(ratios = ?effective, slots = ring.len(), "source ratio reloaded");
        self.ring = ring;
    }

    /// The ring's source for `session_hash`, or the next source in the
    /// fixed key order that still has ips.
    pub fn allocate_source(
        &self,
        session_hash: u64,
        recorder: &SharedRecorder,
    ) -> Result<RuntimeIpSource, OutboundError> {
        let prefer = self.ring.lookup(session_hash).ok_or(OutboundError::NoSource)?;
        recorder.record_event(&format!("map route to source: {}", prefer));
        let source = self
            .sources
            .get(prefer)
            .ok_or_else(|| OutboundError::UnknownSource(prefer.clone()))?;
        if !source.pool_empty() {
            return Ok(source.clone());
        }

        let len = self.source_keys.len();
        if len > 1 {
            recorder.record_event("source has no ip resource, try next source");
            let start = (hash_key(prefer) % len as u64) as usize + len;
            for i in 0..len {
                let key = &self.source_keys[(start + i) % len];
                if key == prefer {
                    continue;
                }
                if let Some(candidate) = self.sources.get(key).filter(|s| !s.pool_empty()) {
                    return Ok(candidate.clone());
                }
            }
        }
        Err(OutboundError::PoolEmpty(prefer.clone()))
    }

    pub fn sources(&self) -> impl Iterator<Item = &RuntimeIpSource> {
        self.sources.values()
    }
}

/// Handle on the router queue, shared by every inbound session.
#[derive(Clone)]
pub struct ProxyCompose {
    looper: Looper<Router>,
    settings: Arc<GlobalSettings>,
}

impl ProxyCompose {
    pub fn start(settings: GlobalSettings, sources: Vec<RuntimeIpSource>) -> Self {
        info!(sources = sources.len(), "starting proxy compose");
        let looper = Looper::spawn(
            "compose",
            Router::new(sources, settings.enable_float_ratio),
        );
        looper.post(|router, _| router.reload_ratio());
        looper.schedule_at_fixed_rate(RATIO_RELOAD_INTERVAL, |router, _| router.reload_ratio());
        looper.schedule_at_fixed_rate(ROUTE_SWEEP_INTERVAL, |router, _| {
            let expired = router.routes.sweep(Instant::now());
            if expired > 0 {
                debug!(expired, remaining = router.routes.len(), "route cache swept");
            }
        });
        Self {
            looper,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn looper(&self) -> &Looper<Router> {
        &self.looper
    }

    /// Rebuilds the ratio ring now instead of waiting for the next period.
    pub fn reload_ratio(&self) {
        self.looper.post(|router, _| router.reload_ratio());
    }

    pub async fn allocate_ip_source(
        &self,
        session_hash: u64,
        recorder: &SharedRecorder,
    ) -> Result<RuntimeIpSource, OutboundError> {
        let recorder = Arc::clone(recorder);
        self.looper
            .call(move |router, _| router.allocate_source(session_hash, &recorder))
            .await?
    }

    /// Source, then ip, then a connection to that ip.
    pub async fn connect_to_outbound(
        &self,
        session_hash: u64,
        recorder: &SharedRecorder,
        tag: &str,
    ) -> Result<UpstreamConn, OutboundError> {
        let source = match self.allocate_ip_source(session_hash, recorder).await {
            Ok(source) => source,
            Err(err) => {
                recorder.record_error(&format!("{}allocate ip source failed", tag), &err);
                return Err(err);
            }
        };
        recorder.record_event(&format!("{}allocate ip source success: {}", tag, source.name()));
        let ip = source.allocate_ip(session_hash, recorder).await?;
        ip.borrow_connection(recorder, tag).await
    }

    /// The ip this session used last, unless it expired or was destroyed.
    pub async fn fetch_cached_session(
        &self,
        session_hash: u64,
    ) -> Result<Option<Arc<ActiveProxyIp>>, OutboundError> {
        if self.settings.random_turning {
            return Ok(None);
        }
        Ok(self
            .looper
            .call(move |router, _| router.routes.get(session_hash, Instant::now()))
            .await?)
    }

    pub fn mark_session_use(
        &self,
        session_hash: u64,
        ip: &Arc<ActiveProxyIp>,
        recorder: &SharedRecorder,
    ) {
        if self.settings.random_turning {
            return;
        }
        recorder.record_event("add session route mapping");
        let ip = Arc::clone(ip);
        self.looper
            .post(move |router, _| router.routes.put(session_hash, ip, Instant::now()));
    }

    /// Closes every source and then the router itself.
    pub fn close(&self) {
        self.looper.post(|router, looper| {
            router.routes.clear();
            for source in router.sources() {
                source.close();
            }
            looper.close();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::resource::ProxyIp;
    use crate::trace;

    fn source(name: &str, ratio: u32) -> RuntimeIpSource {
        RuntimeIpSource::start(SourceConfig {
            name: name.into(),
            enable: true,
            pool_size: 4,
            ratio,
            make_conn_interval_ms: 0,
            ..SourceConfig::default()
        })
        .unwrap()
    }

    async fn fill(source: &RuntimeIpSource, port: u16) {
        source.offer(ProxyIp::new("127.0.0.1", port));
        source.looper().call(|_, _| ()).await.unwrap();
    }

    #[test]
    fn float_ratio_scales_by_health() {
        assert_eq!(float_ratios(&[(4, 50.0)]), vec![2]);
        assert_eq!(float_ratios(&[(4, 100.0), (6, 0.0)]), vec![4, 1]);
        // a ratio of 1 or 2 triples every ratio first
        assert_eq!(float_ratios(&[(1, 50.0), (4, 100.0)]), vec![1, 12]);
        assert_eq!(float_ratios(&[(2, 100.0), (0, 100.0)]), vec![6, 1]);
    }

    #[tokio::test]
    async fn zero_ratio_only_leaves_ring_without_float_ratio() {
        let mut fixed = Router::new(vec![source("a", 2), source("b", 0)], false);
        fixed.reload_ratio();
        assert!(fixed.ring.values().all(|s| s.as_str() == "a"));

        let mut floating = Router::new(vec![source("a", 2), source("b", 0)], true);
        floating.reload_ratio();
        let slots: Vec<&String> = floating.ring.values().collect();
        assert_eq!(slots.iter().filter(|s| s.as_str() == "b").count(), 1);
    }

    #[tokio::test]
    async fn ring_weights_follow_ratio() {
        let mut router = Router::new(vec![source("a", 3), source("b", 1)], false);
        router.reload_ratio();
        let slots: Vec<&String> = router.ring.values().collect();
        assert_eq!(slots.iter().filter(|s| s.as_str() == "a").count(), 3);
        assert_eq!(slots.iter().filter(|s| s.as_str() == "b").count(), 1);
    }

    #[tokio::test]
    async fn empty_preferred_source_falls_back() {
        let a = source("a", 1);
        let b = source("b", 1);
        fill(&b, 9000).await;

        let mut router = Router::new(vec![a, b], false);
        router.reload_ratio();
        for hash in [0, 1, u64::MAX / 2, u64::MAX] {
            let chosen = router.allocate_source(hash, &trace::nop()).unwrap();
            assert_eq!(chosen.name(), "b");
        }
    }

    #[tokio::test]
    async fn all_sources_empty_is_pool_empty() {
        let mut router = Router::new(vec![source("a", 1), source("b", 2)], false);
        router.reload_ratio();
        assert!(matches!(
            router.allocate_source(42, &trace::nop()),
            Err(OutboundError::PoolEmpty(_))
        ));

        let empty = Router::new(Vec::new(), false);
        assert!(matches!(
            empty.allocate_source(42, &trace::nop()),
            Err(OutboundError::NoSource)
        ));
    }

    #[tokio::test]
    async fn route_cache_expires_and_releases_reference() {
        let src = source("a", 1);
        fill(&src, 9100).await;
        let ip = src.allocate_ip(7, &trace::nop()).await.unwrap();
        let seq = ip.seq();
        let refs = |src: &RuntimeIpSource| {
            let src = src.clone();
            async move { src.looper().call(move |pool, _| pool.ref_count(seq)).await.unwrap() }
        };

        let mut cache = RouteCache::new(ROUTE_TTL);
        let t0 = Instant::now();
        cache.put(11, Arc::clone(&ip), t0);
        cache.put(11, Arc::clone(&ip), t0);
        assert_eq!(refs(&src).await, 1);

        assert!(cache.get(11, t0 + Duration::from_secs(59)).is_some());
        // access refreshed the entry
        assert!(cache.get(11, t0 + Duration::from_secs(100)).is_some());
        assert!(cache.get(11, t0 + Duration::from_secs(161)).is_none());
        assert!(cache.is_empty());
        assert_eq!(refs(&src).await, 0);
    }

    #[tokio::test]
    async fn destroyed_ip_is_not_returned() {
        let src = source("a", 1);
        fill(&src, 9200).await;
        let ip = src.allocate_ip(7, &trace::nop()).await.unwrap();

        let mut cache = RouteCache::new(ROUTE_TTL);
        let now = Instant::now();
        cache.put(3, Arc::clone(&ip), now);
        ip.advance(ActiveStatus::Destroy);
        assert!(cache.get(3, now).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn sweep_drops_only_stale_routes() {
        let src = source("a", 1);
        fill(&src, 9300).await;
        let ip = src.allocate_ip(7, &trace::nop()).await.unwrap();

        let mut cache = RouteCache::new(ROUTE_TTL);
        let t0 = Instant::now();
        cache.put(1, Arc::clone(&ip), t0);
        cache.put(2, Arc::clone(&ip), t0 + Duration::from_secs(30));
        assert_eq!(cache.sweep(t0 + Duration::from_secs(61)), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn session_affinity_round_trip() {
        let src = source("a", 1);
        fill(&src, 9400).await;
        let compose = ProxyCompose::start(GlobalSettings::default(), vec![src.clone()]);
        let ip = src.allocate_ip(7, &trace::nop()).await.unwrap();

        assert!(compose.fetch_cached_session(99).await.unwrap().is_none());
        compose.mark_session_use(99, &ip, &trace::nop());
        let cached = compose.fetch_cached_session(99).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&cached, &ip));

        let random = ProxyCompose::start(
            GlobalSettings {
                random_turning: true,
                ..GlobalSettings::default()
            },
            vec![src],
        );
        random.mark_session_use(99, &ip, &trace::nop());
        assert!(random.fetch_cached_session(99).await.unwrap().is_none());
    }
}
