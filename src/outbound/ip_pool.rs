use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tracing::{debug, info};

use crate::connection::CachedConn;
use crate::error::ConnectErrorKind;
use crate::hashring::{hash_key, HashRing};
use crate::looper::Looper;
use crate::outbound::{ActiveProxyIp, ActiveStatus};
use crate::resource::{DropReason, ProxyIp};
use crate::source::{RuntimeIpSource, SourceMeta};
use crate::trace::{self, SharedRecorder};

/// Offline ips stay usable by their sessions this long at most.
pub const DESTROY_GRACE: Duration = Duration::from_secs(60);

const IDLE_SCAN_LIMIT: usize = 50;
const DEFAULT_MAX_ALIVE_SECS: u64 = 300;
const CACHE_FILL_LIMIT: usize = 3;
// most warm connections an ip keeps parked, whoever returned them
const CACHE_CAPACITY: usize = CACHE_FILL_LIMIT + 1;

/// How hard a failure pushes for the ip to be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineLevel {
    /// Drop no matter what.
    Must,
    /// Drop when a replacement is waiting.
    Strong,
    /// Drop only when the pool is well stocked.
    Suggest,
}

impl From<ConnectErrorKind> for OfflineLevel {
    fn from(kind: ConnectErrorKind) -> Self {
        match kind {
            ConnectErrorKind::Refused => OfflineLevel::Must,
            ConnectErrorKind::TimedOut => OfflineLevel::Strong,
            ConnectErrorKind::Unreachable | ConnectErrorKind::Other => OfflineLevel::Suggest,
        }
    }
}

/// Result of offering a resource to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Online,
    Overflow,
    Duplicate,
    Expired,
    Invalid,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

struct Parked {
    since: Instant,
    conn: CachedConn,
}

struct IpState {
    refs: HashSet<u64>,
    cache: VecDeque<Parked>,
    // roughly the mean of the last ten borrow intervals
    avg_interval_ms: f64,
    last_borrow: Option<Instant>,
    last_cache_fill: Option<Instant>,
    destroy_pending: bool,
}

impl IpState {
    fn new() -> Self {
        Self {
            refs: HashSet::new(),
            cache: VecDeque::new(),
            avg_interval_ms: 1000.0,
            last_borrow: None,
            last_cache_fill: None,
            destroy_pending: false,
        }
    }

    fn on_borrowed(&mut self, now: Instant) {
        if let Some(last) = self.last_borrow {
            let interval = now.duration_since(last).as_secs_f64() * 1000.0;
            self.avg_interval_ms = self.avg_interval_ms * 0.9 + interval * 0.1;
        }
        self.last_borrow = Some(now);
    }

    fn wants_cache_fill(&self, now: Instant) -> bool {
        if self.cache.len() > CACHE_FILL_LIMIT {
            return false;
        }
        match self.last_cache_fill {
            None => true,
            Some(last) => {
                now.duration_since(last).as_secs_f64() * 1000.0 >= self.avg_interval_ms / 2.0
            }
        }
    }
}

struct IpEntry {
    ip: Arc<ActiveProxyIp>,
    state: IpState,
}

/// The ips of one source. Lives inside the source's task queue.
pub struct IpPool {
    meta: Arc<SourceMeta>,
    ring: HashRing<u64>,
    by_seq: BTreeSet<u64>,
    ips: HashMap<u64, IpEntry>,
    overflow: VecDeque<ProxyIp>,
    overflow_ids: HashSet<String>,
    next_seq: u64,
    pub(crate) loading: bool,
}

impl IpPool {
    pub fn new(meta: Arc<SourceMeta>) -> Self {
        Self {
            meta,
            ring: HashRing::new(),
            by_seq: BTreeSet::new(),
            ips: HashMap::new(),
            overflow: VecDeque::new(),
            overflow_ids: HashSet::new(),
            next_seq: 0,
            loading: false,
        }
    }

    pub fn meta(&self) -> &Arc<SourceMeta> {
        &self.meta
    }

    fn pool_size(&self) -> usize {
        self.meta.config.pool_size
    }

    pub fn overflow_capacity(&self) -> usize {
        (self.pool_size() * 3).clamp(10, 1024)
    }

    #[cfg(test)]
    pub fn online_count(&self) -> usize {
        self.ring.len()
    }

    #[cfg(test)]
    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    #[cfg(test)]
    pub fn overflow_contains(&self, resource_id: &str) -> bool {
        self.overflow_ids.contains(resource_id)
    }

    /// Online ips in creation order.
    #[cfg(test)]
    pub fn online_ips(&self) -> Vec<Arc<ActiveProxyIp>> {
        self.by_seq
            .iter()
            .filter_map(|seq| self.ips.get(seq))
            .map(|entry| Arc::clone(&entry.ip))
            .collect()
    }

    pub fn allocate_ip(&self, hash: u64) -> Option<Arc<ActiveProxyIp>> {
        let seq = self.ring.lookup(hash)?;
        self.ips.get(seq).map(|entry| Arc::clone(&entry.ip))
    }

    fn publish(&self) {
        self.meta.publish_counts(self.ring.len(), self.overflow.len());
    }

    pub fn offer_proxy(&mut self, looper: &Looper<IpPool>, resource: ProxyIp) -> Offer {
        let resource = resource.resolve_id();
        if !resource.is_valid() {
            return Offer::Invalid;
        }
        if resource.expire_time.is_some_and(|at| at <= now_millis()) {
            self.meta.recorder.record_event("offer an expired proxy item");
            return Offer::Expired;
        }
        let id = resource.id();
        if self.ring.contains_key(hash_key(&id)) || self.overflow_ids.contains(&id) {
            return Offer::Duplicate;
        }

        let pool_size = self.pool_size();
        if self.ring.len() < pool_size {
            let outcome = if self.online_proxy_resource(looper, resource) {
                Offer::Online
            } else {
                Offer::Expired
            };
            self.publish();
            return outcome;
        }

        self.push_overflow(resource);

        if self.overflow.len() as f64 > (pool_size as f64 * 0.5).max(1.0) {
            let idle = self
                .by_seq
                .iter()
                .take(IDLE_SCAN_LIMIT)
                .filter_map(|seq| self.ips.get(seq))
                .find(|entry| entry.ip.is_idle())
                .map(|entry| entry.ip.seq());
            if let Some(seq) = idle {
                self.meta
                    .recorder
                    .record_event("proxy cache overflow, offline old proxy");
                self.offline_proxy(looper, seq, DropReason::IdlePoolOverflow, &trace::nop());
            }
        }
        self.publish();
        Offer::Overflow
    }

    fn push_overflow(&mut self, resource: ProxyIp) {
        self.overflow_ids.insert(resource.id());
        self.overflow.push_back(resource);
        let capacity = self.overflow_capacity();
        while self.overflow.len() > capacity {
            if let Some(evicted) = self.overflow.pop_front() {
                self.overflow_ids.remove(&evicted.id());
            }
        }
    }

    fn pop_overflow(&mut self) -> Option<ProxyIp> {
        let resource = self.overflow.pop_front()?;
        self.overflow_ids.remove(&resource.id());
        Some(resource)
    }

    fn remove_overflow(&mut self, resource_id: &str) -> bool {
        if !self.overflow_ids.remove(resource_id) {
            return false;
        }
        self.overflow.retain(|r| r.id() != resource_id);
        true
    }

    fn online_proxy_resource(&mut self, looper: &Looper<IpPool>, resource: ProxyIp) -> bool {
        let lifetime_ms = match resource.expire_time {
            Some(at) => at as i64 - now_millis() as i64,
            None => {
                let secs = match self.meta.config.max_alive_secs {
                    0 => DEFAULT_MAX_ALIVE_SECS,
                    secs => secs,
                };
                (secs * 1000) as i64
            }
        };
        if lifetime_ms <= 0 {
            return false;
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        let source = RuntimeIpSource::from_parts(Arc::clone(&self.meta), looper.clone());
        let ip = Arc::new(ActiveProxyIp::new(source, resource, seq));
        debug!(source = %self.meta.name(), ip = %ip, "ip online");

        self.ring.insert(ip.ring_key(), seq);
        self.by_seq.insert(seq);
        self.ips.insert(
            seq,
            IpEntry {
                ip,
                state: IpState::new(),
            },
        );

        // the timer only knows the sequence; a gone ip makes it a no-op
        looper.post_delay(Duration::from_millis(lifetime_ms as u64), move |pool, looper| {
            pool.offline_proxy(looper, seq, DropReason::AliveTimeReached, &trace::nop());
        });
        true
    }

    pub fn offline_proxy(
        &mut self,
        looper: &Looper<IpPool>,
        seq: u64,
        reason: DropReason,
        recorder: &SharedRecorder,
    ) {
        let Some(entry) = self.ips.get(&seq) else {
            return;
        };
        if entry.ip.status() != ActiveStatus::Online {
            return;
        }
        let ip = Arc::clone(&entry.ip);

        let cached = self.remove_overflow(&ip.resource().id());
        self.meta
            .record_composed(recorder, &format!("offline {} ({}), cache existed: {}", ip, reason, cached));

        self.by_seq.remove(&seq);
        self.ring.remove_if(ip.ring_key(), |v| *v == seq);
        self.destroy_ip(looper, seq, reason);

        if self.ring.len() > self.pool_size() {
            self.publish();
            return;
        }

        let mut promoted = false;
        while let Some(next) = self.pop_overflow() {
            let id = next.id();
            if self.online_proxy_resource(looper, next) {
                self.meta
                    .record_composed(recorder, &format!("online new proxy: {}", id));
                promoted = true;
                break;
            }
        }
        if !promoted {
            self.meta.record_composed(
                recorder,
                "no cache proxy resource exist, pool size decreased",
            );
        }
        self.publish();
    }

    fn destroy_ip(&mut self, looper: &Looper<IpPool>, seq: u64, reason: DropReason) {
        let Some(entry) = self.ips.get_mut(&seq) else {
            return;
        };
        entry.ip.advance(ActiveStatus::Offline);

        if entry.state.refs.is_empty() || reason == DropReason::ServerUnavailable {
            self.finalize(seq);
            return;
        }
        if !entry.state.destroy_pending {
            entry.state.destroy_pending = true;
            looper.post_delay(DESTROY_GRACE, move |pool, _| pool.finalize(seq));
        }
    }

    fn finalize(&mut self, seq: u64) {
        if let Some(entry) = self.ips.remove(&seq) {
            entry.ip.advance(ActiveStatus::Destroy);
            debug!(
                source = %self.meta.name(),
                ip = %entry.ip,
                cached = entry.state.cache.len(),
                "ip destroyed"
            );
        }
    }

    pub fn decide_offline(
        &mut self,
        looper: &Looper<IpPool>,
        seq: u64,
        level: OfflineLevel,
        recorder: &SharedRecorder,
    ) {
        self.meta
            .record_composed(recorder, &format!("offline proxy by pool status: {:?}", level));
        let pool_size = self.pool_size();

        if self.ring.len() > pool_size {
            let reason = match level {
                OfflineLevel::Must => DropReason::ServerUnavailable,
                _ => DropReason::IdlePoolOverflow,
            };
            self.offline_proxy(looper, seq, reason, recorder);
            return;
        }

        let reason = match level {
            OfflineLevel::Must => Some(DropReason::ServerUnavailable),
            OfflineLevel::Strong if !self.overflow.is_empty() => Some(DropReason::QualityBad),
            OfflineLevel::Suggest if self.overflow.len() > pool_size / 3 => {
                Some(DropReason::IdlePoolOverflow)
            }
            _ => None,
        };
        match reason {
            Some(reason) => self.offline_proxy(looper, seq, reason, recorder),
            None => self
                .meta
                .record_composed(recorder, "do not offline proxy finally"),
        }
    }

    pub fn on_create_connection_failed(
        &mut self,
        looper: &Looper<IpPool>,
        seq: u64,
        kind: ConnectErrorKind,
        recorder: &SharedRecorder,
    ) {
        let level = OfflineLevel::from(kind);
        self.meta.record_composed(
            recorder,
            &format!(
                "connection create failed ({:?}), offline level {:?}, cached resources: {}",
                kind,
                level,
                self.overflow.len()
            ),
        );
        self.decide_offline(looper, seq, level, recorder);
    }

    pub fn refresh_ref(&mut self, seq: u64, session_hash: u64, add: bool) {
        let Some(entry) = self.ips.get_mut(&seq) else {
            return;
        };
        if add {
            entry.state.refs.insert(session_hash);
            return;
        }
        entry.state.refs.remove(&session_hash);
        if entry.state.refs.is_empty() && entry.state.destroy_pending {
            self.finalize(seq);
        }
    }

    #[cfg(test)]
    pub fn ref_count(&self, seq: u64) -> usize {
        self.ips.get(&seq).map_or(0, |entry| entry.state.refs.len())
    }

    /// Pops a live warm connection; dead ones found on the way are dropped.
    pub fn take_cached(&mut self, seq: u64) -> Option<CachedConn> {
        let entry = self.ips.get_mut(&seq)?;
        entry.state.on_borrowed(Instant::now());
        while let Some(parked) = entry.state.cache.pop_front() {
            if parked.conn.is_alive() {
                return Some(parked.conn);
            }
        }
        None
    }

    #[cfg(test)]
    pub fn cache_len(&self, seq: u64) -> usize {
        self.ips.get(&seq).map_or(0, |entry| entry.state.cache.len())
    }

    pub fn restore_cache(&mut self, looper: &Looper<IpPool>, seq: u64, conn: CachedConn) {
        let Some(entry) = self.ips.get_mut(&seq) else {
            debug!(source = %self.meta.name(), conn = conn.id, "ip gone, closing connection");
            return;
        };
        if entry.ip.status() == ActiveStatus::Destroy {
            return;
        }
        let conn_id = conn.id;
        entry.state.cache.push_front(Parked {
            since: Instant::now(),
            conn,
        });
        while entry.state.cache.len() > CACHE_CAPACITY {
            if let Some(oldest) = entry.state.cache.pop_back() {
                debug!(source = %self.meta.name(), conn = oldest.conn.id, "warm cache full, closing oldest");
            }
        }

        let idle = Duration::from_secs(self.meta.config.conn_idle_secs);
        looper.post_delay(idle, move |pool, _| pool.close_idle(seq, conn_id, idle));
    }

    fn close_idle(&mut self, seq: u64, conn_id: u64, idle: Duration) {
        let Some(entry) = self.ips.get_mut(&seq) else {
            return;
        };
        let now = Instant::now();
        entry
            .state
            .cache
            .retain(|parked| parked.conn.id != conn_id || now.duration_since(parked.since) < idle);
    }

    /// Opens one extra warm connection per online ip that is due for one.
    pub fn make_cache(&mut self, looper: &Looper<IpPool>) {
        let now = Instant::now();
        let seqs: Vec<u64> = self.ring.values().copied().collect();
        for seq in seqs {
            let Some(entry) = self.ips.get_mut(&seq) else {
                continue;
            };
            if entry.ip.status() != ActiveStatus::Online || !entry.state.wants_cache_fill(now) {
                continue;
            }
            entry.state.last_cache_fill = Some(now);

            let ip = Arc::clone(&entry.ip);
            let looper = looper.clone();
            tokio::spawn(async move {
                if let Ok(conn) = ip.create_connection(&trace::nop()).await {
                    looper.post(move |pool, looper| pool.restore_cache(looper, seq, conn));
                }
            });
        }
    }

    pub fn destroy_all(&mut self, looper: &Looper<IpPool>) {
        info!(
            source = %self.meta.name(),
            online = self.ring.len(),
            "closing ip pool"
        );
        self.overflow.clear();
        self.overflow_ids.clear();
        let seqs: Vec<u64> = self.by_seq.iter().copied().collect();
        self.ring.clear();
        self.by_seq.clear();
        for seq in seqs {
            self.destroy_ip(looper, seq, DropReason::ResourceClose);
        }
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::trace::testing::MemoryRecorder;
    use tokio::net::TcpListener;

    fn test_source(pool_size: usize) -> RuntimeIpSource {
        let config = SourceConfig {
            name: "test".into(),
            pool_size,
            make_conn_interval_ms: 0,
            ..SourceConfig::default()
        };
        RuntimeIpSource::start(config).unwrap()
    }

    fn ip(n: u16) -> ProxyIp {
        ProxyIp::new("127.0.0.1", 10000 + n)
    }

    async fn offer(source: &RuntimeIpSource, resource: ProxyIp) -> Offer {
        source
            .looper()
            .call(move |pool, looper| pool.offer_proxy(looper, resource))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn offers_fill_pool_then_overflow() {
        let source = test_source(2);
        assert_eq!(offer(&source, ip(1)).await, Offer::Online);
        assert_eq!(offer(&source, ip(2)).await, Offer::Online);
        assert_eq!(offer(&source, ip(3)).await, Offer::Overflow);

        let (online, overflow) = source
            .looper()
            .call(|pool, _| (pool.online_count(), pool.overflow_len()))
            .await
            .unwrap();
        assert_eq!((online, overflow), (2, 1));
        assert!(!source.pool_empty());
    }

    #[tokio::test]
    async fn duplicate_expired_and_invalid_offers_are_rejected() {
        let source = test_source(1);
        assert_eq!(offer(&source, ip(1)).await, Offer::Online);
        assert_eq!(offer(&source, ip(1)).await, Offer::Duplicate);

        assert_eq!(offer(&source, ip(2)).await, Offer::Overflow);
        assert_eq!(offer(&source, ip(2)).await, Offer::Duplicate);

        let mut expired = ip(3);
        expired.expire_time = Some(now_millis() - 1);
        assert_eq!(offer(&source, expired).await, Offer::Expired);

        assert_eq!(offer(&source, ProxyIp::new("", 80)).await, Offer::Invalid);
    }

    #[tokio::test]
    async fn server_unavailable_destroys_immediately_and_promotes() {
        let source = test_source(2);
        for n in 1..=3 {
            offer(&source, ip(n)).await;
        }

        let (first, remaining) = source
            .looper()
            .call(|pool, looper| {
                let first = pool.online_ips()[0].clone();
                pool.refresh_ref(first.seq(), 42, true);
                pool.offline_proxy(
                    looper,
                    first.seq(),
                    DropReason::ServerUnavailable,
                    &trace::nop(),
                );
                let remaining: Vec<String> =
                    pool.online_ips().iter().map(|ip| ip.resource().id()).collect();
                (first, remaining)
            })
            .await
            .unwrap();

        assert_eq!(first.status(), ActiveStatus::Destroy);
        assert_eq!(remaining, vec!["127.0.0.1:10002", "127.0.0.1:10003"]);
        assert_eq!(source.online_count(), 2);
        assert_eq!(source.overflow_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn referenced_ip_waits_for_grace_window() {
        let source = test_source(2);
        offer(&source, ip(1)).await;

        let first = source
            .looper()
            .call(|pool, looper| {
                let first = pool.online_ips()[0].clone();
                pool.refresh_ref(first.seq(), 7, true);
                pool.offline_proxy(looper, first.seq(), DropReason::QualityBad, &trace::nop());
                first
            })
            .await
            .unwrap();
        assert_eq!(first.status(), ActiveStatus::Offline);

        tokio::time::sleep(Duration::from_secs(59)).await;
        source.looper().call(|_, _| ()).await.unwrap();
        assert_eq!(first.status(), ActiveStatus::Offline);

        tokio::time::sleep(Duration::from_secs(2)).await;
        source.looper().call(|_, _| ()).await.unwrap();
        assert_eq!(first.status(), ActiveStatus::Destroy);
    }

    #[tokio::test(start_paused = true)]
    async fn releasing_last_reference_finalizes_early() {
        let source = test_source(2);
        offer(&source, ip(1)).await;

        let first = source
            .looper()
            .call(|pool, looper| {
                let first = pool.online_ips()[0].clone();
                pool.refresh_ref(first.seq(), 7, true);
                pool.refresh_ref(first.seq(), 8, true);
                pool.offline_proxy(looper, first.seq(), DropReason::QualityBad, &trace::nop());
                pool.refresh_ref(first.seq(), 7, false);
                first
            })
            .await
            .unwrap();
        assert_eq!(first.status(), ActiveStatus::Offline);

        first.refresh_ref_session_hash(8, false);
        source.looper().call(|_, _| ()).await.unwrap();
        assert_eq!(first.status(), ActiveStatus::Destroy);
    }

    #[tokio::test(start_paused = true)]
    async fn alive_time_takes_ip_offline() {
        let config = SourceConfig {
            name: "short".into(),
            pool_size: 1,
            max_alive_secs: 10,
            make_conn_interval_ms: 0,
            ..SourceConfig::default()
        };
        let source = RuntimeIpSource::start(config).unwrap();
        offer(&source, ip(1)).await;
        offer(&source, ip(2)).await;

        tokio::time::sleep(Duration::from_secs(11)).await;
        let online: Vec<String> = source
            .looper()
            .call(|pool, _| pool.online_ips().iter().map(|ip| ip.resource().id()).collect())
            .await
            .unwrap();
        assert_eq!(online, vec!["127.0.0.1:10002"]);
    }

    #[tokio::test]
    async fn overflow_is_bounded_and_evicts_oldest() {
        let source = test_source(1);
        offer(&source, ip(0)).await;
        // keep the online ip busy so overflow offers do not rotate it out
        let busy = source.looper().call(|pool, _| pool.online_ips()[0].clone()).await.unwrap();
        let _guard = crate::connection::ConnectionGuard::try_new(busy.active_conns()).unwrap();

        for n in 1..=15 {
            offer(&source, ip(n)).await;
        }
        let (len, cap, oldest_kept, first_dropped) = source
            .looper()
            .call(|pool, _| {
                (
                    pool.overflow_len(),
                    pool.overflow_capacity(),
                    pool.overflow_contains("127.0.0.1:10006"),
                    pool.overflow_contains("127.0.0.1:10005"),
                )
            })
            .await
            .unwrap();
        assert_eq!(cap, 10);
        assert_eq!(len, 10);
        assert!(oldest_kept);
        assert!(!first_dropped);
    }

    #[tokio::test]
    async fn overflow_pressure_rotates_idle_ip() {
        let source = test_source(2);
        offer(&source, ip(1)).await;
        offer(&source, ip(2)).await;
        offer(&source, ip(3)).await;
        // second overflow entry exceeds half the pool size
        offer(&source, ip(4)).await;

        let online: Vec<String> = source
            .looper()
            .call(|pool, _| pool.online_ips().iter().map(|ip| ip.resource().id()).collect())
            .await
            .unwrap();
        assert_eq!(online, vec!["127.0.0.1:10002", "127.0.0.1:10003"]);
    }

    #[tokio::test]
    async fn decide_offline_respects_levels() {
        let source = test_source(3);
        for n in 1..=3 {
            offer(&source, ip(n)).await;
        }
        let memory = MemoryRecorder::shared();
        let recorder: SharedRecorder = memory.clone();

        let statuses = source
            .looper()
            .call(move |pool, looper| {
                let ips = pool.online_ips();
                // empty overflow: strong and suggest keep the ip
                pool.decide_offline(looper, ips[0].seq(), OfflineLevel::Strong, &recorder);
                pool.decide_offline(looper, ips[1].seq(), OfflineLevel::Suggest, &recorder);
                let kept = (ips[0].status(), ips[1].status());
                pool.decide_offline(looper, ips[2].seq(), OfflineLevel::Must, &recorder);
                (kept, ips[2].status())
            })
            .await
            .unwrap();

        assert_eq!(statuses.0, (ActiveStatus::Online, ActiveStatus::Online));
        assert_eq!(statuses.1, ActiveStatus::Destroy);

        let events = memory.events();
        assert_eq!(
            events.iter().filter(|e| *e == "do not offline proxy finally").count(),
            2
        );
        assert!(memory.contains("offline proxy by pool status: Must"));
        assert!(memory.contains("no cache proxy resource exist, pool size decreased"));
    }

    #[test]
    fn connect_failures_map_to_levels() {
        assert_eq!(OfflineLevel::from(ConnectErrorKind::Refused), OfflineLevel::Must);
        assert_eq!(OfflineLevel::from(ConnectErrorKind::TimedOut), OfflineLevel::Strong);
        assert_eq!(OfflineLevel::from(ConnectErrorKind::Other), OfflineLevel::Suggest);
    }

    #[test]
    fn borrow_interval_average_moves_slowly() {
        let mut state = IpState::new();
        let start = Instant::now();
        state.on_borrowed(start);
        state.on_borrowed(start + Duration::from_millis(2000));
        assert!((state.avg_interval_ms - 1100.0).abs() < 1e-6);
    }

    #[test]
    fn cache_fill_is_throttled_by_average_interval() {
        let mut state = IpState::new();
        let start = Instant::now();
        assert!(state.wants_cache_fill(start));

        state.last_cache_fill = Some(start);
        assert!(!state.wants_cache_fill(start + Duration::from_millis(400)));
        assert!(state.wants_cache_fill(start + Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn restored_connection_is_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut peers = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                peers.push(stream);
            }
        });

        let source = test_source(1);
        offer(&source, ProxyIp::new("127.0.0.1", port)).await;
        let active = source.allocate_ip(1, &trace::nop()).await.unwrap();

        let conn = active.borrow_connection(&trace::nop(), "").await.unwrap();
        let first_id = conn.id();
        assert_eq!(active.active_conns().load(std::sync::atomic::Ordering::Relaxed), 1);
        conn.restore_cache();
        assert!(active.is_idle());

        let seq = active.seq();
        let cached = source.looper().call(move |pool, _| pool.cache_len(seq)).await.unwrap();
        assert_eq!(cached, 1);

        let again = active.borrow_connection(&trace::nop(), "").await.unwrap();
        assert_eq!(again.id(), first_id);
    }

    #[tokio::test]
    async fn warm_cache_keeps_newest_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut peers = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                peers.push(stream);
            }
        });

        let source = test_source(1);
        offer(&source, ProxyIp::new("127.0.0.1", port)).await;
        let active = source.allocate_ip(1, &trace::nop()).await.unwrap();
        let seq = active.seq();

        let mut newest = 0;
        for _ in 0..CACHE_CAPACITY + 2 {
            let stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let conn = CachedConn::new(stream);
            newest = conn.id;
            source
                .looper()
                .call(move |pool, looper| pool.restore_cache(looper, seq, conn))
                .await
                .unwrap();
        }

        let (cached, first) = source
            .looper()
            .call(move |pool, _| {
                let len = pool.cache_len(seq);
                (len, pool.take_cached(seq).map(|conn| conn.id))
            })
            .await
            .unwrap();
        assert_eq!(cached, CACHE_CAPACITY);
        assert_eq!(first, Some(newest));
    }

    #[tokio::test]
    async fn refused_connection_offlines_ip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let source = test_source(1);
        offer(&source, ProxyIp::new("127.0.0.1", port)).await;
        let active = source.allocate_ip(9, &trace::nop()).await.unwrap();

        assert!(active.borrow_connection(&trace::nop(), "").await.is_err());
        source.looper().call(|_, _| ()).await.unwrap();
        assert_eq!(active.status(), ActiveStatus::Destroy);
        assert!(source.pool_empty());
    }
}
