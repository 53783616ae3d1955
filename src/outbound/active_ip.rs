use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::connection::{self, CachedConn, UpstreamConn};
use crate::error::OutboundError;
use crate::hashring::hash_key;
use crate::outbound::OfflineLevel;
use crate::resource::ProxyIp;
use crate::source::RuntimeIpSource;
use crate::trace::SharedRecorder;

/// Lifecycle of an ip; only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ActiveStatus {
    Online = 0,
    Offline = 1,
    Destroy = 2,
}

impl ActiveStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ActiveStatus::Online,
            1 => ActiveStatus::Offline,
            _ => ActiveStatus::Destroy,
        }
    }
}

/// An upstream ip that has been admitted into a pool.
///
/// The handle is shared with the router and with sessions. Everything
/// mutable about the ip (cache, references, pacing) lives in the owning
/// pool's queue state, keyed by `seq`; the handle only carries the lifecycle
/// flag so other queues can see when it goes away.
pub struct ActiveProxyIp {
    seq: u64,
    ring_key: u64,
    resource: ProxyIp,
    status: AtomicU8,
    active_conns: Arc<AtomicUsize>,
    source: RuntimeIpSource,
}

impl ActiveProxyIp {
    pub(crate) fn new(source: RuntimeIpSource, resource: ProxyIp, seq: u64) -> Self {
        Self {
            seq,
            ring_key: hash_key(&resource.id()),
            resource,
            status: AtomicU8::new(ActiveStatus::Online as u8),
            active_conns: Arc::new(AtomicUsize::new(0)),
            source,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn ring_key(&self) -> u64 {
        self.ring_key
    }

    pub fn resource(&self) -> &ProxyIp {
        &self.resource
    }

    pub fn source(&self) -> &RuntimeIpSource {
        &self.source
    }

    pub fn status(&self) -> ActiveStatus {
        ActiveStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Moves the lifecycle forward to `to`; never backwards.
    pub(crate) fn advance(&self, to: ActiveStatus) -> ActiveStatus {
        ActiveStatus::from_u8(self.status.fetch_max(to as u8, Ordering::AcqRel))
    }

    pub fn active_conns(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_conns)
    }

    /// No borrowed connection is currently in use.
    pub fn is_idle(&self) -> bool {
        self.active_conns.load(Ordering::Acquire) == 0
    }

    pub fn http_authorization(&self) -> Option<String> {
        self.resource.basic_authorization()
    }

    pub fn refresh_ref_session_hash(&self, session_hash: u64, add: bool) {
        let seq = self.seq;
        self.source
            .looper()
            .execute(move |pool, _| pool.refresh_ref(seq, session_hash, add));
    }

    /// Asks the owning pool to consider dropping this ip.
    pub fn suggest_offline(&self, level: OfflineLevel, recorder: SharedRecorder) {
        let seq = self.seq;
        self.source
            .looper()
            .execute(move |pool, looper| pool.decide_offline(looper, seq, level, &recorder));
    }

    /// Takes a warm connection from the cache, or opens a new one.
    pub async fn borrow_connection(
        self: &Arc<Self>,
        recorder: &SharedRecorder,
        tag: &str,
    ) -> Result<UpstreamConn, OutboundError> {
        let seq = self.seq;
        let cached = self
            .source
            .looper()
            .call(move |pool, _| pool.take_cached(seq))
            .await?;

        let conn = match cached {
            Some(conn) => {
                recorder.record_event(&format!("{}conn cache pool hit", tag));
                conn
            }
            None => {
                recorder.record_event(&format!("{}begin to create connection immediately", tag));
                self.create_connection(recorder).await?
            }
        };
        Ok(UpstreamConn::new(Arc::clone(self), conn)?)
    }

    pub(crate) async fn create_connection(
        &self,
        recorder: &SharedRecorder,
    ) -> Result<CachedConn, OutboundError> {
        match connection::connect(&self.resource.proxy_host, self.resource.proxy_port).await {
            Ok(stream) => Ok(CachedConn::new(stream)),
            Err(err) => {
                let seq = self.seq;
                let kind = err.kind;
                let recorder = Arc::clone(recorder);
                self.source.looper().post(move |pool, looper| {
                    pool.on_create_connection_failed(looper, seq, kind, &recorder)
                });
                Err(err.into())
            }
        }
    }

    pub(crate) fn restore_cache(&self, conn: CachedConn) {
        let seq = self.seq;
        self.source
            .looper()
            .execute(move |pool, looper| pool.restore_cache(looper, seq, conn));
    }
}

impl fmt::Display for ActiveProxyIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.resource, self.seq)
    }
}

impl fmt::Debug for ActiveProxyIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveProxyIp")
            .field("seq", &self.seq)
            .field("resource", &self.resource.id())
            .field("status", &self.status())
            .finish()
    }
}
