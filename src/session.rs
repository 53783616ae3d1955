use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::handshake::Protocol;
use crate::hashring::hash_key;
use crate::trace::{Scope, SharedRecorder, TracingRecorder};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Twenty lowercase hex digits: the low 48 bits of the wall clock in
/// nanoseconds, then the low 32 bits of a process-wide sequence. Both parts
/// are zero padded so ids never run into each other.
pub fn new_session_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
    format!("{:012x}{:08x}", nanos & 0xffff_ffff_ffff, seq & 0xffff_ffff)
}

/// Where the client wants to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`, `[v6]:port` or a bare host with `default_port`.
    pub fn parse(authority: &str, default_port: u16) -> Option<Self> {
        let authority = authority.trim();
        if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().ok()?,
                None if tail.is_empty() => default_port,
                None => return None,
            };
            return Some(Self::new(host, port));
        }
        match authority.rsplit_once(':') {
            // more than one colon without brackets is a bare v6 address
            Some((host, _)) if host.contains(':') => Some(Self::new(authority, default_port)),
            Some((host, port)) if !host.is_empty() => Some(Self::new(host, port.parse().ok()?)),
            Some(_) => None,
            None if !authority.is_empty() => Some(Self::new(authority, default_port)),
            None => None,
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One inbound tunnel, from accept until the relay closes.
pub struct Session {
    pub id: String,
    pub listen_port: u16,
    pub client_ip: IpAddr,
    pub authed: bool,
    target: Option<ConnectTarget>,
    inbound_protocol: Option<Protocol>,
    session_hash: u64,
    recorder: SharedRecorder,
}

impl Session {
    pub fn new(listen_port: u16, client_ip: IpAddr) -> Self {
        let id = new_session_id();
        let recorder = TracingRecorder::shared(Scope::Session, id.clone());
        recorder.record_event(&format!("new request from {} on port {}", client_ip, listen_port));
        Self {
            id,
            listen_port,
            client_ip,
            authed: false,
            target: None,
            inbound_protocol: None,
            session_hash: hash_key(&listen_port.to_string()),
            recorder,
        }
    }

    /// Records the target and derives the routing hash. With random turning
    /// the hash also mixes in the wall clock, so each request lands elsewhere.
    pub fn on_proxy_target_resolved(
        &mut self,
        target: ConnectTarget,
        inbound: Protocol,
        random_turning: bool,
    ) {
        let key = if random_turning {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis();
            format!("{}{}", now, self.listen_port)
        } else {
            self.listen_port.to_string()
        };
        self.session_hash = hash_key(&key);
        self.recorder.record_event(&format!(
            "proxy target resolved, session hash: {} target: {} inbound protocol: {}",
            self.session_hash, target, inbound
        ));
        self.target = Some(target);
        self.inbound_protocol = Some(inbound);
    }

    pub fn target(&self) -> Option<&ConnectTarget> {
        self.target.as_ref()
    }

    pub fn inbound_protocol(&self) -> Option<Protocol> {
        self.inbound_protocol
    }

    pub fn session_hash(&self) -> u64 {
        self.session_hash
    }

    pub fn recorder(&self) -> &SharedRecorder {
        &self.recorder
    }
}
