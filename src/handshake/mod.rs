//! Upstream protocol negotiation.
//!
//! A handshake turns a raw TCP connection to an upstream proxy ip into a
//! tunnel to the session's target. Each attempt resolves exactly once: the
//! future either completes with the negotiated tunnel, fails, or is cut off
//! by the handshake timeout, and it is dropped (with its connection) on any
//! failure.

pub mod https;
pub mod socks5;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::UpstreamConn;
use crate::error::{ConfigError, HandshakeError};
use crate::outbound::OfflineLevel;
use crate::session::ConnectTarget;
use crate::trace::SharedRecorder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    /// HTTP CONNECT tunnel
    Https,
    Socks5,
}

impl Protocol {
    pub fn priority(self) -> u8 {
        match self {
            Protocol::Http => 0,
            Protocol::Https => 1,
            Protocol::Socks5 => 2,
        }
    }

    /// Inbound protocols this upstream protocol can carry besides itself.
    pub fn overlays(self) -> &'static [Protocol] {
        match self {
            Protocol::Http => &[],
            Protocol::Https => &[Protocol::Http],
            Protocol::Socks5 => &[Protocol::Http, Protocol::Https],
        }
    }

    pub fn can_overlay(self, inbound: Protocol) -> bool {
        self.overlays().contains(&inbound)
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "socks5" => Ok(Protocol::Socks5),
            other => Err(ConfigError::UnknownProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
            Protocol::Socks5 => "SOCKS5",
        })
    }
}

/// Parses a comma separated protocol list, highest priority first.
pub fn parse_support_protocols(list: &str) -> Result<Vec<Protocol>, ConfigError> {
    let mut protocols = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let protocol: Protocol = name.parse()?;
        if !protocols.contains(&protocol) {
            protocols.push(protocol);
        }
    }
    protocols.sort_by(|a, b| b.priority().cmp(&a.priority()));
    Ok(protocols)
}

/// Picks the upstream protocol for an inbound request.
///
/// Plain HTTP inbound never goes out as plain HTTP while another supported
/// protocol can carry it, so upstream credentials and request bytes do not
/// share one unauthenticated exchange.
pub fn choose_upstream_protocol(inbound: Protocol, supported: &[Protocol]) -> Option<Protocol> {
    if inbound == Protocol::Http {
        if let Some(p) = supported
            .iter()
            .copied()
            .find(|p| *p != Protocol::Http && p.can_overlay(inbound))
        {
            return Some(p);
        }
    }
    if supported.contains(&inbound) {
        return Some(inbound);
    }
    supported.iter().copied().find(|p| p.can_overlay(inbound))
}

/// Negotiates `protocol` on `conn` towards `target`, bounded by `timeout`.
///
/// Failures that are not the target's fault suggest the pool drop the ip.
pub async fn handshake(
    conn: &mut UpstreamConn,
    protocol: Protocol,
    target: &ConnectTarget,
    timeout: Duration,
    recorder: &SharedRecorder,
) -> Result<(), HandshakeError> {
    let ip = Arc::clone(conn.ip());
    recorder.record_event(&format!("begin {} upstream handshake via {}", protocol, ip));

    let result = match protocol {
        Protocol::Http => Ok(()),
        Protocol::Https => {
            let authorization = ip.http_authorization();
            let negotiated = tokio::time::timeout(
                timeout,
                https::connect_tunnel(conn.stream_mut(), target, authorization.as_deref(), recorder),
            )
            .await
            .unwrap_or(Err(HandshakeError::Timeout(timeout)));
            negotiated.map(|rest| conn.set_read_ahead(rest))
        }
        Protocol::Socks5 => tokio::time::timeout(
            timeout,
            socks5::connect(conn.stream_mut(), target, ip.resource().user_pass(), recorder),
        )
        .await
        .unwrap_or(Err(HandshakeError::Timeout(timeout))),
    };

    match &result {
        Ok(()) => recorder.record_event("upstream handshake success"),
        Err(err) => {
            recorder.record_error("handshake failed", err);
            if !err.target_unreachable() {
                ip.suggest_offline(OfflineLevel::Suggest, Arc::clone(recorder));
            }
        }
    }
    result
}
