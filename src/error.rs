use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::handshake::Protocol;
use crate::looper::LooperClosed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    Refused,
    TimedOut,
    Unreachable,
    Other,
}

impl From<io::ErrorKind> for ConnectErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::ConnectionRefused => ConnectErrorKind::Refused,
            io::ErrorKind::TimedOut => ConnectErrorKind::TimedOut,
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                ConnectErrorKind::Unreachable
            }
            _ => ConnectErrorKind::Other,
        }
    }
}

/// TCP connect to an upstream proxy ip failed.
#[derive(Debug, Error)]
#[error("connect to {addr} failed ({kind:?}): {message}")]
pub struct ConnectError {
    pub kind: ConnectErrorKind,
    pub addr: String,
    pub message: String,
}

impl ConnectError {
    pub fn from_io(addr: impl Into<String>, err: &io::Error) -> Self {
        Self {
            kind: err.kind().into(),
            addr: addr.into(),
            message: err.to_string(),
        }
    }

    pub fn timed_out(addr: impl Into<String>, after: Duration) -> Self {
        Self {
            kind: ConnectErrorKind::TimedOut,
            addr: addr.into(),
            message: format!("no answer within {:?}", after),
        }
    }
}

/// Failure while negotiating a tunnel through an upstream proxy.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error during handshake: {0}")]
    Io(#[from] io::Error),

    #[error("upstream answered {status} {reason}")]
    Status { status: u16, reason: String },

    #[error("upstream rejected the proxy credentials")]
    BadCredentials,

    #[error("malformed upstream response: {0}")]
    Malformed(String),

    #[error("upstream closed the connection during handshake")]
    Closed,

    #[error("socks5 handshake failed: {0}")]
    Socks(#[from] tokio_socks::Error),
}

impl HandshakeError {
    /// Whether another upstream ip may succeed where this one failed.
    pub fn retryable(&self) -> bool {
        use tokio_socks::Error as S;
        match self {
            HandshakeError::Timeout(_)
            | HandshakeError::Io(_)
            | HandshakeError::Closed
            | HandshakeError::Malformed(_) => true,
            HandshakeError::Status { status, .. } => *status >= 500 || *status == 401,
            HandshakeError::BadCredentials => false,
            HandshakeError::Socks(err) => !matches!(
                err,
                S::NoAcceptableAuthMethods
                    | S::PasswordAuthFailure(_)
                    | S::UnknownAuthMethod
                    | S::InvalidTargetAddress(_)
                    | S::InvalidAuthValues(_)
            ),
        }
    }

    /// The upstream ip is fine, the requested target itself cannot be reached.
    pub fn target_unreachable(&self) -> bool {
        matches!(
            self,
            HandshakeError::Socks(
                tokio_socks::Error::NetworkUnreachable | tokio_socks::Error::HostUnreachable
            )
        )
    }
}

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("ip pool of source {0} is empty")]
    PoolEmpty(String),

    #[error("no ip source available")]
    NoSource,

    #[error("unknown ip source {0}")]
    UnknownSource(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("source {source_name} supports no protocol able to carry {inbound}")]
    NoCompatibleProtocol {
        source_name: String,
        inbound: Protocol,
    },

    #[error("gave up after {attempts} attempts: {last}")]
    FailoverExhausted {
        attempts: usize,
        last: Box<OutboundError>,
    },

    #[error("no attempt was made")]
    NotAttempted,

    #[error(transparent)]
    Queue(#[from] LooperClosed),

    #[error("outbound aborted: {0}")]
    Aborted(String),
}

impl OutboundError {
    pub fn retryable(&self) -> bool {
        match self {
            OutboundError::PoolEmpty(_) | OutboundError::Connect(_) => true,
            OutboundError::Handshake(err) => err.retryable(),
            OutboundError::NoSource
            | OutboundError::UnknownSource(_)
            | OutboundError::NoCompatibleProtocol { .. }
            | OutboundError::FailoverExhausted { .. }
            | OutboundError::NotAttempted
            | OutboundError::Queue(_)
            | OutboundError::Aborted(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),

    #[error("source {0} must have a pool size greater than zero")]
    PoolSize(String),

    #[error("invalid port space {0:?}")]
    PortSpace(String),

    #[error("no enabled ip source configured")]
    NoSources,

    #[error("duplicate ip source name {0}")]
    DuplicateSource(String),

    #[error("invalid white-list entry {0:?}")]
    WhiteIp(String),

    #[error("source {name}: {source}")]
    LoadUrl {
        name: String,
        #[source]
        source: ResourceError,
    },
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("invalid resource json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("resource download failed: {0}")]
    Download(String),

    #[error("resource server answered {0}")]
    Status(http::StatusCode),

    #[error("resource i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("resource http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unsupported resource url {0:?}")]
    Url(String),
}
