use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{ConnectError, ConnectErrorKind};
use crate::outbound::ActiveProxyIp;

/// Global counter of upstream connections currently handed out to sessions
pub static ACTIVE_UPSTREAM_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Hard cap on concurrently borrowed upstream connections
pub const MAX_UPSTREAM_CONNECTIONS: usize = 40000;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn acquire_slot(counter: &AtomicUsize, limit: usize) -> bool {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        if current >= limit {
            return false;
        }
        match counter.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return true,
            Err(observed) => current = observed,
        }
    }
}

/// RAII guard counting one borrowed connection, globally and on its ip
pub struct ConnectionGuard {
    per_ip: Arc<AtomicUsize>,
    released: bool,
}

impl ConnectionGuard {
    /// Returns `None` when [`MAX_UPSTREAM_CONNECTIONS`] are already in use.
    pub fn try_new(per_ip: Arc<AtomicUsize>) -> Option<Self> {
        if !acquire_slot(&ACTIVE_UPSTREAM_CONNECTIONS, MAX_UPSTREAM_CONNECTIONS) {
            return None;
        }
        per_ip.fetch_add(1, Ordering::AcqRel);
        Some(Self {
            per_ip,
            released: false,
        })
    }

    pub fn release(&mut self) {
        if !self.released {
            ACTIVE_UPSTREAM_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
            self.per_ip.fetch_sub(1, Ordering::AcqRel);
            self.released = true;
        }
    }

    pub fn active_count() -> usize {
        ACTIVE_UPSTREAM_CONNECTIONS.load(Ordering::Relaxed)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opens a TCP connection to an upstream proxy ip.
pub async fn connect(host: &str, port: u16) -> Result<TcpStream, ConnectError> {
    let addr = format!("{}:{}", host, port);
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(err)) => Err(ConnectError::from_io(addr, &err)),
        Err(_) => Err(ConnectError::timed_out(addr, CONNECT_TIMEOUT)),
    }
}

pub fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// An idle, already connected upstream socket parked in an ip's cache.
#[derive(Debug)]
pub struct CachedConn {
    pub id: u64,
    pub stream: TcpStream,
}

impl CachedConn {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            id: next_conn_id(),
            stream,
        }
    }

    /// False once the peer has closed or sent unsolicited bytes.
    pub fn is_alive(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.stream.try_read(&mut probe) {
            Err(err) => err.kind() == io::ErrorKind::WouldBlock,
            Ok(_) => false,
        }
    }
}

/// A connection borrowed from an ip. Bytes the handshake read past the
/// upstream's reply are served before the socket.
pub struct UpstreamConn {
    id: u64,
    stream: TcpStream,
    ip: Arc<ActiveProxyIp>,
    read_ahead: BytesMut,
    guard: ConnectionGuard,
}

impl UpstreamConn {
    pub fn new(ip: Arc<ActiveProxyIp>, cached: CachedConn) -> Result<Self, ConnectError> {
        let guard = ConnectionGuard::try_new(ip.active_conns()).ok_or_else(|| ConnectError {
            kind: ConnectErrorKind::Other,
            addr: ip.resource().ip_port(),
            message: "upstream connection limit reached".to_string(),
        })?;
        Ok(Self {
            id: cached.id,
            stream: cached.stream,
            ip,
            read_ahead: BytesMut::new(),
            guard,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ip(&self) -> &Arc<ActiveProxyIp> {
        &self.ip
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn set_read_ahead(&mut self, bytes: BytesMut) {
        self.read_ahead = bytes;
    }

    /// Hands an unused connection back to its ip's warm cache.
    pub fn restore_cache(self) {
        let ip = Arc::clone(&self.ip);
        if !self.read_ahead.is_empty() {
            debug!(conn = self.id, ip = %ip.resource(), "not caching a connection with pending bytes");
            return;
        }
        ip.restore_cache(self.into_cached());
    }

    fn into_cached(mut self) -> CachedConn {
        self.guard.release();
        CachedConn {
            id: self.id,
            stream: self.stream,
        }
    }
}

impl AsyncRead for UpstreamConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_ahead.is_empty() {
            let n = self.read_ahead.len().min(buf.remaining());
            buf.put_slice(&self.read_ahead[..n]);
            self.read_ahead.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for UpstreamConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
