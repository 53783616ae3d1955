use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::buffer_pool::{BufferPool, BufferSize};

/// Bytes moved by one relay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub from_client: u64,
    pub from_server: u64,
    pub idle_timeout: bool,
}

/// Copies bytes both ways until either side closes, fails, or nothing moves
/// for `idle`.
pub async fn relay<C, U>(
    mut client: C,
    mut server: U,
    idle: Duration,
    buffers: &BufferPool,
    session_id: &str,
) -> std::io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let size = BufferSize::for_idle_timeout(idle);
    let mut client_buf = buffers.get(size).await;
    let mut server_buf = buffers.get(size).await;
    let idle_timer = tokio::time::sleep(idle);
    tokio::pin!(idle_timer);

    let mut stats = RelayStats::default();
    let mut error = None;

    loop {
        tokio::select! {
            res = client.read(&mut client_buf) => match res {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = server.write_all(&client_buf[..n]).await {
                        error = Some(e);
                        break;
                    }
                    stats.from_client += n as u64;
                    idle_timer.as_mut().reset(Instant::now() + idle);
                }
                Err(e) => {
                    error = Some(e);
                    break;
                }
            },
            res = server.read(&mut server_buf) => match res {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = client.write_all(&server_buf[..n]).await {
                        error = Some(e);
                        break;
                    }
                    stats.from_server += n as u64;
                    idle_timer.as_mut().reset(Instant::now() + idle);
                }
                Err(e) => {
                    error = Some(e);
                    break;
                }
            },
            _ = &mut idle_timer => {
                debug!(session = %session_id, "relay idle timeout after {:?}, closing", idle);
                stats.idle_timeout = true;
                break;
            }
        }
    }

    let _ = server.shutdown().await;
    let _ = client.shutdown().await;
    buffers.put(client_buf, size).await;
    buffers.put(server_buf, size).await;

    // 10MB
    if stats.from_client + stats.from_server > 10_485_760 {
        info!(
            session = %session_id,
            "relay completed large transfer: {}↑ {}↓ bytes",
            stats.from_client, stats.from_server
        );
    }
    match error {
        Some(e) => Err(e),
        None => Ok(stats),
    }
}
