//! Client facing listeners: one per mapped port, speaking HTTP, HTTP CONNECT
//! or SOCKS5 on the same socket.

pub mod http;
pub mod relay;
pub mod socks5;

use std::net::SocketAddr;
use std::sync::Arc;

use color_eyre::eyre::Result;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::auth::AuthRules;
use crate::buffer_pool::BufferPool;
use crate::compose::ProxyCompose;

const SOCKS5_VERSION: u8 = 0x05;

/// Everything a client connection needs, built once at start-up.
pub struct InboundContext {
    pub compose: ProxyCompose,
    pub auth: AuthRules,
    pub buffers: BufferPool,
}

impl InboundContext {
    pub fn new(compose: ProxyCompose, auth: AuthRules) -> Arc<Self> {
        Arc::new(Self {
            compose,
            auth,
            buffers: BufferPool::new(),
        })
    }
}

/// Accepts clients on `listener` until the task is dropped.
pub async fn serve(ctx: Arc<InboundContext>, listener: TcpListener) {
    let port = listener.local_addr().map(|addr| addr.port()).unwrap_or_default();
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(err) = handle(ctx, stream, peer, port).await {
                        debug!(port, peer = %peer, "client connection error: {:#}", err);
                    }
                });
            }
            Err(e) => {
                warn!(port, "Accept error: {} (continuing)", e);
            }
        }
    }
}

async fn handle(ctx: Arc<InboundContext>, stream: TcpStream, peer: SocketAddr, port: u16) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let mut first = [0u8; 1];
    if stream.peek(&mut first).await? == 0 {
        return Ok(());
    }
    if first[0] == SOCKS5_VERSION {
        socks5::serve(ctx, stream, peer, port).await
    } else {
        http::serve(ctx, stream, peer, port).await
    }
}
