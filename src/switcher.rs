//! Per-request outbound orchestration with failover.
//!
//! The first attempt sticks to the session's previous ip, or to the ip its
//! hash maps to. Every later attempt races three independently salted
//! allocations and keeps the first connection that comes up; the runner-up
//! goes back to its ip's warm cache and anything after that is closed.

use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};

use crate::compose::ProxyCompose;
use crate::connection::UpstreamConn;
use crate::error::OutboundError;
use crate::handshake::{self, choose_upstream_protocol, Protocol};
use crate::hashring::hash_key;
use crate::session::Session;
use crate::trace::SharedRecorder;

const PARALLEL_SIZE: usize = 3;

/// A tunnel through an upstream ip that passed its handshake.
pub struct Outbound {
    pub conn: UpstreamConn,
    pub protocol: Protocol,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Connects `session` to its target through the pool, retrying on
/// retryable failures until `max_failover_count` attempts are spent.
pub async fn connect_outbound(
    compose: &ProxyCompose,
    session: &Session,
) -> Result<Outbound, OutboundError> {
    let recorder = session.recorder();
    if !session.authed {
        return Err(OutboundError::Aborted("session not authenticated".into()));
    }
    let (Some(target), Some(inbound)) = (session.target(), session.inbound_protocol()) else {
        return Err(OutboundError::Aborted("session target not resolved".into()));
    };
    let settings = compose.settings();
    let max_attempts = settings.max_failover();
    let mut last = OutboundError::NotAttempted;

    for attempt in 1..=max_attempts {
        let connected = if attempt == 1 {
            first_attempt(compose, session.session_hash(), recorder).await
        } else {
            recorder.record_event(&format!("retry index: {}", attempt));
            race(compose, session.session_hash(), attempt, recorder).await
        };
        let mut conn = match connected {
            Ok(conn) => conn,
            Err(err) => {
                recorder.record_error("create upstream connection failed", &err);
                last = err;
                continue;
            }
        };

        let ip = Arc::clone(conn.ip());
        let Some(protocol) = choose_upstream_protocol(inbound, ip.source().protocols()) else {
            return Err(OutboundError::NoCompatibleProtocol {
                source_name: ip.source().name().to_string(),
                inbound,
            });
        };

        match handshake::handshake(&mut conn, protocol, target, settings.handshake_timeout(), recorder)
            .await
        {
            Ok(()) => {
                compose.mark_session_use(session.session_hash(), &ip, recorder);
                return Ok(Outbound { conn, protocol });
            }
            Err(err) => {
                drop(conn);
                let err = OutboundError::from(err);
                if !err.retryable() {
                    return Err(err);
                }
                last = err;
            }
        }
    }

    recorder.record_event(&format!("all {} outbound attempts failed", max_attempts));
    Err(OutboundError::FailoverExhausted {
        attempts: max_attempts,
        last: Box::new(last),
    })
}

async fn first_attempt(
    compose: &ProxyCompose,
    session_hash: u64,
    recorder: &SharedRecorder,
) -> Result<UpstreamConn, OutboundError> {
    match compose.fetch_cached_session(session_hash).await? {
        Some(ip) => {
            recorder.record_event("this request session hold, reuse cached ip");
            ip.borrow_connection(recorder, "CachedIp -> ").await
        }
        None => {
            recorder.record_event("first choose ip resource");
            compose
                .connect_to_outbound(session_hash, recorder, "first create -> ")
                .await
        }
    }
}

type RaceResult = Result<Result<(UpstreamConn, String), OutboundError>, JoinError>;

fn flatten(joined: RaceResult) -> Result<(UpstreamConn, String), OutboundError> {
    joined.map_err(|err| OutboundError::Aborted(err.to_string()))?
}

async fn race(
    compose: &ProxyCompose,
    session_hash: u64,
    attempt: usize,
    recorder: &SharedRecorder,
) -> Result<UpstreamConn, OutboundError> {
    let mut attempts = JoinSet::new();
    for index in 0..PARALLEL_SIZE {
        let hash = hash_key(&format!("{}{}{}", session_hash, index, attempt));
        let tag = format!("{}_{} -> ", hash, index);
        recorder.record_event(&format!("{}parallel create connection", tag));

        let compose = compose.clone();
        let recorder = Arc::clone(recorder);
        attempts.spawn(async move {
            let connected = compose.connect_to_outbound(hash, &recorder, &tag).await;
            connected.map(|conn| (conn, tag))
        });
    }

    let mut last = OutboundError::NotAttempted;
    while let Some(joined) = attempts.join_next().await {
        match flatten(joined) {
            Ok((conn, tag)) => {
                recorder.record_event(&format!("{}create connection success", tag));
                tokio::spawn(settle_losers(attempts, Arc::clone(recorder)));
                return Ok(conn);
            }
            Err(err) => last = err,
        }
    }
    recorder.record_error("all ip create connection failed", &last);
    Err(last)
}

/// Drains the attempts still running after a winner was picked: the next
/// success is parked in its ip's cache, any later one is closed.
async fn settle_losers(
    mut attempts: JoinSet<Result<(UpstreamConn, String), OutboundError>>,
    recorder: SharedRecorder,
) {
    let mut parked = false;
    while let Some(joined) = attempts.join_next().await {
        if let Ok((conn, tag)) = flatten(joined) {
            if parked {
                drop(conn);
            } else {
                recorder.record_event(&format!(
                    "{}create connection second success, restore cache",
                    tag
                ));
                conn.restore_cache();
                parked = true;
            }
        }
    }
}
