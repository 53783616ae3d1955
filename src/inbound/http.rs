//! HTTP inbound: CONNECT tunnels and plain forwarded requests.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use color_eyre::eyre::Result;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::client::conn::http1::Builder;
use hyper::header::{HeaderValue, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::relay::relay;
use super::InboundContext;
use crate::handshake::Protocol;
use crate::session::{ConnectTarget, Session};
use crate::switcher::{connect_outbound, Outbound};

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

const PROXY_CONNECTION: &str = "proxy-connection";

pub async fn serve(
    ctx: Arc<InboundContext>,
    stream: TcpStream,
    peer: SocketAddr,
    port: u16,
) -> Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| proxy(Arc::clone(&ctx), req, peer, port));

    if let Err(err) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        // normal endings are not worth a warning
        if !err.to_string().contains("connection closed") {
            warn!("Connection from {} error: {:?}", peer, err);
        }
    }
    Ok(())
}

async fn proxy(
    ctx: Arc<InboundContext>,
    req: Request<hyper::body::Incoming>,
    peer: SocketAddr,
    port: u16,
) -> Result<ProxyResponse, hyper::Error> {
    let mut session = Session::new(port, peer.ip());

    let authorization = req
        .headers()
        .get(PROXY_AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if !ctx.auth.allows_ip(peer.ip()) && !ctx.auth.check_basic(authorization) {
        session.recorder().record_event("proxy authentication failed");
        return Ok(proxy_auth_required_response("Proxy authentication required"));
    }
    session.authed = true;

    let random_turning = ctx.compose.settings().random_turning;
    if Method::CONNECT == req.method() {
        let Some(target) = req
            .uri()
            .authority()
            .and_then(|auth| ConnectTarget::parse(auth.as_str(), 443))
        else {
            warn!("CONNECT host is not socket addr: {:?}", req.uri());
            return Ok(status_response(
                StatusCode::BAD_REQUEST,
                "CONNECT must be to a socket address",
            ));
        };
        session.on_proxy_target_resolved(target, Protocol::Https, random_turning);
        connect(ctx, req, session).await
    } else {
        let Some(host) = req.uri().host() else {
            warn!("HTTP request missing host: {:?}", req.uri());
            return Ok(status_response(StatusCode::BAD_REQUEST, "HTTP request missing host"));
        };
        let target = ConnectTarget::new(host.trim_matches(['[', ']']), req.uri().port_u16().unwrap_or(80));
        session.on_proxy_target_resolved(target, Protocol::Http, random_turning);
        forward(ctx, req, session).await
    }
}

async fn connect(
    ctx: Arc<InboundContext>,
    req: Request<hyper::body::Incoming>,
    session: Session,
) -> Result<ProxyResponse, hyper::Error> {
    let outbound = match connect_outbound(&ctx.compose, &session).await {
        Ok(outbound) => outbound,
        Err(err) => {
            warn!(session = %session.id, "CONNECT via pool failed: {}", err);
            return Ok(status_response(StatusCode::BAD_GATEWAY, "Upstream connection failed"));
        }
    };

    let idle = ctx.compose.settings().relay_idle_timeout();
    tokio::task::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let client = TokioIo::new(upgraded);
                match relay(client, outbound.conn, idle, &ctx.buffers, &session.id).await {
                    Ok(stats) => debug!(
                        session = %session.id,
                        idle_timeout = stats.idle_timeout,
                        "tunnel closed: {}↑ {}↓ bytes",
                        stats.from_client,
                        stats.from_server
                    ),
                    Err(e) => debug!(session = %session.id, "tunnel io error: {}", e),
                }
            }
            Err(e) => warn!("upgrade error: {}", e),
        }
    });

    Ok(Response::new(empty()))
}

async fn forward(
    ctx: Arc<InboundContext>,
    mut req: Request<hyper::body::Incoming>,
    session: Session,
) -> Result<ProxyResponse, hyper::Error> {
    let Outbound { conn, protocol } = match connect_outbound(&ctx.compose, &session).await {
        Ok(outbound) => outbound,
        Err(err) => {
            warn!(session = %session.id, "HTTP via pool failed: {}", err);
            return Ok(status_response(StatusCode::BAD_GATEWAY, "Upstream connection failed"));
        }
    };

    req.headers_mut().remove(PROXY_AUTHORIZATION);
    req.headers_mut().remove(PROXY_CONNECTION);
    if protocol == Protocol::Http {
        // the upstream is itself an http proxy: keep absolute-form
        if let Some(value) = conn
            .ip()
            .http_authorization()
            .and_then(|auth| HeaderValue::from_str(&auth).ok())
        {
            req.headers_mut().insert(PROXY_AUTHORIZATION, value);
        }
    } else if let Err(resp) = to_origin_form(&mut req, &session) {
        return Ok(resp);
    }

    let (mut sender, driver) = Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(conn))
        .await?;
    let session_id = session.id.clone();
    tokio::spawn(async move {
        if let Err(err) = driver.await {
            if !err.to_string().contains("connection closed") {
                warn!(session = %session_id, "upstream http connection error: {:?}", err);
            }
        }
    });

    let timeout = ctx.compose.settings().relay_idle_timeout();
    match tokio::time::timeout(timeout, sender.send_request(req)).await {
        Ok(Ok(resp)) => Ok(resp.map(|b| b.boxed())),
        Ok(Err(err)) => {
            session.recorder().record_error("forward request failed", &err);
            Ok(status_response(StatusCode::BAD_GATEWAY, "Upstream request failed"))
        }
        Err(_) => {
            warn!(session = %session.id, "HTTP timeout after {:?}", timeout);
            Ok(status_response(StatusCode::GATEWAY_TIMEOUT, "Request timeout"))
        }
    }
}

/// Rewrites an absolute-form request for an origin server behind a tunnel.
fn to_origin_form(
    req: &mut Request<hyper::body::Incoming>,
    session: &Session,
) -> Result<(), ProxyResponse> {
    let mut parts = http::uri::Parts::default();
    parts.path_and_query = Some(
        req.uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| http::uri::PathAndQuery::from_static("/")),
    );
    let bad_request = || status_response(StatusCode::BAD_REQUEST, "Invalid request target");
    *req.uri_mut() = Uri::from_parts(parts).map_err(|_| bad_request())?;

    if !req.headers().contains_key(HOST) {
        let target = session.target().ok_or_else(bad_request)?;
        let host = if target.port == 80 {
            target.host.clone()
        } else {
            target.to_string()
        };
        let value = HeaderValue::from_str(&host).map_err(|_| bad_request())?;
        req.headers_mut().insert(HOST, value);
    }
    Ok(())
}

fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn status_response(status: StatusCode, msg: &'static str) -> ProxyResponse {
    let mut resp = Response::new(full(msg));
    *resp.status_mut() = status;
    resp
}

fn proxy_auth_required_response(msg: &'static str) -> ProxyResponse {
    let mut response = status_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED, msg);
    response.headers_mut().insert(
        PROXY_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"proxy\""),
    );
    response
}
