//! SOCKS5 inbound (RFC 1928), CONNECT only, with optional username/password
//! sub-negotiation (RFC 1929).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use color_eyre::eyre::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::relay::relay;
use super::InboundContext;
use crate::handshake::Protocol;
use crate::session::{ConnectTarget, Session};
use crate::switcher::connect_outbound;

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NONE: u8 = 0x00;
const METHOD_PASSWORD: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

pub async fn serve<S>(ctx: Arc<InboundContext>, mut stream: S, peer: SocketAddr, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::new(port, peer.ip());
    if !negotiate_auth(&ctx, &mut stream, &session).await? {
        return Ok(());
    }
    session.authed = true;

    let Some(target) = read_request(&mut stream).await? else {
        return Ok(());
    };
    session.on_proxy_target_resolved(target, Protocol::Socks5, ctx.compose.settings().random_turning);

    let outbound = match connect_outbound(&ctx.compose, &session).await {
        Ok(outbound) => outbound,
        Err(err) => {
            debug!(session = %session.id, "SOCKS5 via pool failed: {}", err);
            write_reply(&mut stream, REPLY_GENERAL_FAILURE).await?;
            return Ok(());
        }
    };
    write_reply(&mut stream, REPLY_SUCCEEDED).await?;

    let idle = ctx.compose.settings().relay_idle_timeout();
    let stats = relay(stream, outbound.conn, idle, &ctx.buffers, &session.id).await?;
    debug!(
        session = %session.id,
        idle_timeout = stats.idle_timeout,
        "socks5 tunnel closed: {}↑ {}↓ bytes",
        stats.from_client,
        stats.from_server
    );
    Ok(())
}

/// Method selection plus sub-negotiation. `false` means the client was
/// turned away and the connection should close.
async fn negotiate_auth<S>(ctx: &InboundContext, stream: &mut S, session: &Session) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        bail!("unsupported socks version {}", head[0]);
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    let need_password = !ctx.auth.allows_ip(session.client_ip);
    let method = if !need_password && methods.contains(&METHOD_NONE) {
        METHOD_NONE
    } else if methods.contains(&METHOD_PASSWORD) {
        METHOD_PASSWORD
    } else {
        METHOD_UNACCEPTABLE
    };
    stream.write_all(&[VERSION, method]).await?;

    match method {
        METHOD_NONE => Ok(true),
        METHOD_PASSWORD => {
            let (user, pass) = read_credentials(stream).await?;
            let accepted = !need_password || ctx.auth.check_credentials(&user, &pass);
            let status = if accepted { 0x00 } else { 0x01 };
            stream.write_all(&[AUTH_VERSION, status]).await?;
            if !accepted {
                session.recorder().record_event("socks5 authentication failed");
            }
            Ok(accepted)
        }
        _ => {
            session.recorder().record_event("no acceptable socks5 auth method");
            Ok(false)
        }
    }
}

async fn read_credentials<S>(stream: &mut S) -> Result<(String, String)>
where
    S: AsyncRead + Unpin,
{
    let version = stream.read_u8().await?;
    if version != AUTH_VERSION {
        bail!("unsupported auth version {}", version);
    }
    let user = read_short_string(stream).await?;
    let pass = read_short_string(stream).await?;
    Ok((user, pass))
}

async fn read_short_string<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u8().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Reads the CONNECT request. Unsupported requests are answered here and
/// yield `None`.
async fn read_request<S>(stream: &mut S) -> Result<Option<ConnectTarget>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let [version, cmd, _reserved, atyp] = head;
    if version != VERSION {
        bail!("unsupported socks version {}", version);
    }

    let host = match atyp {
        ATYP_V4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_V6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => read_short_string(stream).await?,
        _ => {
            write_reply(stream, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Ok(None);
        }
    };
    let port = stream.read_u16().await?;

    if cmd != CMD_CONNECT {
        write_reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Ok(None);
    }
    Ok(Some(ConnectTarget::new(host, port)))
}

async fn write_reply<S>(stream: &mut S, reply: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[VERSION, reply, 0x00, ATYP_V4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::proxy_with;
    use super::*;
    use crate::config::GlobalSettings;
    use tokio::net::TcpStream;

    async fn open(port: u16) -> TcpStream {
        TcpStream::connect(("127.0.0.1", port)).await.unwrap()
    }

    async fn request_connect(client: &mut TcpStream, host: &str, port: u16) -> [u8; 10] {
        let mut req = vec![VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8];
        req.extend_from_slice(host.as_bytes());
        req.extend_from_slice(&port.to_be_bytes());
        client.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        reply
    }

    /// Upstream SOCKS5 server that accepts any CONNECT and echoes.
    async fn upstream_socks5() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut head = [0u8; 2];
                    stream.read_exact(&mut head).await?;
                    let mut methods = vec![0u8; head[1] as usize];
                    stream.read_exact(&mut methods).await?;
                    stream.write_all(&[VERSION, METHOD_NONE]).await?;

                    let mut req = [0u8; 4];
                    stream.read_exact(&mut req).await?;
                    let addr_len = match req[3] {
                        ATYP_V4 => 4,
                        ATYP_V6 => 16,
                        _ => stream.read_u8().await? as usize,
                    };
                    let mut addr = vec![0u8; addr_len + 2];
                    stream.read_exact(&mut addr).await?;
                    write_reply(&mut stream, REPLY_SUCCEEDED).await.unwrap();

                    let (mut rd, mut wr) = stream.split();
                    tokio::io::copy(&mut rd, &mut wr).await?;
                    Ok::<_, std::io::Error>(())
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn connect_through_pool() {
        let upstream = upstream_socks5().await;
        let port = proxy_with(GlobalSettings::default(), "socks5", Some(upstream)).await;

        let mut client = open(port).await;
        client.write_all(&[VERSION, 1, METHOD_NONE]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [VERSION, METHOD_NONE]);

        let reply = request_connect(&mut client, "example.com", 443).await;
        assert_eq!(reply[1], REPLY_SUCCEEDED);

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }

    #[tokio::test]
    async fn password_is_required_when_configured() {
        let global = GlobalSettings {
            auth_username: Some("admin".into()),
            auth_password: Some("secret".into()),
            ..GlobalSettings::default()
        };
        let port = proxy_with(global, "socks5", None).await;

        let mut client = open(port).await;
        client.write_all(&[VERSION, 1, METHOD_NONE]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [VERSION, METHOD_UNACCEPTABLE]);

        let mut client = open(port).await;
        client
            .write_all(&[VERSION, 2, METHOD_NONE, METHOD_PASSWORD])
            .await
            .unwrap();
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [VERSION, METHOD_PASSWORD]);
        client
            .write_all(&[AUTH_VERSION, 5, b'a', b'd', b'm', b'i', b'n', 5, b'w', b'r', b'o', b'n', b'g'])
            .await
            .unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [AUTH_VERSION, 0x01]);
    }

    #[tokio::test]
    async fn unsupported_command_is_refused() {
        let port = proxy_with(GlobalSettings::default(), "socks5", None).await;

        let mut client = open(port).await;
        client.write_all(&[VERSION, 1, METHOD_NONE]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();

        // BIND
        client
            .write_all(&[VERSION, 0x02, 0x00, ATYP_V4, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn empty_pool_is_general_failure() {
        let port = proxy_with(GlobalSettings::default(), "socks5", None).await;

        let mut client = open(port).await;
        client.write_all(&[VERSION, 1, METHOD_NONE]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();

        let reply = request_connect(&mut client, "example.com", 443).await;
        assert_eq!(reply[1], REPLY_GENERAL_FAILURE);
    }
}
