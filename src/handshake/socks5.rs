use tokio::io::{AsyncRead, AsyncWrite};
use tokio_socks::tcp::Socks5Stream;

use crate::error::HandshakeError;
use crate::session::ConnectTarget;
use crate::trace::SharedRecorder;

/// Runs the SOCKS5 greeting, optional username/password sub-negotiation and
/// CONNECT request over an already open upstream connection.
///
/// The reply is consumed exactly, so whatever follows on `stream` belongs to
/// the tunnel.
pub async fn connect<S>(
    stream: &mut S,
    target: &ConnectTarget,
    credentials: Option<(&str, &str)>,
    recorder: &SharedRecorder,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let addr = (target.host.as_str(), target.port);
    match credentials {
        Some((user, pass)) => {
            recorder.record_event("socks5 handshake with user pass");
            Socks5Stream::connect_with_password_and_socket(stream, addr, user, pass).await?;
        }
        None => {
            recorder.record_event("socks5 handshake without authentication");
            Socks5Stream::connect_with_socket(stream, addr).await?;
        }
    }
    Ok(())
}
