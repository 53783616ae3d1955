use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HandshakeError;
use crate::session::ConnectTarget;
use crate::trace::SharedRecorder;

const MAX_RESPONSE_HEAD: usize = 16 * 1024;

struct ResponseHead {
    status: u16,
    reason: String,
    content_length: usize,
}

/// Opens an HTTP CONNECT tunnel and returns any bytes the upstream sent
/// after its `200` response.
///
/// A first `407` is answered by sending the request again, since some
/// upstreams reject the credentials on the first try. A second `407` means
/// the credentials are wrong.
pub async fn connect_tunnel<S>(
    stream: &mut S,
    target: &ConnectTarget,
    authorization: Option<&str>,
    recorder: &SharedRecorder,
) -> Result<BytesMut, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if authorization.is_none() {
        recorder.record_event("this ip source does not need authentication");
    }
    let mut buf = BytesMut::with_capacity(1024);
    let mut auth_resent = false;

    loop {
        write_connect(stream, target, authorization).await?;
        let head = read_response_head(stream, &mut buf).await?;
        recorder.record_event(&format!("connect response: {} {}", head.status, head.reason));

        match head.status {
            200 => return Ok(buf),
            407 if !auth_resent => {
                recorder.record_event("407 response, send user pass again");
                skip_body(stream, &mut buf, head.content_length).await?;
                auth_resent = true;
            }
            407 => return Err(HandshakeError::BadCredentials),
            status => {
                return Err(HandshakeError::Status {
                    status,
                    reason: head.reason,
                })
            }
        }
    }
}

async fn write_connect<S>(
    stream: &mut S,
    target: &ConnectTarget,
    authorization: Option<&str>,
) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {t} HTTP/1.1\r\nHost: {t}\r\n", t = target);
    if let Some(value) = authorization {
        request.push_str("Proxy-Authorization: ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("Proxy-Connection: keep-alive\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_response_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<ResponseHead, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut response = httparse::Response::new(&mut headers);
            match response.parse(buf) {
                Ok(httparse::Status::Complete(len)) => {
                    let head = ResponseHead {
                        status: response.code.unwrap_or_default(),
                        reason: response.reason.unwrap_or_default().to_string(),
                        content_length: response
                            .headers
                            .iter()
                            .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                            .and_then(|h| std::str::from_utf8(h.value).ok())
                            .and_then(|v| v.trim().parse().ok())
                            .unwrap_or(0),
                    };
                    buf.advance(len);
                    return Ok(head);
                }
                Ok(httparse::Status::Partial) => {}
                Err(err) => return Err(HandshakeError::Malformed(err.to_string())),
            }
        }
        if buf.len() >= MAX_RESPONSE_HEAD {
            return Err(HandshakeError::Malformed("response head too large".into()));
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(HandshakeError::Closed);
        }
    }
}

async fn skip_body<S>(stream: &mut S, buf: &mut BytesMut, len: usize) -> Result<(), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let buffered = len.min(buf.len());
    buf.advance(buffered);
    let mut remaining = len - buffered;
    let mut chunk = [0u8; 1024];
    while remaining > 0 {
        let want = remaining.min(chunk.len());
        let n = stream.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(HandshakeError::Closed);
        }
        remaining -= n;
    }
    Ok(())
}
