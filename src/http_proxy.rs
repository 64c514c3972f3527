//! HTTP proxy ingress state machine (§4.4): one HTTP/1.1 request is read with a `httparse`-based
//! reader over a growable buffer, mirroring the line-buffered reader idiom used elsewhere in this
//! crate but delegating header tokenization to `httparse`. `CONNECT` opens an opaque tunnel;
//! anything else is forwarded with its hop-by-hop headers rewritten, and the same treatment is
//! applied to every subsequent request pipelined on the same keepalive connection.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::address::{join_host_port, Network, TargetAddress};
use crate::error::CoreError;

const MAX_HEAD_SIZE: usize = 64 * 1024;
const READ_CHUNK: usize = 8 * 1024;

/// What an ingress HTTP/1.1 request turned out to be.
pub enum HttpOutcome<S> {
    /// A `CONNECT` tunnel: the 200 response has already been written, and `stream` now carries
    /// opaque bytes in both directions.
    Tunnel { target: TargetAddress, stream: S },
    /// A plain-HTTP forward-mode request: `stream` yields the rewritten request (this one, then
    /// every subsequent one pipelined on the same connection) on read, and passes writes straight
    /// through to the ingress peer.
    Forward {
        target: TargetAddress,
        stream: ForwardStream<S>,
    },
}

struct ParsedHead {
    method: String,
    target: TargetAddress,
    rewritten: Vec<u8>,
    content_length: usize,
    consumed: usize,
}

const HOP_BY_HOP_DROP: &[&str] = &[
    "transfer-encoding",
    "proxy-authenticate",
    "proxy-authorization",
    "connection",
    "trailer",
    "te",
    "upgrade",
];

/// Parses one HTTP/1.1 request head out of `raw` (which may contain more bytes after it — the
/// start of the body, or even the next pipelined request). Returns `None` if `raw` does not yet
/// hold a complete head.
fn try_parse_head(raw: &[u8]) -> Result<Option<ParsedHead>, CoreError> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut header_storage);
    let status = req
        .parse(raw)
        .map_err(|e| CoreError::ProtocolSyntax(format!("malformed http request: {e}")))?;
    let consumed = match status {
        httparse::Status::Partial => {
            if raw.len() > MAX_HEAD_SIZE {
                return Err(CoreError::ProtocolSyntax("http request head too large".into()));
            }
            return Ok(None);
        }
        httparse::Status::Complete(n) => n,
    };

    let method = req.method.unwrap_or("").to_owned();
    let path = req.path.unwrap_or("/").to_owned();
    let version = req.version.unwrap_or(0);
    if version != 1 {
        return Err(CoreError::ProtocolSyntax(format!("unsupported http version {version}")));
    }

    let host_header = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .map(|h| String::from_utf8_lossy(h.value).into_owned());

    let content_length = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    if method.eq_ignore_ascii_case("CONNECT") {
        let authority = join_host_port(&path, 80);
        let target = TargetAddress::new(Network::Tcp, authority);
        return Ok(Some(ParsedHead {
            method,
            target,
            rewritten: Vec::new(),
            content_length,
            consumed,
        }));
    }

    // Absolute-form request targets are reduced to origin-form before forwarding: the origin
    // server only ever needs the path, and the authority travels in the Host header instead.
    let (authority, request_uri) = if let Some(rest) = path.strip_prefix("http://") {
        match rest.split_once('/') {
            Some((authority, tail)) => (authority.to_owned(), format!("/{tail}")),
            None => (rest.to_owned(), "/".to_owned()),
        }
    } else if let Some(host) = &host_header {
        (host.clone(), path.clone())
    } else {
        return Err(CoreError::ProtocolSyntax("no Host header and no absolute-form URI".into()));
    };
    let target = TargetAddress::new(Network::Tcp, join_host_port(&authority, 80));

    let mut rewritten = Vec::with_capacity(raw.len());
    rewritten.extend_from_slice(format!("{method} {request_uri} HTTP/1.1\r\n").as_bytes());
    for header in req.headers.iter() {
        if HOP_BY_HOP_DROP.iter().any(|h| header.name.eq_ignore_ascii_case(h)) {
            continue;
        }
        if header.name.eq_ignore_ascii_case("host") {
            continue;
        }
        if header.name.eq_ignore_ascii_case("proxy-connection") {
            rewritten.extend_from_slice(b"Connection: ");
            rewritten.extend_from_slice(header.value);
            rewritten.extend_from_slice(b"\r\n");
            continue;
        }
        rewritten.extend_from_slice(header.name.as_bytes());
        rewritten.extend_from_slice(b": ");
        rewritten.extend_from_slice(header.value);
        rewritten.extend_from_slice(b"\r\n");
    }
    rewritten.extend_from_slice(format!("Host: {authority}\r\n").as_bytes());
    rewritten.extend_from_slice(b"\r\n");

    Ok(Some(ParsedHead {
        method,
        target,
        rewritten,
        content_length,
        consumed,
    }))
}

/// Reads from `stream` until a full request head is buffered in `raw`, then returns it. Leaves
/// any bytes past the head (the start of the body, or a pipelined next request) in `raw`.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S, raw: &mut BytesMut) -> Result<ParsedHead, CoreError> {
    loop {
        if let Some(head) = try_parse_head(raw)? {
            raw.advance(head.consumed);
            return Ok(head);
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk).await.map_err(CoreError::transport)?;
        if n == 0 {
            return Err(CoreError::ProtocolSyntax("ingress closed mid-request".into()));
        }
        raw.extend_from_slice(&chunk[..n]);
    }
}

/// Drives the ingress side of one HTTP proxy connection far enough to learn its target: either a
/// `CONNECT` tunnel (with the `200` already written) or the first forward-mode request.
pub async fn handshake<S>(mut stream: S) -> Result<HttpOutcome<S>, CoreError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut raw = BytesMut::new();
    let head = read_head(&mut stream, &mut raw).await?;

    if head.method.eq_ignore_ascii_case("CONNECT") {
        drain_body(&mut stream, &mut raw, head.content_length).await?;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\n\r\n")
            .await
            .map_err(CoreError::transport)?;
        return Ok(HttpOutcome::Tunnel {
            target: head.target,
            stream,
        });
    }

    let already_buffered = raw.len().min(head.content_length);
    let body_leftover = raw.split_to(already_buffered);
    let forward = ForwardStream {
        inner: stream,
        raw: body_leftover,
        out: BytesMut::from(head.rewritten.as_slice()),
        body_remaining: head.content_length - already_buffered,
    };
    Ok(HttpOutcome::Forward {
        target: head.target,
        stream: forward,
    })
}

async fn drain_body<S: AsyncRead + Unpin>(
    stream: &mut S,
    raw: &mut BytesMut,
    content_length: usize,
) -> Result<(), CoreError> {
    let mut remaining = content_length.saturating_sub(raw.len());
    raw.clear();
    let mut buf = [0u8; READ_CHUNK];
    while remaining > 0 {
        let want = remaining.min(buf.len());
        let n = stream.read(&mut buf[..want]).await.map_err(CoreError::transport)?;
        if n == 0 {
            return Err(CoreError::ProtocolSyntax("ingress closed mid-body".into()));
        }
        remaining -= n;
    }
    Ok(())
}

/// The read side yields rewritten requests (this one, then every subsequent one pipelined on the
/// same connection); the write side passes bytes straight through, since responses are not
/// rewritten.
pub struct ForwardStream<S> {
    inner: S,
    raw: BytesMut,
    out: BytesMut,
    body_remaining: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ForwardStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.out.is_empty() {
                let n = this.out.len().min(buf.remaining());
                let chunk = this.out.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }

            if this.body_remaining > 0 {
                if !this.raw.is_empty() {
                    let n = this.raw.len().min(this.body_remaining).min(buf.remaining());
                    let chunk = this.raw.split_to(n);
                    buf.put_slice(&chunk);
                    this.body_remaining -= n;
                    return Poll::Ready(Ok(()));
                }
                let mut tmp = [0u8; READ_CHUNK];
                let want = this.body_remaining.min(buf.remaining()).min(tmp.len());
                if want == 0 {
                    return Poll::Ready(Ok(()));
                }
                let mut tmp_buf = ReadBuf::new(&mut tmp[..want]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut tmp_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = tmp_buf.filled().len();
                        if n == 0 {
                            return Poll::Ready(Ok(()));
                        }
                        buf.put_slice(&tmp[..n]);
                        this.body_remaining -= n;
                        return Poll::Ready(Ok(()));
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
                continue;
            }

            match try_parse_head(&this.raw) {
                Ok(Some(head)) => {
                    this.raw.advance(head.consumed);
                    let leftover = this.raw.len().min(head.content_length);
                    this.body_remaining = head.content_length - leftover;
                    this.out = BytesMut::from(head.rewritten.as_slice());
                    continue;
                }
                Ok(None) => {
                    let mut tmp = [0u8; READ_CHUNK];
                    let mut tmp_buf = ReadBuf::new(&mut tmp);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut tmp_buf) {
                        Poll::Ready(Ok(())) => {
                            let n = tmp_buf.filled().len();
                            if n == 0 {
                                return Poll::Ready(Ok(()));
                            }
                            this.raw.extend_from_slice(&tmp[..n]);
                            continue;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ForwardStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn s2_http_connect_tunnel_scenario() {
        let request = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let stream = tokio_test::io::Builder::new()
            .read(request)
            .write(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .build();

        match handshake(stream).await.unwrap() {
            HttpOutcome::Tunnel { target, .. } => {
                assert_eq!(target.authority, "example.com:443");
            }
            _ => panic!("expected tunnel"),
        }
    }

    #[tokio::test]
    async fn s3_http_forward_scenario() {
        let request = b"GET http://example.com/x HTTP/1.1\r\nProxy-Connection: keep-alive\r\nUser-Agent: u\r\n\r\n";
        let stream = tokio_test::io::Builder::new().read(request).build();

        match handshake(stream).await.unwrap() {
            HttpOutcome::Forward { target, mut stream } => {
                assert_eq!(target.authority, "example.com:80");
                let mut out = vec![0u8; 4096];
                let n = stream.read(&mut out).await.unwrap();
                let rewritten = String::from_utf8_lossy(&out[..n]).into_owned();
                assert_eq!(
                    rewritten,
                    "GET /x HTTP/1.1\r\nUser-Agent: u\r\nConnection: keep-alive\r\nHost: example.com\r\n\r\n"
                );
            }
            _ => panic!("expected forward"),
        }
    }
}
