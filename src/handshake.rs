//! The signed-HTTP handshake exchanged between client and server endpoints over the already
//! established TLS stream (§4.1, §4.5). This is the only message exchanged on that stream before
//! steady-state relay begins.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::form_urlencoded;

use crate::address::{Network, TargetAddress};
use crate::error::CoreError;
use crate::signer;

const MAX_REQUEST_LINE: usize = 8192;

/// Reads bytes from `stream` one at a time until two consecutive `\r\n\r\n` bytes are seen,
/// mirroring the original line reader's incremental-buffer approach (grounded in the upstream
/// `httpReader.ReadLine`/`ReadToEnd` pair) but collapsed to the single line this handshake ever
/// needs: callers only care about the request/status line, so the blank line terminating the
/// (header-less) message is read and discarded here too.
async fn read_request_line<R: AsyncRead + Unpin>(stream: &mut R) -> Result<String, CoreError> {
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.map_err(CoreError::transport)?;
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n") && buf.len() >= 2 {
            break;
        }
        if buf.len() > MAX_REQUEST_LINE {
            return Err(CoreError::ProtocolSyntax("handshake line too long".into()));
        }
    }
    // Consume the blank line that terminates the (header-less) request/response.
    let mut blank = [0u8; 2];
    stream.read_exact(&mut blank).await.map_err(CoreError::transport)?;
    if &blank != b"\r\n" {
        return Err(CoreError::ProtocolSyntax("expected blank line after request line".into()));
    }
    String::from_utf8(buf).map_err(|_| CoreError::ProtocolSyntax("non-utf8 handshake line".into()))
}

/// Client side: emit the signed request and parse the server's status line, returning on success
/// iff it reported `200`.
pub async fn client_handshake<S>(
    stream: &mut S,
    target: &TargetAddress,
    password: &[u8],
    now: i64,
) -> Result<(), CoreError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let sig = signer::sign(password, &target.authority, now);
    let query: String = form_urlencoded::Serializer::new(String::new())
        .append_pair("target", &target.authority)
        .append_pair("time", &now.to_string())
        .append_pair("sig", &hex::encode(sig))
        .append_pair("network", &target.network.to_string())
        .finish();
    let request = format!("GET /?{query} HTTP/1.1\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(CoreError::transport)?;

    let status_line = read_request_line(stream).await?;
    let parts: Vec<&str> = status_line.trim_end().splitn(3, ' ').collect();
    if parts.len() < 2 || parts[0] != "HTTP/1.1" {
        return Err(CoreError::ProtocolSyntax(format!(
            "malformed handshake status line {status_line:?}"
        )));
    }
    let code: u16 = parts[1]
        .parse()
        .map_err(|_| CoreError::ProtocolSyntax(format!("non-numeric status code {:?}", parts[1])))?;
    if code != 200 {
        return Err(CoreError::Auth(format!("handshake rejected with status {code}")));
    }
    Ok(())
}

/// Server side: parse the client's signed request, verify it, and reply. Returns the verified
/// target on success; on any failure this has already written the appropriate status line to
/// `stream` before returning the error.
pub async fn server_handshake<S>(
    stream: &mut S,
    password: &[u8],
    now: i64,
) -> Result<TargetAddress, CoreError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request_line = match read_request_line(stream).await {
        Ok(line) => line,
        Err(e) => {
            let _ = respond(stream, 400, "Bad Request").await;
            return Err(e);
        }
    };

    let verified = parse_and_verify(&request_line, password, now);
    match verified {
        Ok(target) => {
            respond(stream, 200, "OK").await?;
            Ok(target)
        }
        Err(e) => {
            let (code, reason) = match &e {
                CoreError::ProtocolSyntax(_) => (400, "Bad Request"),
                _ => (403, "Forbidden"),
            };
            let _ = respond(stream, code, reason).await;
            Err(e)
        }
    }
}

fn parse_and_verify(request_line: &str, password: &[u8], now: i64) -> Result<TargetAddress, CoreError> {
    let line = request_line.trim_end();
    let parts: Vec<&str> = line.splitn(3, ' ').collect();
    if parts.len() != 3 || parts[2] != "HTTP/1.1" {
        return Err(CoreError::ProtocolSyntax(format!("malformed request line {line:?}")));
    }
    if parts[0] != "GET" {
        return Err(CoreError::Auth(format!("unsupported method {:?}", parts[0])));
    }
    let uri = parts[1];
    let (path, query) = uri.split_once('?').unwrap_or((uri, ""));
    if path != "/" {
        return Err(CoreError::Auth(format!("unexpected path {path:?}")));
    }

    let mut target = None;
    let mut time = None;
    let mut sig = None;
    let mut network = Network::Tcp;
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "target" => target = Some(value.into_owned()),
            "time" => time = Some(value.into_owned()),
            "sig" => sig = Some(value.into_owned()),
            "network" => network = value.parse()?,
            _ => {}
        }
    }

    let target = target.ok_or_else(|| CoreError::Auth("missing target".into()))?;
    let time = time.ok_or_else(|| CoreError::Auth("missing time".into()))?;
    let sig = sig.ok_or_else(|| CoreError::Auth("missing sig".into()))?;

    let ts: i64 = time.parse().map_err(|_| CoreError::Auth(format!("non-numeric time {time:?}")))?;
    let sig_bytes = hex::decode(&sig).map_err(|_| CoreError::Auth("sig is not hex".into()))?;

    if !signer::verify(password, &target, ts, &sig_bytes, now) {
        return Err(CoreError::Auth("signature verification failed".into()));
    }

    Ok(TargetAddress::new(network, target))
}

async fn respond<S: AsyncWrite + Unpin>(stream: &mut S, code: u16, reason: &str) -> Result<(), CoreError> {
    let line = format!("HTTP/1.1 {code} {reason}\r\n\r\n");
    stream.write_all(line.as_bytes()).await.map_err(CoreError::transport)
}
