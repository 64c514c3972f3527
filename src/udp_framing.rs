//! UDP-over-TCP framing (§4.7): each datagram is carried over the TLS stream as a 2-byte
//! big-endian length prefix followed by exactly that many payload bytes.
//!
//! Grounded in the upstream `uotConn.Read`/`Write` pair. That implementation does not resynchronize
//! after a short destination buffer: the length header has already been consumed from the stream
//! by the time the buffer is found too small, so the call fails and the frame is lost rather than
//! retried. This keeps that exact behavior rather than inventing a resynchronizing variant.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CoreError;

/// SOCKS5's own UDP maximum: the largest single UDP datagram payload this framing will ever
/// carry, including the SOCKS5 UDP request header on the client's loopback side.
pub const MAX_PACKET_SIZE: usize = 65507;

/// Reads one framed datagram into `buf`, returning the number of bytes written. Fails with
/// [`CoreError::Framing`] if `buf` is too small to hold the datagram the header announced; by
/// then the length header has already been read off the stream, so the frame itself is lost.
pub async fn read_datagram<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> Result<usize, CoreError> {
    let n = r.read_u16().await.map_err(CoreError::transport)? as usize;
    if n > MAX_PACKET_SIZE - 2 {
        return Err(CoreError::Framing(format!("frame of {n} bytes exceeds max packet size")));
    }
    if buf.len() < n {
        return Err(CoreError::Framing(format!(
            "short buffer: need {n} bytes, have {}",
            buf.len()
        )));
    }
    r.read_exact(&mut buf[..n]).await.map_err(CoreError::transport)?;
    Ok(n)
}

/// Writes one framed datagram: a 2-byte big-endian length prefix followed by `payload`.
pub async fn write_datagram<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<(), CoreError> {
    if payload.len() > MAX_PACKET_SIZE - 2 {
        return Err(CoreError::Framing(format!(
            "payload of {} bytes exceeds max packet size",
            payload.len()
        )));
    }
    w.write_u16(payload.len() as u16).await.map_err(CoreError::transport)?;
    w.write_all(payload).await.map_err(CoreError::transport)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_datagram() {
        let mut wire = Vec::new();
        write_datagram(&mut wire, b"hello world").await.unwrap();

        let mut cursor = std::io::Cursor::new(wire);
        let mut buf = [0u8; 64];
        let n = read_datagram(&mut cursor, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[tokio::test]
    async fn short_destination_buffer_errors() {
        let mut wire = Vec::new();
        write_datagram(&mut wire, b"hello world").await.unwrap();

        let mut cursor = std::io::Cursor::new(wire);
        let mut buf = [0u8; 4];
        assert!(read_datagram(&mut cursor, &mut buf).await.is_err());
    }

    #[tokio::test]
    async fn oversized_write_rejected() {
        let oversized = vec![0u8; MAX_PACKET_SIZE];
        let mut wire = Vec::new();
        assert!(write_datagram(&mut wire, &oversized).await.is_err());
    }
}
