//! Bidirectional relay between the two sides of a session (§4.6).
//!
//! Grounded in the upstream `Relay` helper, which runs `io.Copy` in each direction on its own
//! goroutine and wakes the other one up by forcing a socket deadline once either side finishes.
//! Tokio streams have no deadline primitive to repurpose that way, so a
//! [`tokio_util::sync::CancellationToken`] stands in for it: whichever direction finishes first
//! cancels the token, and the other direction's in-flight read is raced against that
//! cancellation rather than left to block on a peer that may never write again.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;

const RELAY_BUF_SIZE: usize = 32 * 1024;

/// Copies bytes bidirectionally between `left` and `right` until either side reaches EOF or
/// errors, then cancels the other direction and returns. Mirrors the upstream semantics: the
/// first direction's genuine outcome is the one returned; a cancellation that fired only because
/// the other direction finished first is never reported as an error.
pub async fn relay<L, R>(mut left: L, mut right: R) -> Result<(), CoreError>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let token = CancellationToken::new();

    let (mut left_r, mut left_w) = tokio::io::split(&mut left);
    let (mut right_r, mut right_w) = tokio::io::split(&mut right);

    let l_to_r = copy_cancellable(&mut left_r, &mut right_w, &token);
    let r_to_l = copy_cancellable(&mut right_r, &mut left_w, &token);

    let (l_to_r_result, r_to_l_result) = tokio::join!(l_to_r, r_to_l);

    // Whichever direction did not self-cancel carries the real outcome; a direction only reports
    // `None` when it was woken by the other side's completion rather than its own I/O.
    match (l_to_r_result, r_to_l_result) {
        (Some(res), _) => res,
        (None, Some(res)) => res,
        (None, None) => Ok(()),
    }
}

/// Copies from `reader` to `writer` until EOF, error, or `token` is cancelled by the other
/// direction. Cancels `token` itself on completion so the peer direction unblocks. Returns `None`
/// if this copy was the one woken by cancellation (its outcome is not the relay's real result).
async fn copy_cancellable<RD, WR>(
    reader: &mut RD,
    writer: &mut WR,
    token: &CancellationToken,
) -> Option<Result<(), CoreError>>
where
    RD: AsyncRead + Unpin,
    WR: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let result = loop {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => break None,
            res = reader.read(&mut buf) => res,
        };
        match read {
            Ok(0) => break Some(Ok(())),
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Some(Err(CoreError::relay(e)));
                }
            }
            Err(e) => break Some(Err(CoreError::relay(e))),
        }
    };
    let _ = writer.shutdown().await;
    token.cancel();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn relays_until_both_sides_close() {
        let (mut client_a, server_a) = duplex(64);
        let (client_b, mut server_b) = duplex(64);

        let relay_task = tokio::spawn(relay(server_a, client_b));

        client_a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server_b.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client_a);
        drop(server_b);

        relay_task.await.unwrap().unwrap();
    }
}
