//! UDP-over-TCP session handling on both endpoints (§4.8).
//!
//! The client side owns exactly one local UDP socket for the whole process; each local
//! application datagram carries a SOCKS5 UDP request header (RFC 1928 §7) naming its real
//! destination, and is mapped by source address to a lazily-dialed `udp`-mode egress connection.
//! Every frame sent over that connection — not just the first — keeps its SOCKS5 header intact
//! (§6), because a single UDP association is free to target more than one destination from the
//! same local source port. The server side does the mirror image: one unconnected UDP socket per
//! TLS stream, demultiplexed per frame by the header each frame carries, rather than a single
//! `connect()`ed peer.

use std::net::SocketAddr;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::address::{decode_socks5_address, encode_socks5_address, Network, Socks5Address, TargetAddress};
use crate::error::CoreError;
use crate::handshake;
use crate::udp_framing::{read_datagram, write_datagram, MAX_PACKET_SIZE};

/// Parses a SOCKS5 UDP request datagram's header, returning the destination (both as a dialable
/// `SocketAddr` and as a [`TargetAddress`]) and the offset of the payload that follows it.
fn parse_udp_header(packet: &[u8]) -> Result<(SocketAddr, TargetAddress, usize), CoreError> {
    if packet.len() < 4 {
        return Err(CoreError::Framing("udp packet shorter than header".into()));
    }
    if packet[2] != 0 {
        return Err(CoreError::Framing("udp fragmentation is not supported".into()));
    }
    let (addr, port, consumed) = decode_socks5_address(&packet[3..])?;
    let header_len = 3 + consumed;
    let target = TargetAddress::new(Network::Udp, format!("{}:{}", addr.host_string(), port));
    let socks_addr = addr
        .host_string()
        .parse()
        .map(|ip| SocketAddr::new(ip, port))
        .unwrap_or_else(|_| SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port));
    Ok((socks_addr, target, header_len))
}

/// Encodes a SOCKS5 UDP response datagram (header + payload) naming `from` as the originating
/// address, used to hand a reply back to a local application with its real source intact.
fn encode_udp_response(from: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8, 0u8, 0u8];
    out.extend(encode_socks5_address(&Socks5Address::from(from.ip()), from.port()));
    out.extend_from_slice(payload);
    out
}

struct ClientSession {
    to_egress: mpsc::Sender<Vec<u8>>,
}

/// Drives the client's single shared UDP socket for the life of the process. Each distinct
/// source address gets its own lazily-dialed `udp`-mode egress connection to `server_addr`,
/// cached in `sessions` until that connection errors out. Every received packet — header and
/// payload together — is forwarded over that connection verbatim, so the destination carried by
/// each individual packet survives even when later packets from the same source target a
/// different destination than the one used to dial the connection.
pub async fn run_client_udp_relay(
    socket: UdpSocket,
    server_addr: String,
    connector: tokio_rustls::TlsConnector,
    server_name: rustls_pki_types::ServerName<'static>,
    password: Arc<Vec<u8>>,
) {
    let socket = Arc::new(socket);
    let sessions: Arc<Mutex<HashMap<SocketAddr, ClientSession>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "client udp relay socket recv error");
                continue;
            }
        };

        let (_dst, target, _header_len) = match parse_udp_header(&buf[..n]) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "dropping malformed socks5 udp packet");
                continue;
            }
        };
        // The full packet, header included, is what gets tunneled — not just the payload past
        // the header — so each packet's own destination survives to the server side (§6).
        let packet = buf[..n].to_vec();

        let mut sessions_guard = sessions.lock().await;
        if let Some(session) = sessions_guard.get(&src) {
            if session.to_egress.send(packet).await.is_ok() {
                continue;
            }
        }

        debug!(?src, target = %target, "dialing new client-side udp egress session");
        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        sessions_guard.insert(src, ClientSession { to_egress: tx.clone() });
        drop(sessions_guard);

        let _ = tx.send(packet).await;

        tokio::spawn(run_client_udp_egress(
            socket.clone(),
            sessions.clone(),
            src,
            target,
            server_addr.clone(),
            connector.clone(),
            server_name.clone(),
            password.clone(),
            rx,
        ));
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_client_udp_egress(
    socket: Arc<UdpSocket>,
    sessions: Arc<Mutex<HashMap<SocketAddr, ClientSession>>>,
    src: SocketAddr,
    target: TargetAddress,
    server_addr: String,
    connector: tokio_rustls::TlsConnector,
    server_name: rustls_pki_types::ServerName<'static>,
    password: Arc<Vec<u8>>,
    mut from_local: mpsc::Receiver<Vec<u8>>,
) {
    let result: Result<(), CoreError> = async {
        let tcp = tokio::net::TcpStream::connect(&server_addr)
            .await
            .map_err(CoreError::transport)?;
        let mut tls = connector.connect(server_name, tcp).await.map_err(CoreError::transport)?;
        let now = now_unix();
        handshake::client_handshake(&mut tls, &target, &password, now).await?;

        loop {
            tokio::select! {
                biased;
                maybe_packet = from_local.recv() => {
                    let Some(packet) = maybe_packet else { break };
                    write_datagram(&mut tls, &packet).await?;
                }
                read = read_datagram_into_owned(&mut tls) => {
                    // The server's reply is itself a full SOCKS5 UDP datagram (header + payload)
                    // naming the address that actually answered, so it is handed to the local
                    // application unmodified.
                    let packet = read?;
                    if socket.send_to(&packet, src).await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        debug!(?src, error = %e, "client-side udp egress session ended");
    }
    sessions.lock().await.remove(&src);
}

async fn read_datagram_into_owned<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, CoreError> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let n = read_datagram(stream, &mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

/// Server side: after the signed-HTTP handshake verified a `udp`-mode session (`target` is the
/// first destination the client named, kept only for logging), this owns the connection for the
/// life of the UDP association. It binds one unconnected UDP socket per TLS stream and, per
/// RFC 1928 §7, lets each individual frame carry its own destination: every frame read from
/// `stream` has its SOCKS5 header parsed fresh and its payload `send_to`'d there, and every
/// datagram received back is wrapped in a SOCKS5 header naming whoever actually replied before
/// being framed back onto `stream`.
pub async fn run_server_udp_session<S>(mut stream: S, target: TargetAddress) -> Result<(), CoreError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(target = %target, "server udp session established");
    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(CoreError::transport)?;

    let mut recv_buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        tokio::select! {
            biased;
            framed = read_datagram_into_owned(&mut stream) => {
                let packet = framed?;
                let (dest, _target, header_len) = parse_udp_header(&packet)?;
                socket.send_to(&packet[header_len..], dest).await.map_err(CoreError::transport)?;
            }
            received = socket.recv_from(&mut recv_buf) => {
                let (n, from) = received.map_err(CoreError::transport)?;
                let response = encode_udp_response(from, &recv_buf[..n]);
                write_datagram(&mut stream, &response).await?;
            }
        }
    }
}

/// Encodes a full SOCKS5 UDP request datagram (header + payload) for an arbitrary address,
/// including domain names. Used by tests; production code only ever needs [`encode_udp_response`]
/// since real traffic is always addressed by a resolved `SocketAddr`.
#[cfg(test)]
fn encode_udp_packet(dst: &Socks5Address, port: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8, 0u8, 0u8];
    out.extend(encode_socks5_address(dst, port));
    out.extend_from_slice(payload);
    out
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn parses_udp_header() {
        let packet = encode_udp_packet(&Socks5Address::Ipv4(Ipv4Addr::new(8, 8, 8, 8)), 53, b"query");
        let (_dst, target, header_len) = parse_udp_header(&packet).unwrap();
        assert_eq!(target.authority, "8.8.8.8:53");
        assert_eq!(&packet[header_len..], b"query");
    }

    #[test]
    fn rejects_fragmented_packets() {
        let mut packet = encode_udp_packet(&Socks5Address::Ipv4(Ipv4Addr::new(1, 1, 1, 1)), 80, b"x");
        packet[2] = 1;
        assert!(parse_udp_header(&packet).is_err());
    }

    #[test]
    fn encodes_response_with_source_address() {
        let from = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 53);
        let response = encode_udp_response(from, b"answer");
        let (dst, _target, header_len) = parse_udp_header(&response).unwrap();
        assert_eq!(dst, from);
        assert_eq!(&response[header_len..], b"answer");
    }
}
