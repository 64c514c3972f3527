//! SOCKS5 ingress state machine (§4.3): `Greeting -> MethodSelection -> Request -> Reply ->
//! Relay|UdpAssociate|Reject`. RFC 1928 subset: no-auth method only, CONNECT and UDP-ASSOCIATE
//! commands.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::address::{encode_socks5_address, read_socks5_address, Network, Socks5Address, TargetAddress};
use crate::error::CoreError;

const SOCKS_VERSION: u8 = 5;
const CMD_CONNECT: u8 = 1;
const CMD_UDP_ASSOCIATE: u8 = 3;

const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHODS: u8 = 0xff;

/// Outcome of driving the SOCKS5 ingress handshake to completion.
pub enum Socks5Outcome {
    /// A `CONNECT` request; the caller should now dial `target` and relay.
    Connect { target: TargetAddress },
    /// A `UDP-ASSOCIATE` request; the caller must hold the TCP connection open for the lifetime
    /// of the UDP association and has already received the local-address reply.
    UdpAssociate { target: TargetAddress },
}

/// Drives the greeting, method-selection, and request phases of RFC 1928 on `stream`, replying
/// as it goes. `local_addr` is the ingress socket's own local address, used to answer
/// UDP-ASSOCIATE (§4.3 step 4).
pub async fn handshake<S>(
    stream: &mut S,
    local_addr: std::net::SocketAddr,
) -> Result<Socks5Outcome, CoreError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER, NMETHODS, METHODS[NMETHODS].
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.map_err(CoreError::transport)?;
    let (ver, nmethods) = (header[0], header[1]);
    if ver != SOCKS_VERSION {
        return Err(CoreError::ProtocolSyntax(format!(
            "not a socks5 protocol (version {ver})"
        )));
    }
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await.map_err(CoreError::transport)?;

    if !methods.contains(&NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS])
            .await
            .map_err(CoreError::transport)?;
        return Err(CoreError::Policy("no acceptable socks5 auth method".into()));
    }

    // Method selection reply: VER, METHOD.
    stream
        .write_all(&[SOCKS_VERSION, NO_AUTH])
        .await
        .map_err(CoreError::transport)?;

    // Request: VER, CMD, RSV, then an address record.
    let mut req = [0u8; 3];
    stream.read_exact(&mut req).await.map_err(CoreError::transport)?;
    let (ver, cmd) = (req[0], req[1]);
    if ver != SOCKS_VERSION {
        return Err(CoreError::ProtocolSyntax(format!(
            "not a socks5 protocol (version {ver})"
        )));
    }
    let (addr, port) = read_socks5_address(stream).await?;

    match cmd {
        CMD_CONNECT => {
            stream
                .write_all(&[SOCKS_VERSION, 0, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .map_err(CoreError::transport)?;
            let target = TargetAddress::new(Network::Tcp, format!("{}:{}", addr.host_string(), port));
            Ok(Socks5Outcome::Connect { target })
        }
        CMD_UDP_ASSOCIATE => {
            let mut reply = vec![SOCKS_VERSION, 0, 0];
            reply.extend(encode_socks5_address(
                &Socks5Address::from(local_addr.ip()),
                local_addr.port(),
            ));
            stream.write_all(&reply).await.map_err(CoreError::transport)?;
            let target = TargetAddress::new(Network::Udp, format!("{}:{}", addr.host_string(), port));
            Ok(Socks5Outcome::UdpAssociate { target })
        }
        other => {
            stream
                .write_all(&[SOCKS_VERSION, 7, 0, 1, 0, 0, 0, 0, 0, 0])
                .await
                .map_err(CoreError::transport)?;
            Err(CoreError::Policy(format!("unsupported socks command {other}")))
        }
    }
}

/// Blocks until the peer half-closes or errors, used to keep a UDP-ASSOCIATE TCP connection open
/// for the lifetime of the association (§4.3, §4.8).
pub async fn wait_for_peer_close(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut buf = [0u8; 1];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(_) => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    #[tokio::test]
    async fn s1_socks5_connect_scenario() {
        // 05 01 00  -- greeting: ver=5, 1 method, no-auth
        // 05 01 00 03 0a "github.com" 01 BB -- ver=5 cmd=connect rsv=0 domain(10)="github.com" port=443
        let input: Vec<u8> = vec![
            0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 0x0a, b'g', b'i', b't', b'h', b'u', b'b',
            b'.', b'c', b'o', b'm', 0x01, 0xBB,
        ];
        let mut stream = tokio_test::io::Builder::new()
            .read(&input)
            .write(&[0x05, 0x00])
            .write(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .build();

        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let outcome = handshake(&mut stream, local).await.unwrap();
        match outcome {
            Socks5Outcome::Connect { target } => {
                assert_eq!(target.authority, "github.com:443");
                assert_eq!(target.network, Network::Tcp);
            }
            _ => panic!("expected connect"),
        }
    }

    #[tokio::test]
    async fn s6_udp_associate_hold_scenario() {
        // 05 01 00 -- greeting
        // 05 03 00 01 00 00 00 00 00 00 -- ver=5 cmd=udp-associate rsv=0 addr=0.0.0.0:0
        let input: Vec<u8> = vec![
            0x05, 0x01, 0x00, 0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0,
        ];
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9050);
        let mut stream = tokio_test::io::Builder::new()
            .read(&input)
            .write(&[0x05, 0x00])
            .write(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x23, 0x5A])
            .build();

        let outcome = handshake(&mut stream, local).await.unwrap();
        match outcome {
            Socks5Outcome::UdpAssociate { target } => {
                assert_eq!(target.network, Network::Udp);
                assert_eq!(target.authority, "0.0.0.0:0");
            }
            _ => panic!("expected udp associate"),
        }
    }

    #[tokio::test]
    async fn rejects_non_v5() {
        let mut stream = tokio_test::io::Builder::new().read(&[0x04, 0x01, 0x00]).build();
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        assert!(handshake(&mut stream, local).await.is_err());
    }
}
