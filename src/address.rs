//! SOCKS5 address records and host:port string helpers shared by every ingress dialect.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CoreError;

/// The network a [`TargetAddress`] should be reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        })
    }
}

impl std::str::FromStr for Network {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            other => Err(CoreError::Policy(format!("unsupported network {other:?}"))),
        }
    }
}

/// The destination an ingress connection asked to reach: a network kind plus a `host:port`
/// authority. The authority is kept as a string (not resolved) since resolution happens on the
/// egress side, possibly on a different host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    pub network: Network,
    pub authority: String,
}

impl TargetAddress {
    pub fn new(network: Network, authority: impl Into<String>) -> Self {
        Self {
            network,
            authority: authority.into(),
        }
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.authority)
    }
}

const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

/// A decoded SOCKS5 address record (§4.2), kept distinct from the host so that re-encoding a
/// domain name round-trips byte for byte instead of being reinterpreted as a literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Socks5Address {
    pub fn host_string(&self) -> String {
        match self {
            Socks5Address::Ipv4(ip) => ip.to_string(),
            Socks5Address::Ipv6(ip) => format!("[{ip}]"),
            Socks5Address::Domain(d) => d.clone(),
        }
    }
}

impl From<IpAddr> for Socks5Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Socks5Address::Ipv4(v4),
            IpAddr::V6(v6) => Socks5Address::Ipv6(v6),
        }
    }
}

/// Reads one SOCKS5 address record: a type byte, the address body, then a 2-byte big-endian
/// port. Unknown type bytes map to `error socks address` per §4.2.
pub async fn read_socks5_address<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(Socks5Address, u16), CoreError> {
    let atyp = r.read_u8().await.map_err(CoreError::transport)?;
    let addr = match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf).await.map_err(CoreError::transport)?;
            Socks5Address::Ipv4(Ipv4Addr::from(buf))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16];
            r.read_exact(&mut buf).await.map_err(CoreError::transport)?;
            Socks5Address::Ipv6(Ipv6Addr::from(buf))
        }
        ATYP_DOMAIN => {
            let len = r.read_u8().await.map_err(CoreError::transport)? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf).await.map_err(CoreError::transport)?;
            let domain = String::from_utf8(buf)
                .map_err(|_| CoreError::ProtocolSyntax("error socks address".into()))?;
            Socks5Address::Domain(domain)
        }
        _ => return Err(CoreError::ProtocolSyntax("error socks address".into())),
    };
    let port = r.read_u16().await.map_err(CoreError::transport)?;
    Ok((addr, port))
}

/// Writes a SOCKS5 address record, the inverse of [`read_socks5_address`].
pub async fn write_socks5_address<W: AsyncWrite + Unpin>(
    w: &mut W,
    addr: &Socks5Address,
    port: u16,
) -> Result<(), CoreError> {
    match addr {
        Socks5Address::Ipv4(ip) => {
            w.write_u8(ATYP_IPV4).await.map_err(CoreError::transport)?;
            w.write_all(&ip.octets()).await.map_err(CoreError::transport)?;
        }
        Socks5Address::Ipv6(ip) => {
            w.write_u8(ATYP_IPV6).await.map_err(CoreError::transport)?;
            w.write_all(&ip.octets()).await.map_err(CoreError::transport)?;
        }
        Socks5Address::Domain(domain) => {
            if domain.len() > u8::MAX as usize {
                return Err(CoreError::ProtocolSyntax("domain name too long".into()));
            }
            w.write_u8(ATYP_DOMAIN).await.map_err(CoreError::transport)?;
            w.write_u8(domain.len() as u8).await.map_err(CoreError::transport)?;
            w.write_all(domain.as_bytes()).await.map_err(CoreError::transport)?;
        }
    }
    w.write_u16(port).await.map_err(CoreError::transport)?;
    Ok(())
}

/// Decodes a SOCKS5 address record from an in-memory buffer (the UDP path never needs to suspend
/// for more bytes, unlike the streaming `read_socks5_address`). Returns the address, port, and
/// the number of bytes consumed from `buf`.
pub fn decode_socks5_address(buf: &[u8]) -> Result<(Socks5Address, u16, usize), CoreError> {
    let bad = || CoreError::ProtocolSyntax("error socks address".into());
    let atyp = *buf.first().ok_or_else(bad)?;
    let mut pos = 1;
    let addr = match atyp {
        ATYP_IPV4 => {
            let bytes: [u8; 4] = buf.get(pos..pos + 4).ok_or_else(bad)?.try_into().map_err(|_| bad())?;
            pos += 4;
            Socks5Address::Ipv4(Ipv4Addr::from(bytes))
        }
        ATYP_IPV6 => {
            let bytes: [u8; 16] = buf.get(pos..pos + 16).ok_or_else(bad)?.try_into().map_err(|_| bad())?;
            pos += 16;
            Socks5Address::Ipv6(Ipv6Addr::from(bytes))
        }
        ATYP_DOMAIN => {
            let len = *buf.get(pos).ok_or_else(bad)? as usize;
            pos += 1;
            let domain = buf.get(pos..pos + len).ok_or_else(bad)?;
            pos += len;
            Socks5Address::Domain(String::from_utf8(domain.to_vec()).map_err(|_| bad())?)
        }
        _ => return Err(bad()),
    };
    let port_bytes: [u8; 2] = buf.get(pos..pos + 2).ok_or_else(bad)?.try_into().map_err(|_| bad())?;
    pos += 2;
    Ok((addr, u16::from_be_bytes(port_bytes), pos))
}

/// Encodes a SOCKS5 address record into a plain byte vector (used for the UDP-ASSOCIATE reply
/// and for the first frame of a SOCKS5 UDP session, where we already hold the bytes in memory).
pub fn encode_socks5_address(addr: &Socks5Address, port: u16) -> Vec<u8> {
    let mut buf = Vec::new();
    match addr {
        Socks5Address::Ipv4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Socks5Address::Ipv6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
        Socks5Address::Domain(domain) => {
            buf.push(ATYP_DOMAIN);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
        }
    }
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

/// Joins a host and a default port into a `host:port` authority string (§8 property 3).
///
/// `host` may already carry its own `:port` suffix (plain host or `[ipv6]:port`), in which case
/// it is returned unchanged. A bracket-less IPv6 literal with no port is bracketed.
pub fn join_host_port(host: &str, default_port: u16) -> String {
    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal, optionally with a trailing ":port".
        return match rest.find(']') {
            Some(end) => {
                if rest[end + 1..].starts_with(':') {
                    host.to_owned()
                } else {
                    format!("{host}:{default_port}")
                }
            }
            None => format!("{host}:{default_port}"),
        };
    }

    if host.parse::<Ipv6Addr>().is_ok() {
        return format!("[{host}]:{default_port}");
    }

    match host.rsplit_once(':') {
        // A bare IPv4 literal or domain with no colon at all.
        None => format!("{host}:{default_port}"),
        Some((_, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            host.to_owned()
        }
        Some(_) => format!("{host}:{default_port}"),
    }
}

/// Splits a `host:port` authority into its host and port parts, handling bracketed IPv6.
pub fn split_host_port(authority: &str) -> Result<(String, u16), CoreError> {
    let bad = || CoreError::ProtocolSyntax(format!("invalid host:port {authority:?}"));

    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(bad)?;
        let host = format!("[{}]", &rest[..end]);
        let after = &rest[end + 1..];
        let port = after.strip_prefix(':').ok_or_else(bad)?;
        let port: u16 = port.parse().map_err(|_| bad())?;
        return Ok((host, port));
    }

    let (host, port) = authority.rsplit_once(':').ok_or_else(bad)?;
    let port: u16 = port.parse().map_err(|_| bad())?;
    Ok((host.to_owned(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_ipv4() {
        let addr = Socks5Address::Ipv4(Ipv4Addr::new(1, 2, 3, 4));
        let mut buf = Vec::new();
        write_socks5_address(&mut buf, &addr, 443).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (decoded, port) = read_socks5_address(&mut cursor).await.unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn round_trips_ipv6() {
        let addr = Socks5Address::Ipv6(Ipv6Addr::LOCALHOST);
        let mut buf = Vec::new();
        write_socks5_address(&mut buf, &addr, 8080).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (decoded, port) = read_socks5_address(&mut cursor).await.unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(port, 8080);
    }

    #[tokio::test]
    async fn round_trips_domain() {
        let addr = Socks5Address::Domain("github.com".to_owned());
        let mut buf = Vec::new();
        write_socks5_address(&mut buf, &addr, 443).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (decoded, port) = read_socks5_address(&mut cursor).await.unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn unknown_type_byte_errors() {
        let mut cursor = std::io::Cursor::new(vec![0x7f, 0, 0, 0, 0, 0, 0]);
        assert!(read_socks5_address(&mut cursor).await.is_err());
    }

    #[test]
    fn decodes_from_buffer() {
        let encoded = encode_socks5_address(&Socks5Address::Domain("a.b".into()), 53);
        let (addr, port, consumed) = decode_socks5_address(&encoded).unwrap();
        assert_eq!(addr, Socks5Address::Domain("a.b".into()));
        assert_eq!(port, 53);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn host_port_defaulting() {
        assert_eq!(join_host_port("example.com", 80), "example.com:80");
        assert_eq!(join_host_port("example.com:8080", 80), "example.com:8080");
        assert_eq!(join_host_port("[::1]", 80), "[::1]:80");
        assert_eq!(join_host_port("[::1]:9", 80), "[::1]:9");
    }

    #[test]
    fn split_host_port_handles_brackets() {
        assert_eq!(
            split_host_port("[::1]:9").unwrap(),
            ("[::1]".to_owned(), 9)
        );
        assert_eq!(
            split_host_port("example.com:80").unwrap(),
            ("example.com".to_owned(), 80)
        );
    }
}
