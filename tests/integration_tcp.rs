//! S7 end-to-end scenario: a loopback TCP echo backend, a server endpoint in front of it with a
//! freshly generated self-signed certificate, and a client endpoint with SOCKS5 ingress — a
//! CONNECT through the client to the echo backend's address round-trips bytes end to end.

use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use sigtun::session::client::{handle_connection as client_handle, ClientContext, IngressProtocol};
use sigtun::session::server::{handle_connection as server_handle, ServerContext};

fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// A self-signed cert/key pair generated fresh for the test process, never read from disk.
struct TestCert {
    cert_der: CertificateDer<'static>,
    key_der: PrivateKeyDer<'static>,
}

fn generate_test_cert() -> TestCert {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("self-signed cert generation");
    TestCert {
        cert_der: CertificateDer::from(cert.der().to_vec()),
        key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
    }
}

async fn spawn_echo_backend() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn spawn_tunnel_server(cert: &TestCert, password: Arc<Vec<u8>>) -> std::net::SocketAddr {
    let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(vec![cert.cert_der.clone()], cert.key_der.clone_key())
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let ctx = ServerContext { acceptor, password };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            let ctx = ctx.clone();
            tokio::spawn(async move {
                server_handle(stream, peer, ctx).await;
            });
        }
    });
    addr
}

async fn spawn_tunnel_client(
    server_addr: std::net::SocketAddr,
    cert: &TestCert,
    password: Arc<Vec<u8>>,
) -> std::net::SocketAddr {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.cert_der.clone()).unwrap();
    let config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from("localhost").unwrap();

    let ctx = ClientContext {
        protocol: IngressProtocol::Socks,
        server_addr: Arc::from(server_addr.to_string().as_str()),
        server_name,
        connector,
        password,
        udp_relay_addr: std::net::SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            let ctx = ctx.clone();
            tokio::spawn(async move {
                client_handle(stream, peer, ctx).await;
            });
        }
    });
    addr
}

/// Hand-rolled SOCKS5 client side, just enough to drive one CONNECT through the listener under
/// test: greeting, request, reply, then raw relayed bytes.
async fn socks5_connect(client_listen: std::net::SocketAddr, target: std::net::SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(client_listen).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    stream.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);

    let ip = match target.ip() {
        std::net::IpAddr::V4(v4) => v4,
        _ => panic!("test target must be ipv4"),
    };
    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    req.extend_from_slice(&ip.octets());
    req.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&req).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[..4], [0x05, 0x00, 0x00, 0x01]);

    stream
}

#[tokio::test]
async fn s7_socks5_connect_round_trips_bytes_end_to_end() {
    install_crypto_provider();

    let password = Arc::new(b"correct horse battery staple".to_vec());
    let cert = generate_test_cert();

    let echo_addr = spawn_echo_backend().await;
    let server_addr = spawn_tunnel_server(&cert, password.clone()).await;
    let client_listen = spawn_tunnel_client(server_addr, &cert, password).await;

    let mut stream = socks5_connect(client_listen, echo_addr).await;

    stream.write_all(b"hello through the tunnel").await.unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello through the tunnel");

    drop(stream);
}
