//! Per-accept flow on the server endpoint (§4.8): TLS accept → signed-HTTP server handshake →
//! branch on network.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::address::Network;
use crate::error::CoreError;
use crate::handshake;
use crate::relay::relay;
use crate::udp_session::run_server_udp_session;

/// Everything a single accepted connection's handler needs, shared across the whole listener.
#[derive(Clone)]
pub struct ServerContext {
    pub acceptor: TlsAcceptor,
    pub password: Arc<Vec<u8>>,
}

/// Handles one accepted TCP connection. Never panics the caller: any error is logged and the
/// connection is simply closed (§4.9).
pub async fn handle_connection(tcp: TcpStream, peer: std::net::SocketAddr, ctx: ServerContext) {
    if let Err(e) = handle_connection_inner(tcp, peer, &ctx).await {
        debug!(%peer, error = %e, "server connection ended with an error");
    }
}

async fn handle_connection_inner(tcp: TcpStream, peer: std::net::SocketAddr, ctx: &ServerContext) -> Result<(), CoreError> {
    let mut tls = ctx.acceptor.accept(tcp).await.map_err(CoreError::transport)?;

    let now = now_unix();
    let target = handshake::server_handshake(&mut tls, &ctx.password, now).await?;
    info!(%peer, %target, "server verified handshake");

    match target.network {
        Network::Tcp => {
            let (host, port) = crate::address::split_host_port(&target.authority)?;
            let host = host.trim_start_matches('[').trim_end_matches(']').to_owned();
            let mut egress = TcpStream::connect((host.as_str(), port)).await.map_err(CoreError::transport)?;
            relay(&mut tls, &mut egress).await
        }
        Network::Udp => run_server_udp_session(tls, target).await,
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
