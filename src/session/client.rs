//! Per-ingress-connection flow on the client endpoint (§4.8): accept → ingress handshake → TLS
//! dial → signed-HTTP handshake → relay.

use std::sync::Arc;

use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::address::TargetAddress;
use crate::error::CoreError;
use crate::http_proxy::{self, HttpOutcome};
use crate::relay::relay;
use crate::socks5::{self, Socks5Outcome};
use crate::{handshake, stream::BoxedStream};

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum IngressProtocol {
    Socks,
    Http,
}

/// Everything a single ingress connection's handler needs, shared across the whole listener.
#[derive(Clone)]
pub struct ClientContext {
    pub protocol: IngressProtocol,
    pub server_addr: Arc<str>,
    pub server_name: ServerName<'static>,
    pub connector: TlsConnector,
    pub password: Arc<Vec<u8>>,
    /// Local address of the single shared UDP relay socket (§4.8), reported to SOCKS5 clients in
    /// the UDP-ASSOCIATE reply so they know where to actually send their datagrams.
    pub udp_relay_addr: std::net::SocketAddr,
}

/// Handles one accepted ingress TCP connection. Never panics the caller: any error is logged and
/// the connection is simply closed (§4.9).
pub async fn handle_connection(ingress: TcpStream, peer: std::net::SocketAddr, ctx: ClientContext) {
    let result = match ctx.protocol {
        IngressProtocol::Socks => handle_socks(ingress, peer, &ctx).await,
        IngressProtocol::Http => handle_http(ingress, peer, &ctx).await,
    };
    if let Err(e) = result {
        debug!(%peer, error = %e, "client ingress connection ended with an error");
    }
}

async fn handle_socks(mut ingress: TcpStream, peer: std::net::SocketAddr, ctx: &ClientContext) -> Result<(), CoreError> {
    match socks5::handshake(&mut ingress, ctx.udp_relay_addr).await? {
        Socks5Outcome::Connect { target } => {
            info!(%peer, %target, "client socks5 connect");
            let mut egress = dial_and_handshake(&target, ctx).await?;
            relay(ingress, &mut *egress).await
        }
        Socks5Outcome::UdpAssociate { .. } => {
            // The reply already carried the shared UDP relay's address (§4.8); this connection's
            // only remaining job is to stay open for the lifetime of the association.
            socks5::wait_for_peer_close(&mut ingress).await.map_err(CoreError::transport)
        }
    }
}

async fn handle_http(ingress: TcpStream, peer: std::net::SocketAddr, ctx: &ClientContext) -> Result<(), CoreError> {
    match http_proxy::handshake(ingress).await? {
        HttpOutcome::Tunnel { target, mut stream } => {
            info!(%peer, %target, "client http connect tunnel");
            let mut egress = dial_and_handshake(&target, ctx).await?;
            relay(&mut stream, &mut *egress).await
        }
        HttpOutcome::Forward { target, mut stream } => {
            info!(%peer, %target, "client http forward request");
            let mut egress = dial_and_handshake(&target, ctx).await?;
            relay(&mut stream, &mut *egress).await
        }
    }
}

async fn dial_and_handshake(target: &TargetAddress, ctx: &ClientContext) -> Result<BoxedStream, CoreError> {
    let tcp = TcpStream::connect(ctx.server_addr.as_ref())
        .await
        .map_err(CoreError::transport)?;
    let mut tls = ctx
        .connector
        .connect(ctx.server_name.clone(), tcp)
        .await
        .map_err(CoreError::transport)?;
    let now = now_unix();
    handshake::client_handshake(&mut tls, target, &ctx.password, now).await?;
    Ok(Box::new(tls))
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
