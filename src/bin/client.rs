#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sigtun::args::{verbosity_directive, ClientArgs, IngressProtocol as CliIngressProtocol};
use sigtun::session::client::{handle_connection, ClientContext, IngressProtocol};
use sigtun::tls::client_connector;

#[tokio::main]
async fn main() -> Result<()> {
    let args = ClientArgs::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| verbosity_directive(args.verbose).into()),
        ))
        .init();

    let connector = client_connector(args.cert.as_deref()).context("failed to build client TLS config")?;
    let server_name = rustls_pki_types::ServerName::try_from(server_host(&args.server)?)
        .context("--server host is not a valid TLS server name")?;
    let password = Arc::new(args.password.clone().into_bytes());

    let udp_socket = tokio::net::UdpSocket::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind udp relay socket on {}", args.listen))?;
    let udp_relay_addr = udp_socket
        .local_addr()
        .context("failed to read udp relay socket's local address")?;
    tokio::spawn(sigtun::udp_session::run_client_udp_relay(
        udp_socket,
        args.server.clone(),
        connector.clone(),
        server_name.clone(),
        password.clone(),
    ));

    let ctx = ClientContext {
        protocol: match args.protocol {
            CliIngressProtocol::Socks => IngressProtocol::Socks,
            CliIngressProtocol::Http => IngressProtocol::Http,
        },
        server_addr: Arc::from(args.server.as_str()),
        server_name,
        connector,
        password,
        udp_relay_addr,
    };

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind ingress listener on {}", args.listen))?;
    tracing::info!(listen = %args.listen, server = %args.server, "client endpoint listening");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::info!("received ctrl-c, shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer, ctx).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept error on ingress listener");
                    }
                }
            }
        }
    }

    Ok(())
}

fn server_host(server_addr: &str) -> Result<String> {
    let (host, _) = sigtun::address::split_host_port(server_addr)?;
    Ok(host.trim_start_matches('[').trim_end_matches(']').to_owned())
}
