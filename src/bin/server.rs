#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sigtun::args::{verbosity_directive, ServerArgs};
use sigtun::session::server::{handle_connection, ServerContext};
use sigtun::tls::server_acceptor;

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| verbosity_directive(args.verbose).into()),
        ))
        .init();

    let acceptor = server_acceptor(&args.cert, &args.key).context("failed to build server TLS config")?;
    let ctx = ServerContext {
        acceptor,
        password: Arc::new(args.password.clone().into_bytes()),
    };

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", args.listen))?;
    tracing::info!(listen = %args.listen, "server endpoint listening");

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
                        tracing::warn!(error = %e, "accept error on listener");
                    }
                }
            }
        }
    }

    Ok(())
}
