//! CLI surface for both binaries (§6): a `clap::Parser` struct per binary plus a repeatable
//! `-v/--verbose` flag that raises the `tracing` level when `RUST_LOG` is not set.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IngressProtocol {
    Socks,
    Http,
}

/// The client endpoint: accepts SOCKS5 or HTTP proxy connections and tunnels them to a server
/// endpoint over TLS.
#[derive(Parser, Debug)]
#[command(version, about = "Client endpoint of a signed-HTTP TLS tunnel")]
pub struct ClientArgs {
    /// Local address to accept ingress connections on, e.g. 127.0.0.1:1080.
    #[arg(long)]
    pub listen: String,

    /// Ingress protocol to speak on the listen socket.
    #[arg(long, value_enum)]
    pub protocol: IngressProtocol,

    /// Server endpoint to tunnel to, e.g. tunnel.example.com:8443.
    #[arg(long)]
    pub server: String,

    /// Optional PEM bundle of extra trusted CA certificates, in addition to the system roots.
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Shared secret used to sign the handshake. Prefer `TUNNEL_PASSWORD` over this flag to
    /// avoid leaking it into shell history.
    #[arg(long, env = "TUNNEL_PASSWORD")]
    pub password: String,

    /// Raise the tracing log level; repeat for more verbosity. Ignored if `RUST_LOG` is set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// The server endpoint: accepts TLS connections, verifies the signed-HTTP handshake, and relays
/// to the requested target.
#[derive(Parser, Debug)]
#[command(version, about = "Server endpoint of a signed-HTTP TLS tunnel")]
pub struct ServerArgs {
    /// Local address to accept TLS connections on, e.g. 0.0.0.0:8443.
    #[arg(long)]
    pub listen: String,

    /// PEM certificate chain for this endpoint's TLS identity.
    #[arg(long)]
    pub cert: PathBuf,

    /// PEM private key matching `--cert`.
    #[arg(long)]
    pub key: PathBuf,

    /// Shared secret used to verify the handshake. Prefer `TUNNEL_PASSWORD` over this flag to
    /// avoid leaking it into shell history.
    #[arg(long, env = "TUNNEL_PASSWORD")]
    pub password: String,

    /// Raise the tracing log level; repeat for more verbosity. Ignored if `RUST_LOG` is set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Maps a repeated `-v` count to an `EnvFilter` directive, used only when `RUST_LOG` is unset.
pub fn verbosity_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}
