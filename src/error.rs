//! The core error taxonomy (§7). Every protocol state machine in this crate returns
//! `Result<_, CoreError>`; callers at the orchestrator boundary wrap these in `anyhow::Context`
//! to attach what they were doing when the error happened.

use thiserror::Error;

/// Leaf error type for the proxy protocol layer.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed SOCKS5 or HTTP framing: bad version byte, truncated request line, oversized
    /// domain length, etc. Maps to an HTTP `400 Bad Request` at the signed-HTTP layer.
    #[error("protocol syntax error: {0}")]
    ProtocolSyntax(String),

    /// Signature mismatch, stale timestamp, or wrong method/path on the signed-HTTP handshake.
    /// Maps to an HTTP `403 Forbidden`.
    #[error("authentication error: {0}")]
    Auth(String),

    /// TCP/TLS dial or handshake failure.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// A syntactically valid request for something this core deliberately does not support
    /// (SOCKS5 BIND, an unrecognized `network` value, ...).
    #[error("policy error: {0}")]
    Policy(String),

    /// A UDP-over-TCP frame was malformed, oversized, or truncated.
    #[error("framing error: {0}")]
    Framing(String),

    /// An error surfaced while steady-state relaying bytes between the two sides of a session.
    #[error("relay error: {0}")]
    Relay(#[source] std::io::Error),
}

impl CoreError {
    pub fn transport(err: std::io::Error) -> Self {
        CoreError::Transport(err)
    }

    pub fn relay(err: std::io::Error) -> Self {
        CoreError::Relay(err)
    }

    /// The HTTP status this error should be reported to a peer as, where applicable.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::ProtocolSyntax(_) => 400,
            CoreError::Auth(_) => 403,
            CoreError::Policy(_) => 403,
            CoreError::Transport(_) | CoreError::Framing(_) | CoreError::Relay(_) => 502,
        }
    }
}

impl From<CoreError> for std::io::Error {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Transport(e) | CoreError::Relay(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}
