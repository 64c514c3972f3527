//! A uniform stream abstraction across the three ingress dialects and the two egress kinds
//! (§9 "Connection polymorphism"): a boxed trait object so the relay and the orchestrator never
//! need to know whether they are holding a raw TCP socket, a TLS stream, or the HTTP forward-mode
//! rewrite pipeline.

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything that can be read from, written to, and relayed: a plain TCP socket, a TLS stream, or
/// an in-process pipe such as the HTTP forward-mode rewrite reader.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;
