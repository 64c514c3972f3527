//! Session orchestration (§4.8): wires the ingress state machines, the TLS egress connection, the
//! signed-HTTP handshake, and the relay together into the client and server per-connection flows.
//! Each accepted connection runs on its own spawned task so a panic or a slow peer on one
//! connection never blocks the accept loop (§4.9).

pub mod client;
pub mod server;
