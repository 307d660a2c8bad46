// THEORY:
// This file is the main entry point for the `kernel_relay_server` library crate.
// It turns the `kernel_relay` filter engine into a TCP service: one connection
// carries one request and one response.
//
// The binary in `src/bin` is a thin shell around `Server`; everything it does
// is available here so integration tests can run a real server on an ephemeral
// port and stop it with a oneshot.
//
//   server (accept loop) -> dispatch (strategy) -> handler (one exchange)
//                                                    -> protocol (framing)

pub mod config;
pub mod dispatch;
pub mod handler;
pub mod protocol;
pub mod sequence;
pub mod server;
pub mod telemetry;

pub use crate::config::{Admission, DispatchStrategy, ServerConfig};
pub use crate::handler::{ConnectionHandler, Stage, supervised};
pub use crate::protocol::{ProtocolKind, WireReply, WireRequest};
pub use crate::sequence::RequestSequence;
pub use crate::server::Server;
