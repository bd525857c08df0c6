//! A minimal client/server communication layer over TCP.
//!
//! A process either runs a [`Server`] accepting many connections or an
//! [`Endpoint`] connecting out to one server; both sides exchange whole
//! [`Message`] values over a persistent stream, framed as one JSON
//! object per line. Each module covers one responsibility:
//!
//! - [`message`] defines the tagged [`Message`] type and the wire
//!   framing, including the reserved disconnect frame that drives the
//!   graceful teardown handshake.
//! - `channel` (internal) owns one socket: exclusive locked sends, a
//!   single-reader receive half, and an idempotent close that unblocks
//!   a pending read.
//! - [`endpoint`] is the client role: connect with a per-instance
//!   timeout, a dedicated receive loop, disconnect with or without
//!   notifying the peer.
//! - [`server`] owns the listener, the accept loop, the registry of
//!   connected peers, and broadcast/targeted sends.
//! - [`peer`] represents one accepted connection on the server side,
//!   registered for exactly as long as it is connected.
//!
//! Lifecycle transitions and inbound messages are reported through the
//! [`EndpointHandler`] and [`ServerHandler`] traits; transport failures
//! tear down the affected connection and are observable through the
//! handlers, never printed or fatal to the process.

mod channel;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod peer;
pub mod server;
mod state;

pub use endpoint::{Endpoint, EndpointConfig, EndpointHandler};
pub use error::NetError;
pub use message::Message;
pub use peer::Peer;
pub use server::{Server, ServerHandler};
pub use state::ConnectionState;
