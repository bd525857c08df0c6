use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by the connection layer.
///
/// Connect and bind failures are also reported through the matching
/// handler callbacks; failures inside a receive or accept loop surface
/// through `on_error` and the teardown callbacks instead of crashing
/// the process.
#[derive(Debug, Error)]
pub enum NetError {
    /// The outbound connection attempt failed. Never retried
    /// automatically.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The outbound connection attempt did not complete within the
    /// configured timeout.
    #[error("connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Read/write/accept failure on an established or listening socket.
    /// Ends the owning loop and triggers the normal teardown path.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    /// Bytes on the wire did not decode to a known frame. The offending
    /// line is discarded and the connection stays up.
    #[error("undecodable frame: {0}")]
    Protocol(#[from] serde_json::Error),

    /// Send attempted on a channel that was closed locally.
    #[error("channel is closed")]
    Closed,

    /// Operation attempted in the wrong lifecycle state, e.g. sending
    /// to a peer that is no longer connected.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Rejected constructor or configuration argument.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl NetError {
    /// True for decode failures that leave the connection usable.
    pub fn is_protocol(&self) -> bool {
        matches!(self, NetError::Protocol(_))
    }
}
