//! Error taxonomy for the interception data plane.
//!
//! Per-message errors stop at the forwarder, per-connection errors stop at
//! the connection handler, and only acceptor-level errors terminate the
//! process. The variants below mirror those propagation tiers.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by the proxy core.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The configuration file could not be read or parsed at all.
    /// Individually malformed rules are skipped with a warning instead.
    #[error("configuration error: {0}")]
    Config(String),

    /// A frame declared a length above the decoder ceiling. The stream is
    /// considered desynchronized and the connection is dropped.
    #[error("frame length {declared} exceeds ceiling of {ceiling} bytes")]
    FrameTooLarge { declared: u32, ceiling: u32 },

    /// The original destination could not be recovered from the captured
    /// socket. Without it the flow cannot be relayed.
    #[error("failed to recover original destination: {0}")]
    OriginalDestination(#[source] std::io::Error),

    /// Upstream connect kept being refused through the whole retry schedule.
    #[error("upstream {addr} unreachable after {attempts} attempts: {source}")]
    UpstreamUnreachable {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// Binding the listener failed, typically for lack of CAP_NET_ADMIN.
    /// Fatal for the acceptor.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
