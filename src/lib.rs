//! # Transparent Interception TCP Proxy
//!
//! A research proxy that sits invisibly in the forwarding path between
//! two endpoints, terminates each redirected flow, reconstructs the
//! length-prefixed message stream, evaluates configurable manipulation
//! rules (block, delay, insert, replay) against every decoded message,
//! and relays the possibly altered bytes toward the intended destination.
//! A stateful handshake interceptor can additionally run a challenge-replay
//! authentication attack spanning multiple connections.

pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod mitm;
pub mod proxy;
pub mod rules;

pub use cli::Args;
pub use codec::{Decoded, Frame, FrameDecoder};
pub use config::Config;
pub use error::ProxyError;
pub use mitm::{Leg, MitmConfig, MitmMachine};
pub use proxy::ProxyShared;
pub use rules::{RuleSet, RuleSetHandle};

/// The current version of the interceptor.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Socket read chunk size per forwarder iteration
    pub const READ_CHUNK: usize = 16 * 1024;

    /// Ceiling on a declared frame length; beyond it the stream is
    /// considered desynchronized
    pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

    /// Backoff schedule for refused upstream connects
    pub const CONNECT_BACKOFF_MS: [u64; 3] = [200, 400, 800];

    /// Bound on waiting for the surviving direction after its peer exits
    pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

    /// Listen backlog for the capture socket
    pub const LISTEN_BACKLOG: i32 = 1024;
}
