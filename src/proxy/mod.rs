//! # Transparent Acceptor
//!
//! Owns the listening socket and dispatches a connection handler per
//! captured flow. The listener is created with `IP_TRANSPARENT` so the
//! kernel can redirect flows whose destination is not a local address;
//! recovering where each flow was actually headed happens per connection
//! in [`connection`].
//!
//! Concurrency model: one task per connection, one subtask per direction.
//! The acceptor keeps the handler tasks in a `JoinSet`; ctrl-c stops
//! accepting, cancels all handlers and awaits their cleanup.

pub mod connection;
pub mod forwarder;

use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::ProxyError;
use crate::mitm::MitmMachine;
use crate::rules::RuleSetHandle;

/// State shared by every connection handler: the published rule snapshot
/// handle, the process-wide MITM machine, and the process start instant
/// that anchors insert start-time gates.
#[derive(Clone)]
pub struct ProxyShared {
    pub rules: RuleSetHandle,
    pub mitm: Arc<MitmMachine>,
    pub process_start: Instant,
}

/// Bind the transparent listener and serve until ctrl-c.
///
/// Bind or privilege failure is fatal and surfaces as
/// [`ProxyError::Bind`]; everything below the acceptor is contained per
/// connection.
pub async fn run(listen: SocketAddr, shared: ProxyShared) -> Result<(), ProxyError> {
    let listener = bind_transparent(listen)?;
    info!(addr = %listen, "listening (transparent proxy mode)");

    let mut handlers: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        handlers.spawn(connection::handle(stream, peer, shared.clone()));
                    }
                    Err(err) => {
                        warn!("accept failed: {err}");
                    }
                }
            }
            // Reap finished handlers so the set does not grow with
            // connection churn.
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            _ = tokio::signal::ctrl_c() => {
                info!(
                    connections = handlers.len(),
                    "shutdown requested, cancelling connection handlers"
                );
                break;
            }
        }
    }

    handlers.abort_all();
    while handlers.join_next().await.is_some() {}
    info!("acceptor stopped");
    Ok(())
}

/// Build the capture listener: `SO_REUSEADDR` + `IP_TRANSPARENT`, bound
/// and listening, handed to tokio nonblocking.
fn bind_transparent(addr: SocketAddr) -> Result<TcpListener, ProxyError> {
    let build = || -> std::io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        connection::set_transparent(&socket)?;
        socket.bind(&addr.into())?;
        socket.listen(crate::defaults::LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        TcpListener::from_std(socket.into())
    };
    build().map_err(|source| ProxyError::Bind { addr, source })
}
