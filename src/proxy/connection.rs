//! # Connection Handler
//!
//! One task per accepted flow: recover the destination the client's SYN
//! actually targeted, open a spoofed-source upstream connection so the
//! server sees the true client identity, then pump both directions until
//! one side finishes or the MITM machine calls for a tear-down.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::forwarder::{self, ForwardOutcome, ForwarderContext};
use super::ProxyShared;
use crate::error::ProxyError;
use crate::mitm::Leg;

/// Handle one captured flow end to end. Errors never propagate further;
/// every early-exit path closes the client side cleanly.
pub async fn handle(client: TcpStream, client_addr: SocketAddr, shared: ProxyShared) {
    let original_dest = match original_destination(&client) {
        Ok(dest) => dest,
        Err(err) => {
            warn!(client = %client_addr, "{err}");
            return;
        }
    };
    info!(
        client = %client_addr,
        dest = %original_dest,
        "captured flow"
    );

    let upstream = match connect_upstream(Some(client_addr), original_dest).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(client = %client_addr, "{err}");
            return;
        }
    };
    debug!(dest = %original_dest, "connected to original destination");

    // Duplicate socket handles kept by the handler: they let a tear-down
    // set SO_LINGER{1,0} after the forwarder tasks have taken ownership
    // of the stream halves. The sockets fully close once these guards
    // drop, after both tasks are done.
    let client_guard = SockRef::from(&client).try_clone();
    let upstream_guard = SockRef::from(&upstream).try_clone();

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let client_ip = client_addr.ip();
    let server_ip = original_dest.ip();

    let mut client_to_server = tokio::spawn(forwarder::run(
        client_read,
        upstream_write,
        ForwarderContext {
            leg: Leg::ClientToServer,
            label: format!("{client_addr}->{original_dest}"),
            source_ip: client_ip,
            target_ip: server_ip,
            rules: shared.rules.clone(),
            mitm: shared.mitm.clone(),
            process_start: shared.process_start,
        },
    ));
    let mut server_to_client = tokio::spawn(forwarder::run(
        upstream_read,
        client_write,
        ForwarderContext {
            leg: Leg::ServerToClient,
            label: format!("{client_addr}<-{original_dest}"),
            source_ip: server_ip,
            target_ip: client_ip,
            rules: shared.rules.clone(),
            mitm: shared.mitm.clone(),
            process_start: shared.process_start,
        },
    ));

    let (first, other) = tokio::select! {
        r = &mut client_to_server => (r, &mut server_to_client),
        r = &mut server_to_client => (r, &mut client_to_server),
    };
    let first = first.unwrap_or(ForwardOutcome::Failed);

    if first == ForwardOutcome::TearDown {
        // Arrange an RST instead of an orderly FIN on both sockets, then
        // cancel the surviving direction. The reset fires when the guards
        // drop below.
        for guard in [&client_guard, &upstream_guard] {
            match guard {
                Ok(sock) => {
                    if let Err(err) = sock.set_linger(Some(Duration::ZERO)) {
                        warn!("failed to set linger for reset: {err}");
                    }
                }
                Err(err) => warn!("no socket handle for reset: {err}"),
            }
        }
        other.abort();
        let _ = timeout(crate::defaults::CANCEL_GRACE, other).await;
        info!(client = %client_addr, "connection torn down with RST");
        return;
    }

    // Give the opposite direction a bounded window to finish its own
    // half, then cancel it cooperatively.
    if timeout(crate::defaults::CANCEL_GRACE, &mut *other)
        .await
        .is_err()
    {
        other.abort();
        let _ = other.await;
    }
    info!(
        client = %client_addr,
        dest = %original_dest,
        "connection closed"
    );
}

/// Connect to the original destination, binding the outgoing socket to
/// the client's own address so the server sees the real client. Refused
/// connects are retried through the backoff schedule to ride out the
/// rapid reset/retry cycles a tear-down provokes.
pub async fn connect_upstream(
    spoof_source: Option<SocketAddr>,
    dest: SocketAddr,
) -> Result<TcpStream, ProxyError> {
    let mut attempt = 0usize;
    loop {
        match try_connect(spoof_source, dest).await {
            Ok(stream) => return Ok(stream),
            Err(err)
                if err.kind() == std::io::ErrorKind::ConnectionRefused
                    && attempt < crate::defaults::CONNECT_BACKOFF_MS.len() =>
            {
                let backoff = Duration::from_millis(crate::defaults::CONNECT_BACKOFF_MS[attempt]);
                debug!(
                    dest = %dest,
                    retry_in_ms = backoff.as_millis() as u64,
                    "upstream refused connection"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(ProxyError::UpstreamUnreachable {
                    addr: dest,
                    attempts: attempt as u32 + 1,
                    source: err,
                });
            }
        }
    }
}

/// One connect attempt on a fresh socket. A failed spoof bind degrades to
/// the default source address with a warning; the flow still relays, the
/// server just sees the proxy host instead of the client.
async fn try_connect(
    spoof_source: Option<SocketAddr>,
    dest: SocketAddr,
) -> std::io::Result<TcpStream> {
    let domain = Domain::for_address(dest);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if let Err(err) = set_transparent(&socket) {
        debug!("IP_TRANSPARENT unavailable on upstream socket: {err}");
    }
    if let Some(source) = spoof_source {
        if let Err(err) = socket.bind(&source.into()) {
            warn!(
                source = %source,
                "could not bind upstream socket to client address \
                 (requires CAP_NET_ADMIN): {err}; using default source"
            );
        }
    }
    socket.set_nonblocking(true)?;

    let stream = TcpSocket::from_std_stream(socket.into())
        .connect(dest)
        .await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Recover the `(ip, port)` the client's SYN targeted before the kernel
/// redirected the flow to the listener.
#[cfg(target_os = "linux")]
pub fn original_destination(stream: &TcpStream) -> Result<SocketAddr, ProxyError> {
    use nix::sys::socket::{getsockopt, sockopt::OriginalDst};
    use std::net::{Ipv4Addr, SocketAddrV4};

    let raw = getsockopt(stream, OriginalDst)
        .map_err(|errno| ProxyError::OriginalDestination(std::io::Error::from(errno)))?;
    let ip = Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
    let port = u16::from_be(raw.sin_port);
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

#[cfg(not(target_os = "linux"))]
pub fn original_destination(_stream: &TcpStream) -> Result<SocketAddr, ProxyError> {
    Err(ProxyError::OriginalDestination(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "transparent capture requires Linux",
    )))
}

/// Mark a socket transparent so it can bind non-local addresses.
#[cfg(target_os = "linux")]
pub(super) fn set_transparent(socket: &Socket) -> std::io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt::IpTransparent};
    setsockopt(socket, IpTransparent, &true).map_err(std::io::Error::from)
}

#[cfg(not(target_os = "linux"))]
pub(super) fn set_transparent(_socket: &Socket) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "IP_TRANSPARENT requires Linux",
    ))
}
