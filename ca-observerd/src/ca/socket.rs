use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Loopback socket on an ephemeral port, registered with the local repeater
pub fn beacon_socket() -> Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .context("failed to bind beacon socket")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")
}

/// Socket receiving client search broadcasts. The port is shared with any
/// CA client or server on the same host.
pub fn search_socket(interface: IpAddr, port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::new(interface, port);
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_broadcast(true).context("SO_BROADCAST")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind search socket to {}", addr))?;

    UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")
}
