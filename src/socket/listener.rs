use std::io;
#[cfg(unix)]
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use tokio::net::UdpSocket;

use super::SocketCapabilities;

/// Wrapper around a [`UdpSocket`] for one ingress worker.
///
/// Workers usually share a port via `SO_REUSEPORT`; each worker owns one
/// socket and the set of connections whose connection IDs carry its
/// `worker_id` prefix. The wrapper carries socket-specific parameters, in
/// contrast to the [`settings`](crate::settings) structs which apply to _all_
/// sockets of the listener.
#[derive(Debug)]
pub struct QuicListener {
    /// The wrapped [tokio] socket.
    pub socket: UdpSocket,
    /// Identifier embedded as the first byte of every connection ID issued
    /// for connections on this socket, so a kernel-level steering program
    /// can route packets to the owning worker without decrypting the CID.
    pub worker_id: u8,
    /// The [`SocketCapabilities`] to use for this socket.
    ///
    /// By default, [`QuicListener`]s are constructed with all capabilities
    /// disabled. On Linux, `apply_max_capabilities()` (tries to) enable all
    /// supported capabilities.
    pub capabilities: SocketCapabilities,
}

impl QuicListener {
    /// Tries to enable all sockopts supported by the crate for this socket.
    /// See `SocketCapabilities::apply_all_and_get_compatibility` for details.
    #[cfg(target_os = "linux")]
    pub fn apply_max_capabilities(&mut self) {
        self.capabilities =
            SocketCapabilities::apply_all_and_get_compatibility(&self.socket);
    }
}

impl TryFrom<UdpSocket> for QuicListener {
    type Error = io::Error;

    fn try_from(socket: UdpSocket) -> Result<Self, Self::Error> {
        Ok(Self {
            socket,
            worker_id: 0,
            capabilities: SocketCapabilities::default(),
        })
    }
}

impl TryFrom<std::net::UdpSocket> for QuicListener {
    type Error = io::Error;

    fn try_from(socket: std::net::UdpSocket) -> Result<Self, Self::Error> {
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;
        Self::try_from(socket)
    }
}

#[cfg(unix)]
impl AsFd for QuicListener {
    fn as_fd(&self) -> BorrowedFd {
        self.socket.as_fd()
    }
}

#[cfg(unix)]
impl AsRawFd for QuicListener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}
