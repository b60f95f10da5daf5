//! TCP listener

use std::net::Shutdown;
use std::os::fd::RawFd;

use socket2::{Domain, Protocol, Type};
use tracing::{debug, info};

use super::{Connection, SocketAddress, SocketHandle};
use crate::error::NetError;

/// Pending-connection backlog passed to `listen`
const BACKLOG: i32 = 128;

/// A bound, listening TCP socket
#[derive(Debug)]
pub struct Listener {
    handle: SocketHandle,
    local: Option<SocketAddress>,
}

impl Listener {
    /// Bind to `addr` and start listening
    ///
    /// Port 0 picks an ephemeral port; read it back with [`Listener::local_addr`].
    pub fn bind(addr: &SocketAddress) -> Result<Self, NetError> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let handle = SocketHandle::create(domain, Type::STREAM, Some(Protocol::TCP))?;
        let socket = handle.socket()?;
        socket.set_reuse_address(true).map_err(NetError::Resource)?;
        socket.bind(&addr.to_sock_addr()).map_err(NetError::Resource)?;
        socket.listen(BACKLOG).map_err(NetError::Resource)?;

        let local = socket
            .local_addr()
            .map_err(NetError::Resource)
            .and_then(|a| SocketAddress::from_sock_addr(&a))?;
        info!(addr = %local, "listening");
        Ok(Self {
            handle,
            local: Some(local),
        })
    }

    pub fn is_bound(&self) -> bool {
        self.handle.is_valid() && self.local.is_some()
    }

    pub fn local_addr(&self) -> Result<SocketAddress, NetError> {
        self.local.ok_or(NetError::State("listener is not bound"))
    }

    pub fn handle(&self) -> &SocketHandle {
        &self.handle
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.handle.raw_fd()
    }

    /// Wait for the next peer and hand its socket to a new [`Connection`]
    ///
    /// Blocks unless the listener was switched to non-blocking mode, in which
    /// case `NetError::WouldBlock` means nobody is waiting.
    pub fn accept(&self) -> Result<Connection, NetError> {
        if !self.is_bound() {
            return Err(NetError::State("listener is not bound"));
        }
        let (socket, addr) = loop {
            match self.handle.socket()?.accept() {
                Ok(accepted) => break accepted,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Err(NetError::WouldBlock)
                }
                Err(e) => return Err(NetError::Transport(e)),
            }
        };
        // BSD-derived systems hand out sockets inheriting O_NONBLOCK
        socket.set_nonblocking(false).map_err(NetError::Transport)?;

        let peer = SocketAddress::from_sock_addr(&addr)?;
        let mut handle = SocketHandle::from_socket(socket);
        let mut conn = Connection::new();
        conn.adopt(&mut handle, peer)?;
        debug!(peer = %peer, "accepted");
        Ok(conn)
    }

    /// Stop accepting; a thread blocked in `accept` gets an error
    pub fn interrupt(&self) -> Result<(), NetError> {
        self.handle.shutdown(Shutdown::Both)
    }

    /// Release the socket. Closing twice is a no-op.
    pub fn close(&mut self) {
        self.handle.close();
        self.local = None;
    }
}
