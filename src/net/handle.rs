//! Owned OS socket descriptor
//!
//! A `SocketHandle` is the single owner of one descriptor. It cannot be
//! cloned; ownership moves with [`SocketHandle::transfer_to`] or
//! [`SocketHandle::take`], which leave the source handle invalid. Dropping
//! the handle closes the descriptor.

use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::trace;

use crate::error::NetError;

#[derive(Debug, Default)]
pub struct SocketHandle {
    socket: Option<Socket>,
    nonblocking: AtomicBool,
}

impl SocketHandle {
    /// Allocate a new descriptor
    pub fn create(domain: Domain, ty: Type, protocol: Option<Protocol>) -> Result<Self, NetError> {
        let socket = Socket::new(domain, ty, protocol).map_err(NetError::Resource)?;
        trace!(fd = socket.as_raw_fd(), "socket created");
        Ok(Self::from_socket(socket))
    }

    /// Handle that owns nothing
    pub fn invalid() -> Self {
        Self::default()
    }

    pub(crate) fn from_socket(socket: Socket) -> Self {
        Self {
            socket: Some(socket),
            nonblocking: AtomicBool::new(false),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.socket.is_some()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub(crate) fn socket(&self) -> Result<&Socket, NetError> {
        self.socket.as_ref().ok_or(NetError::State("socket handle is closed"))
    }

    /// Switch to non-blocking mode. Idempotent; there is no way back.
    pub fn set_nonblocking(&self) -> Result<(), NetError> {
        let socket = self.socket()?;
        if self.nonblocking.load(Ordering::Acquire) {
            return Ok(());
        }
        socket.set_nonblocking(true).map_err(NetError::Transport)?;
        self.nonblocking.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Acquire)
    }

    /// Receive timeout for blocking reads
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), NetError> {
        self.socket()?
            .set_read_timeout(timeout)
            .map_err(NetError::Transport)
    }

    /// Pending socket error (`SO_ERROR`), as a raw OS code
    pub fn last_error(&self) -> Result<Option<i32>, NetError> {
        let pending = self.socket()?.take_error().map_err(NetError::Transport)?;
        Ok(pending.and_then(|e| e.raw_os_error()))
    }

    /// Move the descriptor into `dest`, closing whatever `dest` held
    pub fn transfer_to(&mut self, dest: &mut SocketHandle) {
        *dest = self.take();
    }

    /// Take the descriptor out, leaving this handle invalid
    pub fn take(&mut self) -> SocketHandle {
        let nonblocking = self.nonblocking.swap(false, Ordering::AcqRel);
        SocketHandle {
            socket: self.socket.take(),
            nonblocking: AtomicBool::new(nonblocking),
        }
    }

    /// Half- or full-close without releasing the descriptor
    pub fn shutdown(&self, how: Shutdown) -> Result<(), NetError> {
        match self.socket()?.shutdown(how) {
            Ok(()) => Ok(()),
            // already shut down by the peer
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(NetError::Transport(e)),
        }
    }

    /// Release the descriptor. Closing twice is a no-op.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            trace!(fd = socket.as_raw_fd(), "socket closed");
        }
        self.nonblocking.store(false, Ordering::Release);
    }
}
