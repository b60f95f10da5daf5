//! TCP connection
//!
//! A `Connection` pairs a [`SocketHandle`] with its local and peer addresses.
//! It is built either by connecting out, or by adopting a handle produced by
//! [`Listener::accept`](super::Listener::accept).
//!
//! `send` and `receive` take `&self`, so one thread may block in `receive`
//! while other threads relay frames into the same connection.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Type};
use tracing::{debug, trace};

use super::{SocketAddress, SocketHandle};
use crate::error::NetError;

/// Bytes read per `read` call in [`Connection::receive`]
const READ_CHUNK: usize = 4096;

/// Outcome of a single [`Connection::send`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Everything from the offset onwards was written
    Complete,
    /// Only part was written; retry from `len - remaining`
    Partial { remaining: usize },
}

/// Outcome of [`Connection::receive`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// The buffer now ends with the terminator
    Complete,
    /// `max_size` bytes were accumulated without seeing the terminator
    LimitReached,
}

#[derive(Debug, Default)]
pub struct Connection {
    handle: SocketHandle,
    local: Option<SocketAddress>,
    peer: Option<SocketAddress>,
    connected: AtomicBool,
    /// Bytes read past the last terminator, consumed by the next `receive`
    pending: Mutex<Vec<u8>>,
}

fn domain_for(addr: &SocketAddress) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

impl Connection {
    /// Unconnected connection owning no socket
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocking connect to `peer`
    pub fn connect(peer: &SocketAddress) -> Result<Self, NetError> {
        let handle = SocketHandle::create(domain_for(peer), Type::STREAM, Some(Protocol::TCP))?;
        handle
            .socket()?
            .connect(&peer.to_sock_addr())
            .map_err(NetError::Transport)?;

        let mut conn = Self::new();
        conn.install(handle, *peer);
        debug!(peer = %peer, "connected");
        Ok(conn)
    }

    /// Start a non-blocking connect
    ///
    /// The connection is not usable until [`Connection::finish_connect`]
    /// returns `true`; poll it through the multiplexer's pending role.
    pub fn begin_connect(peer: &SocketAddress) -> Result<Self, NetError> {
        let handle = SocketHandle::create(domain_for(peer), Type::STREAM, Some(Protocol::TCP))?;
        handle.set_nonblocking()?;

        let mut conn = Self::new();
        let started = handle.socket()?.connect(&peer.to_sock_addr());
        match started {
            Ok(()) => {
                conn.install(handle, *peer);
            }
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                conn.handle = handle;
                conn.peer = Some(*peer);
            }
            Err(e) => return Err(NetError::Transport(e)),
        }
        Ok(conn)
    }

    /// Check a connect started by [`Connection::begin_connect`]
    ///
    /// Returns `Ok(false)` while the handshake is still in flight.
    pub fn finish_connect(&mut self) -> Result<bool, NetError> {
        if self.is_connected() {
            return Ok(true);
        }
        let socket = self.handle.socket()?;
        if let Some(e) = socket.take_error().map_err(NetError::Transport)? {
            return Err(NetError::Transport(e));
        }
        match socket.peer_addr() {
            Ok(_) => {
                self.local = socket
                    .local_addr()
                    .ok()
                    .and_then(|a| SocketAddress::from_sock_addr(&a).ok());
                self.connected.store(true, Ordering::Release);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(NetError::Transport(e)),
        }
    }

    /// Take ownership of a freshly accepted handle
    ///
    /// `handle` is left invalid. Whatever this connection held before is closed.
    pub fn adopt(&mut self, handle: &mut SocketHandle, peer: SocketAddress) -> Result<(), NetError> {
        if !handle.is_valid() {
            return Err(NetError::State("cannot adopt a closed handle"));
        }
        self.close();
        let handle = handle.take();
        self.install(handle, peer);
        Ok(())
    }

    fn install(&mut self, handle: SocketHandle, peer: SocketAddress) {
        self.local = handle
            .socket()
            .ok()
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| SocketAddress::from_sock_addr(&a).ok());
        self.handle = handle;
        self.peer = Some(peer);
        self.pending.get_mut().clear();
        self.connected.store(true, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.handle.is_valid()
    }

    pub fn peer_addr(&self) -> Option<SocketAddress> {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddress> {
        self.local
    }

    pub fn handle(&self) -> &SocketHandle {
        &self.handle
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.handle.raw_fd()
    }

    /// Whether both connections wrap the same descriptor
    pub fn same_socket(&self, other: &Connection) -> bool {
        matches!((self.raw_fd(), other.raw_fd()), (Some(a), Some(b)) if a == b)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), NetError> {
        self.handle.set_read_timeout(timeout)
    }

    fn live_socket(&self) -> Result<&socket2::Socket, NetError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(NetError::NotConnected);
        }
        self.handle.socket().map_err(|_| NetError::NotConnected)
    }

    fn mark_lost(&self, err: &NetError) {
        if matches!(err, NetError::Disconnected | NetError::NotConnected | NetError::Transport(_)) {
            self.connected.store(false, Ordering::Release);
        }
    }

    /// Write `buf[offset..]` with one OS write
    pub fn send(&self, buf: &[u8], offset: usize) -> Result<SendStatus, NetError> {
        let socket = self.live_socket()?;
        let rest = buf.get(offset..).unwrap_or_default();
        if rest.is_empty() {
            return Ok(SendStatus::Complete);
        }
        match (&*socket).write(rest) {
            Ok(0) => {
                self.connected.store(false, Ordering::Release);
                Err(NetError::Disconnected)
            }
            Ok(n) if n == rest.len() => Ok(SendStatus::Complete),
            Ok(n) => Ok(SendStatus::Partial { remaining: rest.len() - n }),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                Ok(SendStatus::Partial { remaining: rest.len() })
            }
            Err(e) => {
                let err = NetError::from_io(e);
                self.mark_lost(&err);
                Err(err)
            }
        }
    }

    /// Write all of `buf`, retrying partial writes
    pub fn send_all(&self, buf: &[u8]) -> Result<(), NetError> {
        let mut offset = 0;
        while let SendStatus::Partial { remaining } = self.send(buf, offset)? {
            offset = buf.len() - remaining;
        }
        trace!(bytes = buf.len(), "sent");
        Ok(())
    }

    /// Append bytes to `buf` until it ends with `terminator`
    ///
    /// The terminator is searched for across the whole accumulated buffer,
    /// since it may arrive split over two reads. Bytes read past the
    /// terminator are kept for the next call. `max_size` of 0 means no limit.
    pub fn receive(
        &self,
        buf: &mut Vec<u8>,
        terminator: &[u8],
        max_size: usize,
    ) -> Result<Received, NetError> {
        let socket = self.live_socket()?;
        if terminator.is_empty() {
            return Err(NetError::State("empty terminator"));
        }
        let start = buf.len();
        buf.append(&mut self.pending.lock());

        // bytes the caller already holds count toward the frame
        let mut scan_from = 0;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(end) = find_from(buf, terminator, scan_from) {
                let rest = buf.split_off(end);
                self.pending.lock().extend_from_slice(&rest);
                return Ok(Received::Complete);
            }
            scan_from = buf.len().saturating_sub(terminator.len() - 1);
            if max_size != 0 && buf.len() - start >= max_size {
                return Ok(Received::LimitReached);
            }

            let want = if max_size == 0 {
                READ_CHUNK
            } else {
                READ_CHUNK.min(max_size - (buf.len() - start))
            };
            match (&*socket).read(&mut chunk[..want]) {
                Ok(0) => {
                    debug!(peer = ?self.peer, "peer closed connection");
                    self.connected.store(false, Ordering::Release);
                    return Err(NetError::Disconnected);
                }
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let err = NetError::from_io(e);
                    if err.is_would_block() {
                        // keep partial data for the next attempt
                        let partial = buf.split_off(start);
                        *self.pending.lock() = partial;
                    }
                    self.mark_lost(&err);
                    return Err(err);
                }
            }
        }
    }

    /// Shut down one or both directions; wakes a thread blocked in `receive`
    pub fn shutdown(&self, how: Shutdown) -> Result<(), NetError> {
        self.handle.shutdown(how)
    }

    /// Release the socket. Closing twice is a no-op.
    pub fn close(&mut self) {
        self.connected.store(false, Ordering::Release);
        self.handle.close();
        self.pending.get_mut().clear();
    }
}

/// Exclusive end index of the first `needle` in `buf[from..]`
fn find_from(buf: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| from + pos + needle.len())
}
