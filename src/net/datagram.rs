//! UDP socket with MTU-aware send and reply-to-last-sender support

use std::io::Read;

use socket2::{Domain, Protocol, Type};
use tracing::trace;

use super::{SocketAddress, SocketHandle};
use crate::error::NetError;

/// Largest UDP payload an IPv4 datagram can carry
const MAX_UDP_PAYLOAD_V4: usize = 65_507;
/// Largest UDP payload an IPv6 datagram can carry (without jumbograms)
const MAX_UDP_PAYLOAD_V6: usize = 65_527;

#[derive(Debug)]
pub struct Datagram {
    handle: SocketHandle,
    local: SocketAddress,
    last_peer: Option<SocketAddress>,
}

impl Datagram {
    /// Bind a UDP socket to `addr` (port 0 picks an ephemeral port)
    pub fn bind(addr: &SocketAddress) -> Result<Self, NetError> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let handle = SocketHandle::create(domain, Type::DGRAM, Some(Protocol::UDP))?;
        let socket = handle.socket()?;
        socket.bind(&addr.to_sock_addr()).map_err(NetError::Resource)?;
        let local = socket
            .local_addr()
            .map_err(NetError::Resource)
            .and_then(|a| SocketAddress::from_sock_addr(&a))?;
        Ok(Self {
            handle,
            local,
            last_peer: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddress {
        self.local
    }

    pub fn handle(&self) -> &SocketHandle {
        &self.handle
    }

    /// Peer of the most recent `receive_from` or `send_to`
    pub fn last_peer(&self) -> Option<SocketAddress> {
        self.last_peer
    }

    /// Largest payload this socket will send in one datagram
    ///
    /// The smaller of the protocol limit and the socket's send buffer.
    pub fn max_datagram_size(&self) -> Result<usize, NetError> {
        let protocol_max = if self.local.is_ipv4() {
            MAX_UDP_PAYLOAD_V4
        } else {
            MAX_UDP_PAYLOAD_V6
        };
        let sndbuf = self
            .handle
            .socket()?
            .send_buffer_size()
            .map_err(NetError::Transport)?;
        Ok(protocol_max.min(sndbuf))
    }

    pub fn send_to(&mut self, payload: &[u8], peer: &SocketAddress) -> Result<(), NetError> {
        let max = self.max_datagram_size()?;
        if payload.len() > max {
            return Err(NetError::Size {
                len: payload.len(),
                max,
            });
        }
        let sent = self
            .handle
            .socket()?
            .send_to(payload, &peer.to_sock_addr())
            .map_err(NetError::from_io)?;
        trace!(bytes = sent, peer = %peer, "datagram sent");
        self.last_peer = Some(*peer);
        Ok(())
    }

    /// Send to whoever we last talked to
    pub fn reply(&mut self, payload: &[u8]) -> Result<(), NetError> {
        let peer = self
            .last_peer
            .ok_or(NetError::State("no previous datagram peer"))?;
        self.send_to(payload, &peer)
    }

    /// Receive one datagram into `buf`, returning its length and sender
    ///
    /// Datagrams longer than `buf` are truncated.
    pub fn receive_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddress), NetError> {
        let socket = self.handle.socket()?;
        let sender = socket.peek_sender().map_err(NetError::from_io)?;
        let sender = SocketAddress::from_sock_addr(&sender)?;
        let len = (&*socket).read(buf).map_err(NetError::from_io)?;
        trace!(bytes = len, peer = %sender, "datagram received");
        self.last_peer = Some(sender);
        Ok((len, sender))
    }

    /// Release the socket. Closing twice is a no-op.
    pub fn close(&mut self) {
        self.handle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bind_loopback() -> Datagram {
        Datagram::bind(&"127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_send_receive_and_reply() {
        let mut a = bind_loopback();
        let mut b = bind_loopback();
        b.handle().set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        a.handle().set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        a.send_to(b"ping", &b.local_addr()).unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = b.receive_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr());
        assert_eq!(b.last_peer(), Some(a.local_addr()));

        b.reply(b"pong").unwrap();
        let (len, from) = a.receive_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"pong");
        assert_eq!(from, b.local_addr());
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let mut a = bind_loopback();
        let target = a.local_addr();
        let max = a.max_datagram_size().unwrap();
        let big = vec![0u8; max + 1];

        assert!(matches!(
            a.send_to(&big, &target),
            Err(NetError::Size { len, .. }) if len == max + 1
        ));
        assert_eq!(a.last_peer(), None);
    }

    #[test]
    fn test_reply_without_peer() {
        let mut a = bind_loopback();
        assert!(matches!(a.reply(b"x"), Err(NetError::State(_))));
    }

    #[test]
    fn test_receive_times_out_as_would_block() {
        let mut a = bind_loopback();
        a.handle().set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(a.receive_from(&mut buf), Err(NetError::WouldBlock)));
    }
}
