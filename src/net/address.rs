//! IP + port value type

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use socket2::SockAddr;

use crate::error::NetError;

/// Endpoint address (IP + port)
///
/// Immutable once built. Equality and ordering compare (ip, port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketAddress {
    ip: IpAddr,
    port: u16,
}

impl SocketAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Build from a textual IP and a port
    pub fn parse(ip: &str, port: u16) -> Result<Self, NetError> {
        let ip = ip
            .parse::<IpAddr>()
            .map_err(|_| NetError::Address(format!("'{}' is not an IP address", ip)))?;
        Ok(Self::new(ip, port))
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ipv4(&self) -> bool {
        self.ip.is_ipv4()
    }

    /// Native address structure for socket calls
    pub fn to_sock_addr(&self) -> SockAddr {
        SockAddr::from(SocketAddr::from(*self))
    }

    /// Convert from a native address; fails for non-IP families
    pub fn from_sock_addr(addr: &SockAddr) -> Result<Self, NetError> {
        addr.as_socket()
            .map(Self::from)
            .ok_or_else(|| NetError::Address("not an IP socket address".to_string()))
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<SocketAddress> for SocketAddr {
    fn from(addr: SocketAddress) -> Self {
        SocketAddr::new(addr.ip, addr.port)
    }
}

impl FromStr for SocketAddress {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Self::from)
            .map_err(|_| NetError::Address(format!("'{}' is not an ip:port pair", s)))
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::from(*self))
    }
}
