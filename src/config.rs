//! Server configuration
//!
//! Compile-time defaults plus the runtime `Config` assembled by the binary.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::net::SocketAddress;

/// Default listening IP (loopback)
pub const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Default maximum number of simultaneously connected clients
pub const MAX_COUNT_CLIENT: usize = 2;

/// How long teardown waits for sessions to finish on their own
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Tick of the reactor accept loop
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Largest frame a session accepts before dropping the peer
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// How the accept loop waits for peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AcceptMode {
    /// Blocking `accept`, woken on shutdown by a self-connect
    Blocking,
    /// Non-blocking listener driven by the multiplexer
    #[default]
    Reactor,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_ip: IpAddr,
    /// 0 picks an ephemeral port
    pub port: u16,
    pub max_clients: usize,
    pub accept_mode: AcceptMode,
    pub shutdown_grace: Duration,
    pub poll_interval: Duration,
    pub max_frame_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_ip: DEFAULT_BIND_IP,
            port: 0,
            max_clients: MAX_COUNT_CLIENT,
            accept_mode: AcceptMode::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Config {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn listen_address(&self) -> SocketAddress {
        SocketAddress::new(self.bind_ip, self.port)
    }
}

/// Parse the listening port given on the command line
///
/// Accepts a non-zero decimal number that fits a TCP port. `u32::MAX` is
/// rejected explicitly since it doubles as the conversion-failure sentinel.
pub fn parse_port(arg: &str) -> Result<u16, String> {
    let value: u32 = arg
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a decimal number", arg))?;
    if value == 0 || value == u32::MAX {
        return Err(format!("{} is not a usable port", value));
    }
    u16::try_from(value).map_err(|_| format!("{} is out of the TCP port range", value))
}
