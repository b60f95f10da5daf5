//! Socket resource layer
//!
//! One owning resource type ([`SocketHandle`]) and one value type
//! ([`SocketAddress`]), composed into protocol-specific wrappers:
//! [`Connection`] and [`Listener`] for TCP, [`Datagram`] for UDP.
//! [`Multiplexer`] is the optional readiness reactor over them.

mod address;
mod connection;
mod datagram;
mod handle;
mod listener;
mod multiplexer;

pub use address::SocketAddress;
pub use connection::{Connection, Received, SendStatus};
pub use datagram::Datagram;
pub use handle::SocketHandle;
pub use listener::Listener;
pub use multiplexer::{Multiplexer, Readiness};
