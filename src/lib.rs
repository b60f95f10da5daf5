//! Multi-client TCP Relay Server Library
//!
//! A small chat relay: every frame one client sends is forwarded verbatim
//! to every other connected client.
//!
//! # Features
//! - Owned socket handles with explicit ownership transfer
//! - Blocking TCP connections and listeners, UDP datagrams
//! - Optional readiness multiplexer (reactor)
//! - Delimiter-framed messages (`[TAG]payload[EOM]`)
//! - Capacity-bounded session registry with lazy pruning
//! - Server-wide shutdown from any client
//!
//! # Architecture
//! One thread per session from a bounded worker pool:
//! - `ChatManager` runs the accept loop and admits sessions
//! - Each `Session` blocks on its own socket and relays under the
//!   shared registry lock, so relay steps never interleave
//! - A `Shutdown` token is shared by all of them and wakes the accept loop
//!
//! # Example
//! ```ignore
//! use tcp_relay::{ChatManager, Config};
//!
//! let manager = ChatManager::bind(Config::with_port(8080))?;
//! manager.run()?;
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod net;
pub mod pool;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod types;

// Re-export main types for convenience
pub use config::{AcceptMode, Config};
pub use error::{FrameError, NetError, RelayError};
pub use message::{Frame, FrameKind};
pub use net::{Connection, Datagram, Listener, Multiplexer, SocketAddress, SocketHandle};
pub use pool::{Task, WorkerPool};
pub use registry::Registry;
pub use server::{ChatManager, ManagerHandle};
pub use session::{Session, SessionState};
pub use shutdown::Shutdown;
pub use types::SessionId;
