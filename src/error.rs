//! Error types for the relay server
//!
//! Defines socket-layer errors, framing errors and application-level errors.
//! Uses thiserror for ergonomic error definitions.

use std::io;

use thiserror::Error;

use crate::message::FrameKind;

/// Socket-layer errors
///
/// Every socket operation reports through this type instead of aborting.
/// `WouldBlock` is not a failure: it only means a non-blocking socket has
/// no data or buffer space yet.
#[derive(Debug, Error)]
pub enum NetError {
    /// OS-level connect/bind/send/receive failure
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// Non-blocking operation cannot make progress yet
    #[error("operation would block")]
    WouldBlock,

    /// Operation attempted on a socket that is not connected
    #[error("socket is not connected")]
    NotConnected,

    /// The peer closed its side of the connection
    #[error("peer closed the connection")]
    Disconnected,

    /// Operation attempted on a closed or never-opened handle
    #[error("invalid socket state: {0}")]
    State(&'static str),

    /// Descriptor allocation or bind failure
    #[error("socket resource error: {0}")]
    Resource(#[source] io::Error),

    /// Datagram larger than the locally queried maximum
    #[error("datagram of {len} bytes exceeds maximum of {max} bytes")]
    Size { len: usize, max: usize },

    /// Malformed IP address or port
    #[error("invalid address: {0}")]
    Address(String),
}

impl NetError {
    /// Classify an I/O error coming out of a send/receive/accept call
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => NetError::WouldBlock,
            io::ErrorKind::NotConnected => NetError::NotConnected,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => NetError::Disconnected,
            _ => NetError::Transport(err),
        }
    }

    /// Raw OS error code, when the error came from the OS
    pub fn os_code(&self) -> Option<i32> {
        match self {
            NetError::Transport(e) | NetError::Resource(e) => e.raw_os_error(),
            _ => None,
        }
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, NetError::WouldBlock)
    }
}

/// Framing errors (the protocol error class)
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Tag bytes do not match any known frame kind
    #[error("unrecognized frame tag")]
    UnknownTag,

    /// Frame does not end with the terminator
    #[error("frame is missing its terminator")]
    MissingTerminator,

    /// Control frames never carry a payload
    #[error("{0:?} frames cannot carry a payload")]
    PayloadNotAllowed(FrameKind),

    /// Payloads are not escaped, so they may not contain the terminator
    #[error("payload contains the frame terminator")]
    TerminatorInPayload,
}

/// Application-level errors
///
/// Covers fatal errors (listener failure, runtime construction) and
/// admission errors (registry full).
#[derive(Debug, Error)]
pub enum RelayError {
    /// Socket layer failure
    #[error("network error: {0}")]
    Net(#[from] NetError),

    /// Malformed frame
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Registry already holds the maximum number of sessions
    #[error("maximum number of clients ({capacity}) reached")]
    Capacity { capacity: usize },
}
