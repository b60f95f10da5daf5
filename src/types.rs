//! Identifiers shared across modules

use std::fmt;

use uuid::Uuid;

/// Log-correlation tag for one session
///
/// Peers are told apart on the wire by their socket, never by this id.
/// Displayed as 32 lowercase hex digits without dashes, so a session's
/// lines can be grepped out of a busy log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        SessionId::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.as_simple(), f)
    }
}
