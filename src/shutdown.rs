//! Server-wide shutdown token
//!
//! One token is created by the chat manager and cloned into every session.
//! Once requested it stays requested. The first request also wakes the
//! accept loop, which may be parked in `accept` or in a multiplexer poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::net::{Connection, SocketAddress};

/// How a shutdown request reaches the parked accept loop
#[derive(Debug, Clone)]
pub enum AcceptWaker {
    /// Connect once to the listener's own address so a blocking `accept` returns
    SelfConnect(SocketAddress),
    /// Fire the multiplexer's waker
    Reactor(Arc<mio::Waker>),
}

impl AcceptWaker {
    fn wake(&self) {
        match self {
            AcceptWaker::SelfConnect(addr) => match Connection::connect(addr) {
                Ok(_signal) => debug!(addr = %addr, "accept loop nudged"),
                Err(e) => debug!(addr = %addr, error = %e, "self-connect failed"),
            },
            AcceptWaker::Reactor(waker) => {
                if let Err(e) = waker.wake() {
                    debug!(error = %e, "reactor wake failed");
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    requested: AtomicBool,
    waker: Mutex<Option<AcceptWaker>>,
}

/// Cloneable, terminal shutdown flag
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    /// Raise the flag and wake the accept loop
    ///
    /// Returns `true` only for the call that actually raised it.
    pub fn request(&self) -> bool {
        if self.inner.requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!("shutdown requested");
        let waker = self.inner.waker.lock().clone();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// Install how the accept loop gets woken. Replaces any previous waker.
    pub fn set_waker(&self, waker: AcceptWaker) {
        *self.inner.waker.lock() = Some(waker);
    }
}
