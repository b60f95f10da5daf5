//! Readiness multiplexer (reactor)
//!
//! Tracks sockets in four roles and reports which are ready after a single
//! OS polling call:
//!
//! - **senders**: connections with room in their send buffer
//! - **readers**: connections with data (or EOF) to read
//! - **listeners**: listeners with a peer waiting in the backlog
//! - **pending**: connections whose non-blocking connect has settled
//!
//! Registrations hold `Weak` references. An owner that drops its socket
//! without deregistering is skipped and pruned on the next `poll`.
//!
//! Each `poll` registers the live descriptors, waits, and deregisters them
//! again, so registrations never outlive the socket they point at.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{trace, warn};

use super::{Connection, Listener};
use crate::error::NetError;

/// Token reserved for the waker
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Default event buffer size
const EVENT_CAPACITY: usize = 64;

/// Sockets found ready by the last [`Multiplexer::poll`]
#[derive(Debug, Default)]
pub struct Readiness {
    pub senders: Vec<Arc<Connection>>,
    pub readers: Vec<Arc<Connection>>,
    pub listeners: Vec<Arc<Listener>>,
    pub pending: Vec<Arc<Connection>>,
}

impl Readiness {
    pub fn count(&self) -> usize {
        self.senders.len() + self.readers.len() + self.listeners.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    fn clear(&mut self) {
        self.senders.clear();
        self.readers.clear();
        self.listeners.clear();
        self.pending.clear();
    }
}

/// OS readiness observed for one descriptor
#[derive(Debug, Clone, Copy, Default)]
struct Observed {
    readable: bool,
    writable: bool,
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    senders: Vec<Weak<Connection>>,
    readers: Vec<Weak<Connection>>,
    listeners: Vec<Weak<Listener>>,
    pending: Vec<Weak<Connection>>,
    ready: Readiness,
}

fn push_unique<T>(list: &mut Vec<Weak<T>>, item: &Arc<T>) {
    if !list.iter().any(|w| w.as_ptr() == Arc::as_ptr(item)) {
        list.push(Arc::downgrade(item));
    }
}

fn remove_item<T>(list: &mut Vec<Weak<T>>, item: &Arc<T>) {
    list.retain(|w| w.as_ptr() != Arc::as_ptr(item));
}

fn upgrade_all<T>(list: &mut Vec<Weak<T>>) -> Vec<Arc<T>> {
    list.retain(|w| w.strong_count() > 0);
    list.iter().filter_map(Weak::upgrade).collect()
}

fn merge(interest: &mut HashMap<RawFd, Interest>, fd: Option<RawFd>, wanted: Interest) {
    if let Some(fd) = fd {
        interest
            .entry(fd)
            .and_modify(|i| *i = i.add(wanted))
            .or_insert(wanted);
    }
}

impl Multiplexer {
    pub fn new() -> Result<Self, NetError> {
        let poll = Poll::new().map_err(NetError::Resource)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(NetError::Resource)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            waker: Arc::new(waker),
            senders: Vec::new(),
            readers: Vec::new(),
            listeners: Vec::new(),
            pending: Vec::new(),
            ready: Readiness::default(),
        })
    }

    /// Waker that makes a blocked `poll` return early
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn add_sender(&mut self, conn: &Arc<Connection>) {
        push_unique(&mut self.senders, conn);
    }

    pub fn add_reader(&mut self, conn: &Arc<Connection>) {
        push_unique(&mut self.readers, conn);
    }

    pub fn add_listener(&mut self, listener: &Arc<Listener>) {
        push_unique(&mut self.listeners, listener);
    }

    pub fn add_pending(&mut self, conn: &Arc<Connection>) {
        push_unique(&mut self.pending, conn);
    }

    pub fn remove_sender(&mut self, conn: &Arc<Connection>) {
        remove_item(&mut self.senders, conn);
    }

    pub fn remove_reader(&mut self, conn: &Arc<Connection>) {
        remove_item(&mut self.readers, conn);
    }

    pub fn remove_listener(&mut self, listener: &Arc<Listener>) {
        remove_item(&mut self.listeners, listener);
    }

    pub fn remove_pending(&mut self, conn: &Arc<Connection>) {
        remove_item(&mut self.pending, conn);
    }

    /// Registrations across all roles, including stale ones not yet pruned
    pub fn registered(&self) -> usize {
        self.senders.len() + self.readers.len() + self.listeners.len() + self.pending.len()
    }

    /// Result of the last `poll`
    pub fn ready(&self) -> &Readiness {
        &self.ready
    }

    /// Move the result of the last `poll` out
    pub fn take_ready(&mut self) -> Readiness {
        std::mem::take(&mut self.ready)
    }

    /// Wait up to `timeout` (`None` = forever) for any registered socket
    ///
    /// Returns the number of ready (socket, role) pairs; 0 means the timeout
    /// elapsed, the waker fired, or the call was interrupted.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<usize, NetError> {
        self.ready.clear();

        // strong references keep every descriptor open until deregistered
        let senders = upgrade_all(&mut self.senders);
        let readers = upgrade_all(&mut self.readers);
        let listeners = upgrade_all(&mut self.listeners);
        let pending = upgrade_all(&mut self.pending);

        let mut interest: HashMap<RawFd, Interest> = HashMap::new();
        for conn in &senders {
            merge(&mut interest, conn.raw_fd(), Interest::WRITABLE);
        }
        for conn in &readers {
            merge(&mut interest, conn.raw_fd(), Interest::READABLE);
        }
        for listener in &listeners {
            merge(&mut interest, listener.raw_fd(), Interest::READABLE);
        }
        for conn in &pending {
            merge(&mut interest, conn.raw_fd(), Interest::WRITABLE);
        }

        let registry = self.poll.registry();
        let mut registered = Vec::with_capacity(interest.len());
        for (fd, wanted) in &interest {
            match registry.register(&mut SourceFd(fd), Token(*fd as usize), *wanted) {
                Ok(()) => registered.push(*fd),
                Err(e) => warn!(fd, error = %e, "failed to register socket"),
            }
        }

        let outcome = self.poll.poll(&mut self.events, timeout);

        let mut observed: HashMap<RawFd, Observed> = HashMap::new();
        if outcome.is_ok() {
            for event in self.events.iter() {
                if event.token() == WAKE_TOKEN {
                    trace!("multiplexer woken");
                    continue;
                }
                let entry = observed.entry(event.token().0 as RawFd).or_default();
                // errors and hang-ups must surface so the owner can read the failure
                entry.readable |= event.is_readable() || event.is_read_closed() || event.is_error();
                entry.writable |= event.is_writable() || event.is_write_closed() || event.is_error();
            }
        }

        let registry = self.poll.registry();
        for fd in registered {
            if let Err(e) = registry.deregister(&mut SourceFd(&fd)) {
                warn!(fd, error = %e, "failed to deregister socket");
            }
        }

        if let Err(e) = outcome {
            if e.kind() == std::io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(NetError::Transport(e));
        }

        let is = |fd: Option<RawFd>, pick: fn(&Observed) -> bool| {
            fd.and_then(|fd| observed.get(&fd)).is_some_and(pick)
        };
        self.ready.senders = senders
            .into_iter()
            .filter(|c| is(c.raw_fd(), |o| o.writable))
            .collect();
        self.ready.readers = readers
            .into_iter()
            .filter(|c| is(c.raw_fd(), |o| o.readable))
            .collect();
        self.ready.listeners = listeners
            .into_iter()
            .filter(|l| is(l.raw_fd(), |o| o.readable))
            .collect();
        self.ready.pending = pending
            .into_iter()
            .filter(|c| is(c.raw_fd(), |o| o.writable))
            .collect();

        Ok(self.ready.count())
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("senders", &self.senders.len())
            .field("readers", &self.readers.len())
            .field("listeners", &self.listeners.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}
