//! Per-connection session
//!
//! A session owns one accepted [`Connection`] and runs the receive/relay
//! loop on a worker thread:
//!
//! 1. block in `receive` for one frame (outside the lock)
//! 2. take the registry lock
//! 3. update the connected and shutdown flags from the frame
//! 4. relay the raw frame to every other live session, pruning dead ones
//! 5. announce itself with `JOIN` on the first pass; tell a lone client
//!    there is nobody to talk to
//! 6. if this frame requested shutdown, confirm it to the sender and stop
//!
//! Holding the one registry lock for steps 2..6 makes every relay step
//! atomic with respect to other sessions and to admission.

use std::net::Shutdown as HalfClose;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{FrameError, NetError};
use crate::message::{self, Frame, FrameKind, TERMINATOR};
use crate::net::{Connection, Received, SocketAddress};
use crate::pool::Task;
use crate::registry::SharedRegistry;
use crate::shutdown::Shutdown;
use crate::types::SessionId;

/// Sent to a client that talks while nobody else is connected
pub const NO_PEERS_TEXT: &str = "No other clients are connected";

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Admitted, has not relayed anything yet
    Joining,
    /// Relayed at least one frame
    Active,
    /// Loop is winding down
    Closing,
    /// Loop has returned
    Closed,
}

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Pool stop flag raised
    Stopped,
    /// Peer closed or the socket failed
    Disconnected,
    /// Peer sent `EXIT`
    Goodbye,
    /// Someone (possibly us) requested server shutdown
    Shutdown,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    conn: Connection,
    registry: SharedRegistry<Session>,
    shutdown: Shutdown,
    state: Mutex<SessionState>,
    max_frame_size: usize,
}

impl Session {
    /// Wrap an accepted connection; ownership moves into the session
    pub fn new(
        conn: Connection,
        registry: SharedRegistry<Session>,
        shutdown: Shutdown,
        max_frame_size: usize,
    ) -> Self {
        Self {
            id: SessionId::new(),
            conn,
            registry,
            shutdown,
            state: Mutex::new(SessionState::Joining),
            max_frame_size,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn peer_addr(&self) -> Option<SocketAddress> {
        self.conn.peer_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Same underlying socket (not the same `Session` object)
    pub fn is_same(&self, other: &Session) -> bool {
        self.conn.same_socket(&other.conn)
    }

    /// Write raw bytes to this session's client
    pub fn deliver(&self, raw: &[u8]) -> Result<(), NetError> {
        self.conn.send_all(raw)
    }

    fn deliver_frame(&self, frame: Result<Frame, FrameError>) {
        match frame {
            Ok(frame) => {
                if let Err(e) = self.deliver(&frame.encode()) {
                    debug!(session = %self.id, error = %e, "could not deliver {}", frame);
                }
            }
            Err(e) => warn!(session = %self.id, error = %e, "invalid server frame"),
        }
    }

    /// Shut both directions, unblocking this session's `receive`
    pub fn force_close(&self) {
        if let Err(e) = self.conn.shutdown(HalfClose::Both) {
            debug!(session = %self.id, error = %e, "half-close failed");
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Run the receive/relay loop until the session ends
    pub fn run(&self, stop: &AtomicBool) {
        info!(session = %self.id, peer = ?self.peer_addr(), "session started");
        let exit = self.relay_loop(stop);
        self.set_state(SessionState::Closing);

        if exit == Exit::Disconnected && !self.shutdown.is_requested() {
            self.announce_leave();
        }

        self.set_state(SessionState::Closed);
        info!(session = %self.id, reason = ?exit, "session closed");
    }

    fn relay_loop(&self, stop: &AtomicBool) -> Exit {
        let mut raw = Vec::with_capacity(256);
        let mut announced = false;

        loop {
            if stop.load(Ordering::Acquire) {
                return Exit::Stopped;
            }
            if self.shutdown.is_requested() {
                return Exit::Shutdown;
            }
            if !self.conn.is_connected() {
                return Exit::Disconnected;
            }

            raw.clear();
            match self.conn.receive(&mut raw, TERMINATOR, self.max_frame_size) {
                Ok(Received::Complete) => {}
                Ok(Received::LimitReached) => {
                    warn!(session = %self.id, limit = self.max_frame_size, "frame too large, dropping client");
                    self.force_close();
                    return Exit::Disconnected;
                }
                Err(e) => {
                    debug!(session = %self.id, error = %e, "receive ended");
                    return Exit::Disconnected;
                }
            }
            // another session shut the server down while we were blocked
            if self.shutdown.is_requested() {
                return Exit::Shutdown;
            }

            let kind = message::classify(&raw);
            debug!(session = %self.id, kind = ?kind, bytes = raw.len(), "frame received");

            let mut registry = self.registry.lock();

            let connected = self.conn.is_connected() && kind != FrameKind::Exit;
            let requested_here = kind == FrameKind::Shutdown && self.shutdown.request();
            let first_pass = !announced;
            if first_pass {
                announced = true;
                self.set_state(SessionState::Active);
            }

            let mut others = 0usize;
            registry.for_each_live(|peer| {
                if peer.is_same(self) {
                    return;
                }
                others += 1;
                if let Err(e) = peer.deliver(&raw) {
                    debug!(session = %self.id, to = %peer.id, error = %e, "relay failed");
                }
                if first_pass {
                    peer.deliver_frame(Frame::control(FrameKind::Join));
                }
            });

            if others == 0 && connected {
                self.deliver_frame(Frame::info(NO_PEERS_TEXT));
            }
            if requested_here {
                self.deliver_frame(Frame::control(FrameKind::Shutdown));
                return Exit::Shutdown;
            }
            drop(registry);

            if !connected {
                return if kind == FrameKind::Exit {
                    Exit::Goodbye
                } else {
                    Exit::Disconnected
                };
            }
        }
    }

    /// Tell the remaining peers this client vanished without `EXIT`
    fn announce_leave(&self) {
        let frame = match Frame::control(FrameKind::Leave) {
            Ok(frame) => frame.encode(),
            Err(_) => return,
        };
        let mut registry = self.registry.lock();
        registry.for_each_live(|peer| {
            if !peer.is_same(self) && peer.is_connected() {
                if let Err(e) = peer.deliver(&frame) {
                    debug!(session = %self.id, to = %peer.id, error = %e, "could not announce leave");
                }
            }
        });
    }
}

impl Task for Session {
    fn work(&self, stop: &AtomicBool) {
        self.run(stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Listener;
    use crate::registry::Registry;
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        listener: Listener,
        registry: SharedRegistry<Session>,
        shutdown: Shutdown,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                listener: Listener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap(),
                registry: Registry::shared(4),
                shutdown: Shutdown::new(),
            }
        }

        /// Connect a client and wrap the server side in a registered session
        fn join(&self) -> (Connection, Arc<Session>) {
            let client = Connection::connect(&self.listener.local_addr().unwrap()).unwrap();
            client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let accepted = self.listener.accept().unwrap();
            let session = Arc::new(Session::new(
                accepted,
                self.registry.clone(),
                self.shutdown.clone(),
                1024,
            ));
            self.registry.lock().admit(&session).unwrap();
            (client, session)
        }
    }

    fn spawn(session: Arc<Session>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || session.run(&AtomicBool::new(false)))
    }

    fn read_frame(conn: &Connection) -> Frame {
        let mut buf = Vec::new();
        conn.receive(&mut buf, TERMINATOR, 0).unwrap();
        Frame::decode(&buf).unwrap()
    }

    #[test]
    fn test_new_session_is_joining() {
        let harness = Harness::new();
        let (_client, session) = harness.join();
        assert_eq!(session.state(), SessionState::Joining);
        assert!(session.is_connected());
    }

    #[test]
    fn test_relay_reaches_other_session_only() {
        let harness = Harness::new();
        let (alice, a) = harness.join();
        let (bob, b) = harness.join();
        let worker = spawn(a.clone());
        let _bob_worker = spawn(b);

        alice.send_all(&Frame::normal("hello").unwrap().encode()).unwrap();

        assert_eq!(read_frame(&bob), Frame::normal("hello").unwrap());
        assert_eq!(read_frame(&bob), Frame::control(FrameKind::Join).unwrap());

        alice.send_all(&Frame::control(FrameKind::Exit).unwrap().encode()).unwrap();
        assert_eq!(read_frame(&bob).kind(), FrameKind::Exit);
        worker.join().unwrap();
        assert_eq!(a.state(), SessionState::Closed);

        // alice never saw her own frames
        alice.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let mut buf = Vec::new();
        assert!(alice.receive(&mut buf, TERMINATOR, 0).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_lonely_client_gets_info() {
        let harness = Harness::new();
        let (alice, a) = harness.join();
        let _worker = spawn(a.clone());

        alice.send_all(&Frame::normal("anyone?").unwrap().encode()).unwrap();

        let reply = read_frame(&alice);
        assert_eq!(reply.kind(), FrameKind::Info);
        assert_eq!(reply.text(), NO_PEERS_TEXT);
        assert_eq!(a.state(), SessionState::Active);
    }

    #[test]
    fn test_shutdown_frame_is_confirmed_and_relayed() {
        let harness = Harness::new();
        let (alice, a) = harness.join();
        let (bob, b) = harness.join();
        let worker = spawn(a);
        let bob_worker = spawn(b);

        alice.send_all(&Frame::control(FrameKind::Shutdown).unwrap().encode()).unwrap();

        assert_eq!(read_frame(&alice).kind(), FrameKind::Shutdown);
        worker.join().unwrap();
        assert!(harness.shutdown.is_requested());

        assert_eq!(read_frame(&bob).kind(), FrameKind::Shutdown);
        // bob's session notices on its next receive cycle
        bob.send_all(&Frame::normal("late").unwrap().encode()).unwrap();
        bob_worker.join().unwrap();
    }

    #[test]
    fn test_disconnect_announces_leave() {
        let harness = Harness::new();
        let (mut alice, a) = harness.join();
        let (bob, b) = harness.join();
        let worker = spawn(a);
        let _bob_worker = spawn(b);

        alice.close();
        worker.join().unwrap();

        assert_eq!(read_frame(&bob).kind(), FrameKind::Leave);
    }

    #[test]
    fn test_dead_session_pruned_on_next_relay() {
        let harness = Harness::new();
        let (alice, a) = harness.join();
        let (_carol, c) = harness.join();
        let _worker = spawn(a);
        assert_eq!(harness.registry.lock().len(), 2);

        // carol's session is destroyed without ever running
        drop(c);
        alice.send_all(&Frame::normal("x").unwrap().encode()).unwrap();

        assert_eq!(read_frame(&alice).kind(), FrameKind::Info);
        assert_eq!(harness.registry.lock().len(), 1);
    }

    #[test]
    fn test_oversized_frame_drops_client() {
        let harness = Harness::new();
        let (alice, a) = harness.join();
        let worker = spawn(a.clone());

        alice.send_all(&vec![b'x'; 2048]).unwrap();
        worker.join().unwrap();
        assert_eq!(a.state(), SessionState::Closed);
    }

    #[test]
    fn test_force_close_ends_blocked_session() {
        let harness = Harness::new();
        let (_alice, a) = harness.join();
        let worker = spawn(a.clone());
        std::thread::sleep(Duration::from_millis(50));

        a.force_close();

        worker.join().unwrap();
        assert_eq!(a.state(), SessionState::Closed);
    }

    #[test]
    fn test_pool_stop_flag_checked_between_frames() {
        let harness = Harness::new();
        let (alice, a) = harness.join();
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = stop.clone();
            let a = a.clone();
            std::thread::spawn(move || a.run(&stop))
        };

        stop.store(true, Ordering::Release);
        // the flag is only seen once the blocked receive returns
        alice.send_all(&Frame::normal("wake").unwrap().encode()).unwrap();

        worker.join().unwrap();
        assert_eq!(a.state(), SessionState::Closed);
    }
}
