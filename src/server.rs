//! Chat manager
//!
//! Owns the listener, the session registry, the shutdown token and the
//! worker pool, and drives the accept loop:
//!
//! - admit each accepted peer as a [`Session`] while under capacity
//! - turn away peers beyond capacity with an `INFO` frame
//! - treat a failing `accept` as fatal for the whole server
//! - on shutdown, give sessions a grace period, then half-close stragglers

use std::net::Shutdown as HalfClose;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::{AcceptMode, Config};
use crate::error::{NetError, RelayError};
use crate::message::Frame;
use crate::net::{Connection, Listener, Multiplexer, SocketAddress};
use crate::pool::WorkerPool;
use crate::registry::{Registry, SharedRegistry};
use crate::session::Session;
use crate::shutdown::{AcceptWaker, Shutdown};

/// Poll step while waiting out the shutdown grace period
const GRACE_STEP: Duration = Duration::from_millis(10);

/// Cloneable view of a running manager
///
/// Lets another thread watch the registry or stop the server after
/// [`ChatManager::run`] has taken ownership of the manager.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    registry: SharedRegistry<Session>,
    shutdown: Shutdown,
    local_addr: SocketAddress,
}

impl ManagerHandle {
    /// Number of sessions still alive
    pub fn peer_count(&self) -> usize {
        self.registry.lock().live_count()
    }

    pub fn local_addr(&self) -> SocketAddress {
        self.local_addr
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_requested()
    }

    /// Stop the server as if a client had sent `SHUTDOWN`
    pub fn request_shutdown(&self) -> bool {
        self.shutdown.request()
    }
}

/// The main chat manager
pub struct ChatManager {
    config: Config,
    listener: Arc<Listener>,
    registry: SharedRegistry<Session>,
    shutdown: Shutdown,
    pool: WorkerPool,
}

impl ChatManager {
    /// Bind the listening socket and start the worker pool
    pub fn bind(config: Config) -> Result<Self, RelayError> {
        let listener = Listener::bind(&config.listen_address())?;
        let pool = WorkerPool::new(config.max_clients)?;
        Ok(Self {
            registry: Registry::shared(config.max_clients),
            shutdown: Shutdown::new(),
            listener: Arc::new(listener),
            pool,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddress, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> Result<ManagerHandle, RelayError> {
        Ok(ManagerHandle {
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
            local_addr: self.local_addr()?,
        })
    }

    /// Run the accept loop until shutdown, then tear everything down
    pub fn run(self) -> Result<(), RelayError> {
        info!(
            addr = %self.local_addr()?,
            mode = ?self.config.accept_mode,
            capacity = self.config.max_clients,
            "chat manager started"
        );
        let result = match self.config.accept_mode {
            AcceptMode::Blocking => self.accept_blocking(),
            AcceptMode::Reactor => self.accept_reactor(),
        };
        self.teardown();
        result
    }

    fn accept_blocking(&self) -> Result<(), RelayError> {
        self.shutdown
            .set_waker(AcceptWaker::SelfConnect(self.local_addr()?));

        while !self.shutdown.is_requested() {
            match self.listener.accept() {
                Ok(conn) => {
                    if self.shutdown.is_requested() {
                        debug!(peer = ?conn.peer_addr(), "accept loop woken for shutdown");
                        break;
                    }
                    self.admit(conn);
                }
                Err(e) => return Err(self.accept_failed(e)),
            }
        }
        Ok(())
    }

    fn accept_reactor(&self) -> Result<(), RelayError> {
        let mut mux = Multiplexer::new()?;
        self.listener.handle().set_nonblocking()?;
        mux.add_listener(&self.listener);
        self.shutdown.set_waker(AcceptWaker::Reactor(mux.waker()));

        while !self.shutdown.is_requested() {
            if let Err(e) = mux.poll(Some(self.config.poll_interval)) {
                return Err(self.accept_failed(e));
            }
            if mux.ready().listeners.is_empty() {
                continue;
            }
            // drain the backlog; the listener is non-blocking
            loop {
                match self.listener.accept() {
                    Ok(conn) => self.admit(conn),
                    Err(NetError::WouldBlock) => break,
                    Err(e) => return Err(self.accept_failed(e)),
                }
            }
        }
        Ok(())
    }

    fn accept_failed(&self, err: NetError) -> RelayError {
        error!(code = ?err.os_code(), "accept failed: {}", err);
        self.shutdown.request();
        err.into()
    }

    /// Turn an accepted connection into a running session, or reject it
    fn admit(&self, conn: Connection) {
        let peer = conn.peer_addr();
        let mut registry = self.registry.lock();

        if self.shutdown.is_requested() {
            debug!(peer = ?peer, "shutting down, dropping new connection");
            return;
        }
        if registry.is_full() {
            drop(registry);
            self.reject(conn);
            return;
        }

        let session = Arc::new(Session::new(
            conn,
            self.registry.clone(),
            self.shutdown.clone(),
            self.config.max_frame_size,
        ));
        if let Err(e) = registry.admit(&session) {
            warn!(peer = ?peer, error = %e, "admission failed");
            session.force_close();
            return;
        }
        info!(
            session = %session.id(),
            peer = ?peer,
            "client admitted ({}/{})",
            registry.len(),
            registry.capacity()
        );
        self.pool.submit(session);
    }

    fn reject(&self, mut conn: Connection) {
        let err = RelayError::Capacity {
            capacity: self.config.max_clients,
        };
        warn!(peer = ?conn.peer_addr(), "{}", err);
        if let Err(e) = conn.send_all(&Frame::from(&err).encode()) {
            debug!(error = %e, "could not notify rejected client");
        }
        if let Err(e) = conn.shutdown(HalfClose::Both) {
            debug!(error = %e, "half-close of rejected client failed");
        }
        conn.close();
    }

    fn teardown(self) {
        let ChatManager {
            config,
            listener,
            registry,
            shutdown,
            pool,
        } = self;
        shutdown.request();

        let deadline = Instant::now() + config.shutdown_grace;
        while registry.lock().live_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(GRACE_STEP);
        }

        let stragglers = registry.lock().live();
        if !stragglers.is_empty() {
            info!(count = stragglers.len(), "closing sessions still connected");
        }
        for session in &stragglers {
            session.force_close();
        }
        drop(stragglers);
        registry.lock().clear();

        pool.shutdown(config.shutdown_grace);
        drop(listener);
        info!("chat manager stopped");
    }
}

impl std::fmt::Debug for ChatManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatManager")
            .field("config", &self.config)
            .field("listener", &self.listener)
            .field("shutdown", &self.shutdown.is_requested())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FrameKind, TERMINATOR};

    fn start(mode: AcceptMode, capacity: usize) -> (ManagerHandle, std::thread::JoinHandle<Result<(), RelayError>>) {
        let config = Config {
            accept_mode: mode,
            max_clients: capacity,
            ..Config::default()
        };
        let manager = ChatManager::bind(config).unwrap();
        let handle = manager.handle().unwrap();
        (handle, std::thread::spawn(move || manager.run()))
    }

    fn wait_for_peers(handle: &ManagerHandle, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.peer_count() != n && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.peer_count(), n);
    }

    fn client(handle: &ManagerHandle) -> Connection {
        let conn = Connection::connect(&handle.local_addr()).unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        conn
    }

    #[test]
    fn test_bind_reports_ephemeral_port() {
        let manager = ChatManager::bind(Config::default()).unwrap();
        assert_ne!(manager.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_external_shutdown_stops_reactor_loop() {
        let (handle, server) = start(AcceptMode::Reactor, 2);
        let _a = client(&handle);
        wait_for_peers(&handle, 1);

        assert!(handle.request_shutdown());

        assert!(server.join().unwrap().is_ok());
        assert_eq!(handle.peer_count(), 0);
    }

    #[test]
    fn test_external_shutdown_stops_blocking_loop() {
        let (handle, server) = start(AcceptMode::Blocking, 2);
        let a = client(&handle);
        wait_for_peers(&handle, 1);

        handle.request_shutdown();

        assert!(server.join().unwrap().is_ok());
        // teardown half-closed the idle session
        let mut buf = Vec::new();
        assert!(a.receive(&mut buf, TERMINATOR, 0).is_err());
    }

    #[test]
    fn test_accept_failure_stops_server() {
        for mode in [AcceptMode::Blocking, AcceptMode::Reactor] {
            let config = Config {
                accept_mode: mode,
                ..Config::default()
            };
            let manager = ChatManager::bind(config).unwrap();
            let handle = manager.handle().unwrap();
            let listener = manager.listener.clone();
            let server = std::thread::spawn(move || manager.run());
            std::thread::sleep(Duration::from_millis(50));

            listener.interrupt().unwrap();

            assert!(server.join().unwrap().is_err(), "{:?} loop survived", mode);
            assert!(handle.is_shutdown());
        }
    }

    #[test]
    fn test_over_capacity_peer_is_rejected() {
        let (handle, server) = start(AcceptMode::Reactor, 1);
        let _a = client(&handle);
        wait_for_peers(&handle, 1);

        let b = client(&handle);
        let mut buf = Vec::new();
        b.receive(&mut buf, TERMINATOR, 0).unwrap();
        let frame = Frame::decode(&buf).unwrap();

        assert_eq!(frame.kind(), FrameKind::Info);
        assert!(frame.text().contains("maximum number of clients"));
        assert_eq!(handle.peer_count(), 1);

        handle.request_shutdown();
        server.join().unwrap().unwrap();
    }
}
