//! The incoming connection listener.

use crate::config::Settings;
use crate::connection::{Adapter, Connection, StartCallback};
use crate::endpoint::{ConcurrencyMode, Endpoint};
use crate::error::{lock, wait, DestroyReason, Error};
use crate::thread_pool::{EventHandler, Promotion, Readiness, ThreadPool};
use crate::transport::{accept_blocking, connect_to_self, Acceptor};
use mio::{Interest, Token};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, instrument, trace, warn};

/// State of an [`IncomingConnectionFactory`].
///
/// `Active` and `Holding` may alternate; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ListenerState {
    Active,
    Holding,
    Closed,
}

// How accepts are driven. The state machine is shared by both.
enum Strategy {
    EventDriven {
        token: Option<Token>,
        // Unregistrations whose `finished` callback has not run yet.
        finished_count: usize,
    },
    DedicatedThread {
        thread: Option<JoinHandle<()>>,
    },
}

struct Inner {
    state: ListenerState,
    // None once the listening socket is closed.
    acceptor: Option<Acceptor>,
    connections: Vec<Arc<Connection>>,
    strategy: Strategy,
}

/// Accepts connections on one endpoint and mirrors its state onto them.
///
/// A new listener is `Holding`: it accepts nothing until
/// [`activate`](Self::activate) is called. In pooled mode the listening
/// socket is registered with the thread pool while active; in
/// thread-per-connection mode a dedicated thread runs a blocking accept
/// loop.
pub struct IncomingConnectionFactory {
    weak: Weak<IncomingConnectionFactory>,
    settings: Settings,
    endpoint: Endpoint,
    local_addr: SocketAddr,
    adapter: Arc<dyn Adapter>,
    mode: ConcurrencyMode,
    thread_pool: ThreadPool,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl std::fmt::Debug for IncomingConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingConnectionFactory")
            .field("endpoint", &self.endpoint)
            .field("adapter", &self.adapter.name())
            .field("mode", &self.mode)
            .field("state", &lock(&self.inner).state)
            .finish()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl IncomingConnectionFactory {
    /// Binds `endpoint` and returns a holding listener dispatching to
    /// `adapter`.
    ///
    /// The endpoint gets the configured timeout and compression overrides;
    /// a port of 0 is replaced by the bound port. On failure the listening
    /// socket is closed before the error is returned.
    #[instrument(skip(adapter, thread_pool, settings), fields(adapter = adapter.name()))]
    pub fn new(
        endpoint: &Endpoint,
        adapter: Arc<dyn Adapter>,
        mode: ConcurrencyMode,
        thread_pool: &ThreadPool,
        settings: &Settings,
    ) -> Result<Arc<Self>, Error> {
        if !endpoint.supports_mode(mode) {
            return Err(Error::FeatureNotSupported {
                feature: format!("{mode:?} concurrency for endpoint `{endpoint}`"),
            });
        }

        let mut endpoint = endpoint.clone();
        if let Some(timeout) = settings.override_timeout {
            endpoint = endpoint.with_timeout(Some(timeout));
        }
        if let Some(compress) = settings.override_compress {
            endpoint = endpoint.with_compress(compress);
        }

        let addr = endpoint
            .socket_addrs()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidEndpoint(endpoint.to_string()))?;
        let acceptor = Acceptor::bind(addr, mode == ConcurrencyMode::Pooled)?;
        let local_addr = acceptor.local_addr()?;
        let endpoint = endpoint.with_port(local_addr.port());

        let blocking = match &acceptor {
            Acceptor::Blocking(listener) => Some(listener.clone()),
            Acceptor::Polled { .. } => None,
        };
        let strategy = match mode {
            ConcurrencyMode::Pooled => Strategy::EventDriven {
                token: None,
                finished_count: 0,
            },
            ConcurrencyMode::ThreadPerConnection => Strategy::DedicatedThread { thread: None },
        };

        let factory = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            settings: settings.clone(),
            endpoint,
            local_addr,
            adapter,
            mode,
            thread_pool: thread_pool.clone(),
            inner: Mutex::new(Inner {
                state: ListenerState::Holding,
                acceptor: Some(acceptor),
                connections: Vec::new(),
                strategy,
            }),
            cond: Condvar::new(),
        });

        if let Some(listener) = blocking {
            let this = factory.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-accept", factory.adapter.name()))
                .spawn(move || this.run(listener));
            match spawned {
                Ok(handle) => {
                    if let Strategy::DedicatedThread { thread } = &mut lock(&factory.inner).strategy {
                        *thread = Some(handle);
                    }
                }
                Err(err) => {
                    error!(endpoint = %factory.endpoint, ?err, "Cannot create accept thread");
                    let mut inner = lock(&factory.inner);
                    inner.state = ListenerState::Closed;
                    inner.acceptor = None;
                    return Err(err.into());
                }
            }
        }

        info!(endpoint = %factory.endpoint, %local_addr, mode = ?mode, "Listening");
        Ok(factory)
    }
}

// ============================================================================
// Queries
// ============================================================================

impl IncomingConnectionFactory {
    /// The effective endpoint: overrides applied, bound port filled in.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn mode(&self) -> ConcurrencyMode {
        self.mode
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub fn state(&self) -> ListenerState {
        lock(&self.inner).state
    }

    /// Snapshot of the owned connections that are active or holding.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut inner = lock(&self.inner);
        reap_owned(&mut inner.connections);
        inner
            .connections
            .iter()
            .filter(|c| c.is_active_or_holding())
            .cloned()
            .collect()
    }

    /// Sends the queued batch of every live connection. Failures are
    /// logged and skipped.
    pub fn flush_batch_requests(&self) {
        for connection in self.connections() {
            if let Err(err) = connection.flush_batch_requests() {
                debug!(endpoint = %connection.endpoint(), %err, "Batch flush failed");
            }
        }
    }
}

// ============================================================================
// State Machine
// ============================================================================

impl IncomingConnectionFactory {
    /// Starts accepting and activates every owned connection.
    pub fn activate(&self) {
        self.set_state(ListenerState::Active);
    }

    /// Stops accepting and puts every owned connection on hold.
    pub fn hold(&self) {
        self.set_state(ListenerState::Holding);
    }

    /// Closes the listener and destroys every owned connection.
    pub fn destroy(&self) {
        self.set_state(ListenerState::Closed);
    }

    /// Blocks until the listener is no longer active and every owned
    /// connection is holding or further along.
    pub fn wait_until_holding(&self) {
        let connections = {
            let mut inner = lock(&self.inner);
            while inner.state < ListenerState::Holding {
                inner = wait(&self.cond, inner);
            }
            inner.connections.clone()
        };
        for connection in connections {
            connection.wait_until_holding();
        }
    }

    /// Blocks until the listener is closed, its accept thread has exited,
    /// its listening socket is released and every owned connection is
    /// finished.
    pub fn wait_until_finished(&self) {
        let accept_thread = {
            let mut inner = lock(&self.inner);
            while inner.state != ListenerState::Closed {
                inner = wait(&self.cond, inner);
            }
            match &mut inner.strategy {
                Strategy::DedicatedThread { thread } => thread.take(),
                Strategy::EventDriven { .. } => None,
            }
        };
        if let Some(handle) = accept_thread {
            if handle.join().is_err() {
                error!(endpoint = %self.endpoint, "Accept thread panicked");
            }
        }

        let connections = {
            let mut inner = lock(&self.inner);
            while inner.acceptor.is_some() {
                inner = wait(&self.cond, inner);
            }
            inner.connections.clone()
        };
        for connection in &connections {
            connection.wait_until_finished();
        }

        lock(&self.inner).connections.clear();
        debug!(endpoint = %self.endpoint, "Listener finished");
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    fn set_state(&self, state: ListenerState) {
        let mut inner = lock(&self.inner);
        if inner.state == state || inner.state == ListenerState::Closed {
            return;
        }

        let mut unblock_accept = false;
        match state {
            ListenerState::Active => {
                self.register_with_pool(&mut inner);
                for connection in &inner.connections {
                    connection.activate();
                }
            }
            ListenerState::Holding => {
                self.unregister_with_pool(&mut inner);
                for connection in &inner.connections {
                    connection.hold();
                }
            }
            ListenerState::Closed => {
                if matches!(inner.strategy, Strategy::EventDriven { .. }) {
                    // Registering first guarantees a `finished` callback,
                    // which closes the socket once no worker can still be
                    // using it.
                    self.register_with_pool(&mut inner);
                    self.unregister_with_pool(&mut inner);
                    if matches!(inner.strategy, Strategy::EventDriven { finished_count: 0, .. }) {
                        inner.acceptor = None;
                    }
                } else {
                    unblock_accept = true;
                }
                for connection in &inner.connections {
                    connection.destroy(DestroyReason::ObjectAdapterDeactivated);
                }
            }
        }

        debug!(from = ?inner.state, to = ?state, "Listener state change");
        inner.state = state;
        self.cond.notify_all();
        drop(inner);

        // The accept thread sees `Closed` as soon as this connect wakes it.
        if unblock_accept {
            if let Err(err) = connect_to_self(self.local_addr) {
                warn!(endpoint = %self.endpoint, ?err, "Failed to unblock accept thread");
            }
        }
    }

    fn register_with_pool(&self, inner: &mut Inner) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let Inner {
            acceptor, strategy, ..
        } = inner;
        let Strategy::EventDriven { token, .. } = strategy else {
            return;
        };
        if token.is_some() {
            return;
        }
        let Some(Acceptor::Polled { registration, .. }) = acceptor.as_mut() else {
            return;
        };
        match self.thread_pool.register(registration, Interest::READABLE, this) {
            Ok(registered) => *token = Some(registered),
            Err(err) => error!(endpoint = %self.endpoint, ?err, "Failed to register listener"),
        }
    }

    fn unregister_with_pool(&self, inner: &mut Inner) {
        let Inner {
            acceptor, strategy, ..
        } = inner;
        let Strategy::EventDriven {
            token,
            finished_count,
        } = strategy
        else {
            return;
        };
        let Some(registered) = token.take() else {
            return;
        };
        if let Some(Acceptor::Polled { registration, .. }) = acceptor.as_mut() {
            self.thread_pool.unregister(registration, registered);
            *finished_count += 1;
        }
    }

    fn new_connection(&self, inner: &mut Inner, stream: TcpStream) -> Arc<Connection> {
        let connection = Connection::new(
            stream,
            &self.endpoint,
            Some(self.adapter.clone()),
            self.mode,
            true,
            &self.thread_pool,
            &self.settings,
        );
        inner.connections.push(connection.clone());
        connection
    }
}

// ============================================================================
// Dedicated Accept Thread
// ============================================================================

impl IncomingConnectionFactory {
    fn run(&self, listener: Arc<TcpListener>) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        loop {
            let accepted = accept_blocking(&listener);

            let connection = {
                let mut inner = lock(&self.inner);
                while inner.state == ListenerState::Holding {
                    inner = wait(&self.cond, inner);
                }
                if inner.state == ListenerState::Closed {
                    inner.acceptor = None;
                    self.cond.notify_all();
                    trace!(endpoint = %self.endpoint, "Accept thread exiting");
                    return;
                }

                reap_owned(&mut inner.connections);
                match accepted {
                    Ok(stream) => self.new_connection(&mut inner, stream),
                    Err(err) => {
                        self.accept_failed(err);
                        continue;
                    }
                }
            };

            connection.start_async(this.clone());
        }
    }

    fn accept_failed(&self, err: Error) {
        if err.is_transient_accept() {
            trace!(endpoint = %self.endpoint, ?err, "Ignoring transient accept error");
        } else if self.settings.warn_connections {
            warn!(endpoint = %self.endpoint, %err, "Connection accept failed");
        } else {
            debug!(endpoint = %self.endpoint, %err, "Connection accept failed");
        }
    }
}

// ============================================================================
// Event-driven Accepts
// ============================================================================

impl EventHandler for IncomingConnectionFactory {
    fn message(&self, _readiness: Readiness, promotion: &mut Promotion<'_>) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let mut accepted = Vec::new();
        {
            let mut inner = lock(&self.inner);
            if inner.state != ListenerState::Active {
                return;
            }
            reap_owned(&mut inner.connections);

            // Edge-triggered readiness: drain the accept queue.
            loop {
                let result = match inner.acceptor.as_ref() {
                    Some(acceptor) => acceptor.accept_nonblocking(),
                    None => break,
                };
                match result {
                    Ok(Some(stream)) => accepted.push(self.new_connection(&mut inner, stream)),
                    Ok(None) => break,
                    Err(err) if err.is_transient_accept() => {
                        self.accept_failed(err);
                    }
                    Err(err) => {
                        self.accept_failed(err);
                        break;
                    }
                }
            }
        }
        promotion.promote_follower();

        for connection in accepted {
            connection.start_async(this.clone());
        }
    }

    fn finished(&self) {
        let mut inner = lock(&self.inner);
        let Strategy::EventDriven { finished_count, .. } = &mut inner.strategy else {
            return;
        };
        *finished_count -= 1;
        if *finished_count == 0 && inner.state == ListenerState::Closed {
            inner.acceptor = None;
            trace!(endpoint = %self.endpoint, "Listening socket closed");
            self.cond.notify_all();
        }
    }
}

impl StartCallback for IncomingConnectionFactory {
    fn start_completed(&self, connection: &Arc<Connection>) {
        let inner = lock(&self.inner);
        if inner.state == ListenerState::Active {
            connection.activate();
        }
    }

    fn start_failed(&self, connection: &Arc<Connection>, error: Error) {
        let mut inner = lock(&self.inner);
        if self.settings.warn_connections && !matches!(error, Error::AdapterDeactivated) {
            warn!(endpoint = %self.endpoint, peer_addr = ?connection.peer_addr(), %error, "Connection validation failed");
        } else {
            debug!(endpoint = %self.endpoint, peer_addr = ?connection.peer_addr(), %error, "Connection validation failed");
        }
        if connection.is_finished() {
            inner.connections.retain(|c| !Arc::ptr_eq(c, connection));
        }
    }
}

fn reap_owned(connections: &mut Vec<Arc<Connection>>) {
    connections.retain(|connection| !connection.is_finished());
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullAdapter;

    impl Adapter for NullAdapter {
        fn name(&self) -> &str {
            "null"
        }

        fn dispatch(&self, _connection: &Arc<Connection>, _data: Vec<u8>) {}
    }

    fn registration(factory: &IncomingConnectionFactory) -> (Option<Token>, usize) {
        match &lock(&factory.inner).strategy {
            Strategy::EventDriven {
                token,
                finished_count,
            } => (*token, *finished_count),
            Strategy::DedicatedThread { .. } => panic!("not event driven"),
        }
    }

    #[test]
    fn activation_registers_once() {
        let settings = Settings {
            thread_pool_size: 2,
            ..Settings::default()
        };
        let pool = ThreadPool::new(&settings, "listener-test").unwrap();
        let factory = IncomingConnectionFactory::new(
            &Endpoint::tcp("127.0.0.1", 0),
            Arc::new(NullAdapter),
            ConcurrencyMode::Pooled,
            &pool,
            &settings,
        )
        .unwrap();
        assert_eq!(registration(&factory), (None, 0));

        factory.activate();
        let (token, _) = registration(&factory);
        assert!(token.is_some());
        factory.activate();
        assert_eq!(registration(&factory).0, token);

        factory.hold();
        factory.hold();
        let (token, finished_count) = registration(&factory);
        assert!(token.is_none());
        assert!(finished_count <= 1);

        factory.destroy();
        factory.wait_until_finished();
        assert_eq!(registration(&factory), (None, 0));
        assert!(lock(&factory.inner).acceptor.is_none());

        pool.destroy();
        pool.join();
    }

    #[test]
    fn closing_a_never_activated_listener_releases_the_socket() {
        let settings = Settings::default();
        let pool = ThreadPool::new(&settings, "listener-test").unwrap();
        let factory = IncomingConnectionFactory::new(
            &Endpoint::tcp("127.0.0.1", 0),
            Arc::new(NullAdapter),
            ConcurrencyMode::Pooled,
            &pool,
            &settings,
        )
        .unwrap();
        let addr = factory.local_addr();

        factory.destroy();
        factory.wait_until_finished();
        assert!(std::net::TcpStream::connect(addr).is_err());

        pool.destroy();
        pool.join();
    }
}
