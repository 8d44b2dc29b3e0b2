//! A single transport session and its lifecycle.
//!
//! A connection goes through `Validating → {Active, Holding} → Closing →
//! Finished`. It leaves `Validating` in the `Holding` state once the
//! validation handshake succeeds; whoever owns it decides when to
//! activate it. Received bytes are handed to the bound [`Adapter`].

use crate::config::Settings;
use crate::endpoint::{ConcurrencyMode, Endpoint};
use crate::error::{lock, wait, DestroyReason, Error};
use crate::thread_pool::{EventHandler, Promotion, Readiness, ThreadPool};
use crate::transport::{
    read_available, read_validation, shutdown_stream, write_pending, write_validation, ReadResult,
    WriteResult,
};
use mio::{Interest, Token};
use std::fmt;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

/// Server-side handler receiving the bytes that arrive on a connection.
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    /// Called outside any connection lock with the bytes of one read.
    fn dispatch(&self, connection: &Arc<Connection>, data: Vec<u8>);
}

/// Outcome of [`Connection::start_async`].
pub trait StartCallback: Send + Sync {
    fn start_completed(&self, connection: &Arc<Connection>);
    fn start_failed(&self, connection: &Arc<Connection>, error: Error);
}

/// Lifecycle state of a [`Connection`], in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Validating,
    Active,
    Holding,
    Closing,
    Finished,
}

#[derive(Debug, Clone)]
enum CloseCause {
    Destroyed(DestroyReason),
    Lost(String),
}

impl CloseCause {
    fn to_error(&self) -> Error {
        match self {
            CloseCause::Destroyed(reason) => reason.to_error(),
            CloseCause::Lost(reason) => Error::ConnectionClosed {
                reason: reason.clone(),
            },
        }
    }
}

struct Inner {
    state: ConnectionState,
    close_cause: Option<CloseCause>,
    // Kept for shutdown and, in thread-per-connection mode, for writes.
    stream: Option<TcpStream>,
    // Pooled mode only: the registered non-blocking clone of `stream`.
    source: Option<mio::net::TcpStream>,
    token: Option<Token>,
    interest: Interest,
    unregistrations: usize,
    handshake_in_flight: bool,
    reader: Option<JoinHandle<()>>,
    reader_running: bool,
    adapter: Option<Arc<dyn Adapter>>,
    send_buf: Vec<u8>,
    batch: Vec<u8>,
    dispatch_count: usize,
}

/// A transport session carrying remote invocations.
///
/// Always handled through an `Arc`; see [`Connection::new`].
pub struct Connection {
    weak: Weak<Connection>,
    endpoint: Endpoint,
    mode: ConcurrencyMode,
    incoming: bool,
    thread_pool: ThreadPool,
    // Bounds the validation handshake.
    timeout: Duration,
    max_read_size: usize,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("mode", &self.mode)
            .field("incoming", &self.incoming)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Connection {
    /// Wraps an established TCP session.
    ///
    /// `endpoint` is stored with its compression flag cleared: whether
    /// messages are compressed is decided per request, not per connection.
    /// `incoming` selects the side of the validation handshake.
    pub fn new(
        stream: TcpStream,
        endpoint: &Endpoint,
        adapter: Option<Arc<dyn Adapter>>,
        mode: ConcurrencyMode,
        incoming: bool,
        thread_pool: &ThreadPool,
        settings: &Settings,
    ) -> Arc<Self> {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        Arc::new_cyclic(|weak| Connection {
            weak: weak.clone(),
            endpoint: endpoint.with_compress(false),
            mode,
            incoming,
            thread_pool: thread_pool.clone(),
            timeout: settings.timeout_for(endpoint.timeout()),
            max_read_size: settings.max_read_size.max(1),
            local_addr,
            peer_addr,
            inner: Mutex::new(Inner {
                state: ConnectionState::Validating,
                close_cause: None,
                stream: Some(stream),
                source: None,
                token: None,
                interest: Interest::READABLE,
                unregistrations: 0,
                handshake_in_flight: false,
                reader: None,
                reader_running: false,
                adapter,
                send_buf: Vec::new(),
                batch: Vec::new(),
                dispatch_count: 0,
            }),
            cond: Condvar::new(),
        })
    }
}

// ============================================================================
// Queries
// ============================================================================

impl Connection {
    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn is_active_or_holding(&self) -> bool {
        matches!(self.state(), ConnectionState::Active | ConnectionState::Holding)
    }

    pub fn is_finished(&self) -> bool {
        self.state() == ConnectionState::Finished
    }

    /// The connection endpoint; its compression flag is always false.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn mode(&self) -> ConcurrencyMode {
        self.mode
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn adapter(&self) -> Option<Arc<dyn Adapter>> {
        lock(&self.inner).adapter.clone()
    }

    /// Binds the adapter that receives incoming data, or unbinds it.
    ///
    /// Fails once the connection is closing.
    pub fn set_adapter(&self, adapter: Option<Arc<dyn Adapter>>) -> Result<(), Error> {
        let mut inner = lock(&self.inner);
        if inner.state >= ConnectionState::Closing {
            return Err(closed_error(&inner));
        }
        inner.adapter = adapter;
        Ok(())
    }

    /// Blocks until the connection is holding, closing or finished and no
    /// dispatch is running.
    pub fn wait_until_holding(&self) {
        let mut inner = lock(&self.inner);
        while inner.state < ConnectionState::Holding || inner.dispatch_count > 0 {
            inner = wait(&self.cond, inner);
        }
    }

    /// Blocks until the connection is finished and its reader thread, if
    /// any, has exited.
    pub fn wait_until_finished(&self) {
        let reader = {
            let mut inner = lock(&self.inner);
            while inner.state != ConnectionState::Finished {
                inner = wait(&self.cond, inner);
            }
            inner.reader.take()
        };
        if let Some(reader) = reader {
            if reader.thread().id() != thread::current().id() && reader.join().is_err() {
                warn!(endpoint = %self.endpoint, "Connection reader thread panicked");
            }
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

impl Connection {
    /// Runs the validation handshake on the calling thread.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub fn start(&self) -> Result<(), Error> {
        let stream = self.begin_start()?;
        let result = self.handshake(stream);
        self.end_start(result)
    }

    /// Runs the validation handshake in the background and reports to
    /// `callback`.
    ///
    /// Only the accepting side of a pooled connection validates on the
    /// thread pool: its six-byte write fits in a fresh socket buffer. Every
    /// other handshake waits on its peer and gets a thread of its own.
    pub fn start_async(&self, callback: Arc<dyn StartCallback>) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let stream = match self.begin_start() {
            Ok(stream) => stream,
            Err(err) => {
                callback.start_failed(&this, err);
                return;
            }
        };

        let (owner, notify) = (this.clone(), callback.clone());
        let work = move || {
            let result = this.handshake(stream);
            match this.end_start(result) {
                Ok(()) => callback.start_completed(&this),
                Err(err) => callback.start_failed(&this, err),
            }
        };

        if self.mode == ConcurrencyMode::Pooled && self.incoming {
            self.thread_pool.run_later(Box::new(work));
            return;
        }
        let spawned = thread::Builder::new()
            .name("conn-validate".to_string())
            .spawn(work);
        if let Err(err) = spawned {
            self.validation_not_started(&owner, notify.as_ref(), err);
        }
    }

    // The handshake never ran: close the connection and report the failure
    // in its place.
    fn validation_not_started(
        &self,
        this: &Arc<Connection>,
        callback: &dyn StartCallback,
        err: std::io::Error,
    ) {
        warn!(endpoint = %self.endpoint, ?err, "Cannot create validation thread");
        {
            let mut inner = lock(&self.inner);
            inner.handshake_in_flight = false;
            if inner.state < ConnectionState::Closing {
                inner.close_cause = Some(CloseCause::Lost(format!("cannot create thread: {err}")));
                self.set_closing(&mut inner);
            }
            self.try_finish(&mut inner);
        }
        callback.start_failed(this, err.into());
    }

    fn begin_start(&self) -> Result<TcpStream, Error> {
        let mut inner = lock(&self.inner);
        if inner.state >= ConnectionState::Closing {
            return Err(closed_error(&inner));
        }
        let stream = inner
            .stream
            .as_ref()
            .ok_or_else(|| closed_error(&inner))?
            .try_clone()?;
        inner.handshake_in_flight = true;
        Ok(stream)
    }

    fn handshake(&self, mut stream: TcpStream) -> Result<(), Error> {
        let timeout = Some(self.timeout);
        if self.incoming {
            write_validation(&mut stream, timeout)
        } else {
            read_validation(&mut stream, timeout)
        }
    }

    fn end_start(&self, result: Result<(), Error>) -> Result<(), Error> {
        let mut inner = lock(&self.inner);
        inner.handshake_in_flight = false;

        if inner.state >= ConnectionState::Closing {
            // Destroyed while validating; the destroy cause wins.
            let err = closed_error(&inner);
            self.try_finish(&mut inner);
            return Err(err);
        }

        if let Err(err) = result {
            debug!(endpoint = %self.endpoint, ?err, "Connection validation failed");
            inner.close_cause = Some(CloseCause::Lost(err.to_string()));
            self.set_closing(&mut inner);
            self.try_finish(&mut inner);
            return Err(err);
        }

        if let Err(err) = self.setup_io(&mut inner) {
            inner.close_cause = Some(CloseCause::Lost(err.to_string()));
            self.set_closing(&mut inner);
            self.try_finish(&mut inner);
            return Err(err);
        }

        inner.state = ConnectionState::Holding;
        info!(
            endpoint = %self.endpoint,
            local_addr = ?self.local_addr,
            peer_addr = ?self.peer_addr,
            incoming = self.incoming,
            "Connection validated"
        );
        self.cond.notify_all();
        Ok(())
    }

    fn setup_io(&self, inner: &mut Inner) -> Result<(), Error> {
        let Some(stream) = inner.stream.as_ref() else {
            return Err(closed_error(inner));
        };
        match self.mode {
            ConcurrencyMode::Pooled => {
                let source = stream.try_clone()?;
                source.set_nonblocking(true)?;
                inner.source = Some(mio::net::TcpStream::from_std(source));
            }
            ConcurrencyMode::ThreadPerConnection => {
                let reader = stream.try_clone()?;
                let Some(this) = self.weak.upgrade() else {
                    return Err(closed_error(inner));
                };
                let handle = thread::Builder::new()
                    .name("conn-reader".to_string())
                    .spawn(move || this.run_reader(reader))?;
                inner.reader = Some(handle);
                inner.reader_running = true;
            }
        }
        Ok(())
    }
}

// ============================================================================
// State Changes
// ============================================================================

impl Connection {
    /// Starts dispatching incoming data. Only a holding connection can be
    /// activated.
    pub fn activate(&self) {
        let mut inner = lock(&self.inner);
        if inner.state != ConnectionState::Holding {
            return;
        }
        inner.state = ConnectionState::Active;
        trace!(endpoint = %self.endpoint, "Connection activated");

        match self.mode {
            ConcurrencyMode::Pooled => self.register(&mut inner),
            ConcurrencyMode::ThreadPerConnection => self.flush_direct(&mut inner),
        }
        self.cond.notify_all();
    }

    /// Stops dispatching incoming data. Only an active connection can be
    /// put on hold.
    pub fn hold(&self) {
        let mut inner = lock(&self.inner);
        if inner.state != ConnectionState::Active {
            return;
        }
        inner.state = ConnectionState::Holding;
        trace!(endpoint = %self.endpoint, "Connection on hold");

        if self.mode == ConcurrencyMode::Pooled {
            self.unregister(&mut inner);
        }
        self.cond.notify_all();
    }

    /// Closes the connection. It reaches `Finished` once its I/O has
    /// stopped.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub fn destroy(&self, reason: DestroyReason) {
        self.destroy_with(CloseCause::Destroyed(reason));
    }

    fn destroy_with(&self, cause: CloseCause) {
        let mut inner = lock(&self.inner);
        if inner.state >= ConnectionState::Closing {
            return;
        }
        debug!(endpoint = %self.endpoint, ?cause, "Closing connection");
        inner.close_cause = Some(cause);
        self.set_closing(&mut inner);
        self.try_finish(&mut inner);
    }

    fn set_closing(&self, inner: &mut Inner) {
        inner.state = ConnectionState::Closing;
        if let Some(stream) = inner.stream.as_ref() {
            shutdown_stream(stream);
        }
        if inner.token.is_some() {
            self.unregister(inner);
        }
        self.cond.notify_all();
    }

    fn try_finish(&self, inner: &mut Inner) {
        if inner.state != ConnectionState::Closing
            || inner.handshake_in_flight
            || inner.reader_running
            || inner.token.is_some()
            || inner.unregistrations > 0
        {
            return;
        }
        inner.state = ConnectionState::Finished;
        inner.source = None;
        inner.stream = None;
        inner.send_buf.clear();
        info!(
            endpoint = %self.endpoint,
            local_addr = ?self.local_addr,
            peer_addr = ?self.peer_addr,
            "Connection finished"
        );
        self.cond.notify_all();
    }

    fn register(&self, inner: &mut Inner) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let interest = if inner.send_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        let Some(source) = inner.source.as_mut() else {
            return;
        };
        match self.thread_pool.register(source, interest, this) {
            Ok(token) => {
                inner.token = Some(token);
                inner.interest = interest;
            }
            Err(err) => {
                warn!(endpoint = %self.endpoint, ?err, "Failed to register connection");
                inner.close_cause = Some(CloseCause::Lost(err.to_string()));
                self.set_closing(inner);
                self.try_finish(inner);
            }
        }
    }

    fn unregister(&self, inner: &mut Inner) {
        let Some(token) = inner.token.take() else {
            return;
        };
        if let Some(source) = inner.source.as_mut() {
            self.thread_pool.unregister(source, token);
            inner.unregistrations += 1;
        }
    }
}

// ============================================================================
// Data Operations
// ============================================================================

impl Connection {
    /// Queues `data` for sending.
    ///
    /// Data sent before activation goes out once the connection is active.
    pub fn send(&self, data: &[u8]) -> Result<(), Error> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        if inner.state >= ConnectionState::Closing {
            return Err(closed_error(inner));
        }
        inner.send_buf.extend_from_slice(data);

        match self.mode {
            ConcurrencyMode::ThreadPerConnection => {
                if matches!(inner.state, ConnectionState::Active | ConnectionState::Holding) {
                    self.flush_direct(inner);
                }
            }
            ConcurrencyMode::Pooled => {
                if let (Some(token), Some(source)) = (inner.token, inner.source.as_mut()) {
                    let interest = Interest::READABLE | Interest::WRITABLE;
                    if inner.interest != interest {
                        self.thread_pool.reregister(source, token, interest)?;
                        inner.interest = interest;
                    }
                }
            }
        }

        if inner.state >= ConnectionState::Closing {
            return Err(closed_error(inner));
        }
        Ok(())
    }

    /// Adds `data` to the batch sent by [`Self::flush_batch_requests`].
    pub fn queue_batch(&self, data: &[u8]) -> Result<(), Error> {
        let mut inner = lock(&self.inner);
        if inner.state >= ConnectionState::Closing {
            return Err(closed_error(&inner));
        }
        inner.batch.extend_from_slice(data);
        Ok(())
    }

    /// Sends everything queued with [`Self::queue_batch`].
    pub fn flush_batch_requests(&self) -> Result<(), Error> {
        let batch = std::mem::take(&mut lock(&self.inner).batch);
        if batch.is_empty() {
            return Ok(());
        }
        self.send(&batch)
    }

    // Blocking write for thread-per-connection mode.
    fn flush_direct(&self, inner: &mut Inner) {
        if inner.send_buf.is_empty() {
            return;
        }
        let Some(stream) = inner.stream.as_mut() else {
            return;
        };
        match stream.write_all(&inner.send_buf) {
            Ok(()) => {
                trace!(len = inner.send_buf.len(), "Wrote to socket");
                inner.send_buf.clear();
            }
            Err(err) => {
                warn!(endpoint = %self.endpoint, ?err, "Error writing to socket");
                inner.close_cause = Some(CloseCause::Lost(err.to_string()));
                self.set_closing(inner);
                self.try_finish(inner);
            }
        }
    }

    fn dispatch(&self, inner: MutexGuard<'_, Inner>, data: Vec<u8>) {
        let mut inner = inner;
        let adapter = inner.adapter.clone();
        let Some(adapter) = adapter else {
            debug!(endpoint = %self.endpoint, len = data.len(), "No adapter, dropping data");
            return;
        };
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        inner.dispatch_count += 1;
        drop(inner);

        adapter.dispatch(&this, data);

        let mut inner = lock(&self.inner);
        inner.dispatch_count -= 1;
        if inner.dispatch_count == 0 {
            self.cond.notify_all();
        }
    }
}

// ============================================================================
// Thread-per-connection Reader
// ============================================================================

impl Connection {
    fn run_reader(&self, mut reader: TcpStream) {
        let mut buf = vec![0u8; self.max_read_size];
        loop {
            let result = reader.read(&mut buf);

            let mut inner = lock(&self.inner);
            while inner.state == ConnectionState::Holding {
                inner = wait(&self.cond, inner);
            }
            if inner.state >= ConnectionState::Closing {
                break;
            }
            match result {
                Ok(0) => {
                    info!(endpoint = %self.endpoint, "Connection closed by peer");
                    inner.close_cause = Some(CloseCause::Lost("closed by peer".to_string()));
                    self.set_closing(&mut inner);
                    break;
                }
                Ok(sz) => {
                    trace!(len = sz, "Read data from socket");
                    self.dispatch(inner, buf[..sz].to_vec());
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(endpoint = %self.endpoint, ?err, "Error reading from socket");
                    inner.close_cause = Some(CloseCause::Lost(err.to_string()));
                    self.set_closing(&mut inner);
                    break;
                }
            }
        }

        let mut inner = lock(&self.inner);
        inner.reader_running = false;
        self.try_finish(&mut inner);
    }
}

// ============================================================================
// Pooled I/O
// ============================================================================

impl EventHandler for Connection {
    fn message(&self, readiness: Readiness, promotion: &mut Promotion<'_>) {
        let mut inner = lock(&self.inner);
        let Some(token) = inner.token else {
            promotion.promote_follower();
            return;
        };

        let mut received = Vec::new();
        let mut disconnected = false;
        {
            let Inner {
                source, send_buf, ..
            } = &mut *inner;
            let Some(source) = source.as_mut() else {
                promotion.promote_follower();
                return;
            };

            if readiness.writable && !send_buf.is_empty() {
                if let WriteResult::Disconnected = write_pending(source, send_buf) {
                    disconnected = true;
                }
            }
            if readiness.readable && !disconnected {
                match read_available(source, self.max_read_size) {
                    ReadResult::Ok(data) => received = data,
                    ReadResult::Disconnected(data) => {
                        received = data;
                        disconnected = true;
                    }
                }
            }
        }

        if disconnected {
            info!(endpoint = %self.endpoint, "Connection closed by peer");
            inner.close_cause = Some(CloseCause::Lost("closed by peer".to_string()));
            self.set_closing(&mut inner);
        } else {
            let interest = if inner.send_buf.is_empty() {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };
            if interest != inner.interest {
                if let Some(source) = inner.source.as_mut() {
                    match self.thread_pool.reregister(source, token, interest) {
                        Ok(()) => inner.interest = interest,
                        Err(err) => warn!(endpoint = %self.endpoint, ?err, "Failed to reregister connection"),
                    }
                }
            }
        }
        promotion.promote_follower();

        if !received.is_empty() {
            self.dispatch(inner, received);
        }
    }

    fn finished(&self) {
        let mut inner = lock(&self.inner);
        inner.unregistrations -= 1;
        self.try_finish(&mut inner);
    }
}

fn closed_error(inner: &Inner) -> Error {
    match &inner.close_cause {
        Some(cause) => cause.to_error(),
        None => Error::ConnectionClosed {
            reason: "connection closed".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    #[derive(Default)]
    struct Outcome(Mutex<Vec<Result<(), String>>>);

    impl StartCallback for Outcome {
        fn start_completed(&self, _connection: &Arc<Connection>) {
            lock(&self.0).push(Ok(()));
        }

        fn start_failed(&self, _connection: &Arc<Connection>, error: Error) {
            lock(&self.0).push(Err(error.to_string()));
        }
    }

    // A client-side connection and the accepted peer socket, which never
    // sends the validation frame.
    fn client_connection(pool: &ThreadPool, settings: &Settings) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let (peer, _) = listener.accept().unwrap();
        let connection = Connection::new(
            stream,
            &Endpoint::tcp("127.0.0.1", addr.port()),
            None,
            ConcurrencyMode::ThreadPerConnection,
            false,
            pool,
            settings,
        );
        (connection, peer)
    }

    #[test]
    fn validation_that_cannot_start_is_reported() {
        let settings = Settings::default();
        let pool = ThreadPool::new(&settings, "conn-test").unwrap();
        let (connection, _peer) = client_connection(&pool, &settings);
        let outcome = Outcome::default();

        connection.begin_start().unwrap();
        let err = std::io::Error::new(std::io::ErrorKind::OutOfMemory, "no threads left");
        connection.validation_not_started(&connection, &outcome, err);

        assert!(connection.is_finished());
        let reported = lock(&outcome.0).clone();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].is_err());
        pool.destroy();
        pool.join();
    }

    #[test]
    fn silent_peer_fails_validation_after_the_default_timeout() {
        let settings = Settings {
            default_timeout: Duration::from_millis(200),
            ..Settings::default()
        };
        let pool = ThreadPool::new(&settings, "conn-test").unwrap();
        let (connection, _peer) = client_connection(&pool, &settings);

        let started = Instant::now();
        let err = connection.start().unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(connection.is_finished());
        pool.destroy();
        pool.join();
    }
}
