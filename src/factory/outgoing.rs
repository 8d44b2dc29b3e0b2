//! The outgoing connection pool.

use super::{build_candidates, reap, same_adapter, Candidate};
use crate::config::Settings;
use crate::connection::{Adapter, Connection, StartCallback};
use crate::endpoint::{ConcurrencyMode, Connector, Endpoint, EndpointSelection, Resolver};
use crate::error::{lock, wait, DestroyReason, Error};
use crate::route::{PendingSet, RouteKey};
use crate::thread_pool::ThreadPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use tracing::{debug, info, instrument, trace, warn};

/// Receives the outcome of [`OutgoingConnectionFactory::get_connection_async`].
///
/// Exactly one of the two methods is called, exactly once.
pub trait ConnectionCallback: Send + Sync {
    fn set_connection(&self, connection: Arc<Connection>, compress: bool);
    fn set_error(&self, error: Error);
}

impl<F> ConnectionCallback for F
where
    F: Fn(Result<(Arc<Connection>, bool), Error>) + Send + Sync,
{
    fn set_connection(&self, connection: Arc<Connection>, compress: bool) {
        self(Ok((connection, compress)))
    }

    fn set_error(&self, error: Error) {
        self(Err(error))
    }
}

enum Lookup {
    Found(Arc<Connection>, bool),
    Claimed,
    Waiting,
    // The attempt is already past this point; a stale wakeup.
    Ignored,
}

struct Inner {
    destroyed: bool,
    connections: HashMap<RouteKey, Vec<Arc<Connection>>>,
    // Keyed by the connection endpoint, whose compression flag is always
    // cleared.
    connections_by_endpoint: HashMap<Endpoint, Vec<Arc<Connection>>>,
    pending: PendingSet<Arc<ConnectAttempt>>,
    pending_endpoints: Vec<Endpoint>,
}

/// Deduplicating cache of client-side connections.
///
/// At most one connection attempt is in flight per [`RouteKey`]; callers
/// asking for a route while an attempt is in progress wait for its outcome
/// instead of starting their own.
pub struct OutgoingConnectionFactory {
    settings: Settings,
    thread_pool: ThreadPool,
    resolver: Arc<dyn Resolver>,
    next_attempt_id: AtomicU64,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl std::fmt::Debug for OutgoingConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("OutgoingConnectionFactory")
            .field("destroyed", &inner.destroyed)
            .field("routes", &inner.connections.len())
            .finish()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl OutgoingConnectionFactory {
    /// Creates a factory whose pooled connections are driven by
    /// `thread_pool` and whose endpoints are resolved by `resolver`.
    pub fn new(settings: &Settings, thread_pool: &ThreadPool, resolver: Arc<dyn Resolver>) -> Arc<Self> {
        Arc::new(Self {
            settings: settings.clone(),
            thread_pool: thread_pool.clone(),
            resolver,
            next_attempt_id: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                destroyed: false,
                connections: HashMap::new(),
                connections_by_endpoint: HashMap::new(),
                pending: PendingSet::new(),
                pending_endpoints: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }
}

// ============================================================================
// Getting Connections
// ============================================================================

impl OutgoingConnectionFactory {
    /// Returns a usable connection to one of `endpoints`, and whether
    /// requests on it should be compressed.
    ///
    /// Blocks until a connection exists or every route has failed, in which
    /// case the last failure is returned. `has_more` tells the retry trace
    /// whether the caller has further endpoints to fall back on.
    #[instrument(skip(self, endpoints), fields(endpoints = endpoints.len()))]
    pub fn get_connection(
        &self,
        endpoints: &[Endpoint],
        has_more: bool,
        mode: ConcurrencyMode,
        selection: EndpointSelection,
    ) -> Result<(Arc<Connection>, bool), Error> {
        let endpoints = self.prepare(endpoints, mode)?;
        if let Some(found) = self.find_by_endpoint(&endpoints, mode)? {
            return Ok(found);
        }

        let mut resolved = Vec::new();
        let mut last_error = None;
        for (index, endpoint) in endpoints.iter().enumerate() {
            match self.resolver.resolve(endpoint) {
                Ok(connectors) => resolved.push((endpoint.clone(), connectors)),
                Err(err) => {
                    self.trace_resolve_failure(endpoint, &err, has_more || index + 1 < endpoints.len());
                    last_error = Some(err);
                }
            }
        }
        let candidates = build_candidates(resolved, mode, selection);
        if candidates.is_empty() {
            return Err(last_error.unwrap_or_else(|| no_route(&endpoints)));
        }

        {
            let mut inner = lock(&self.inner);
            loop {
                match self.lookup(&mut inner, &candidates, None)? {
                    Lookup::Found(connection, compress) => return Ok((connection, compress)),
                    Lookup::Claimed => break,
                    Lookup::Waiting | Lookup::Ignored => inner = wait(&self.cond, inner),
                }
            }
        }

        let mut established = None;
        for (index, candidate) in candidates.iter().enumerate() {
            let result = self.create_connection(candidate, mode).and_then(|connection| {
                match connection.start() {
                    Ok(()) => Ok(connection),
                    Err(err) => {
                        self.evict_if_finished(&candidate.key, &connection);
                        Err(err)
                    }
                }
            });
            match result {
                Ok(connection) => {
                    let compress = self.settings.compress_for(candidate.endpoint.compress());
                    established = Some((connection, compress));
                    break;
                }
                Err(err) => {
                    let destroyed = matches!(err, Error::FactoryDestroyed);
                    self.trace_connect_failure(
                        candidate.key.connector(),
                        &err,
                        has_more || index + 1 < candidates.len(),
                    );
                    last_error = Some(err);
                    if destroyed {
                        break;
                    }
                }
            }
        }

        let destroyed = self.finish_get_connection(&candidates, established.as_ref().map(|(c, _)| c));
        match established {
            Some(_) if destroyed => Err(Error::FactoryDestroyed),
            Some(established) => Ok(established),
            None => Err(last_error.unwrap_or_else(|| no_route(&endpoints))),
        }
    }

    /// Non-blocking [`Self::get_connection`]; the outcome is delivered to
    /// `callback`.
    ///
    /// Connect calls and the validation handshake run on short-lived
    /// threads, never on thread pool workers. Routes already being attempted
    /// by someone else are waited for without blocking any thread.
    #[instrument(skip(self, endpoints, callback), fields(endpoints = endpoints.len()))]
    pub fn get_connection_async(
        self: &Arc<Self>,
        endpoints: &[Endpoint],
        has_more: bool,
        mode: ConcurrencyMode,
        selection: EndpointSelection,
        callback: Arc<dyn ConnectionCallback>,
    ) {
        let endpoints = match self.prepare(endpoints, mode) {
            Ok(endpoints) => endpoints,
            Err(err) => return callback.set_error(err),
        };
        match self.find_by_endpoint(&endpoints, mode) {
            Ok(Some((connection, compress))) => return callback.set_connection(connection, compress),
            Ok(None) => {}
            Err(err) => return callback.set_error(err),
        }

        {
            let mut inner = lock(&self.inner);
            if inner.destroyed {
                drop(inner);
                return callback.set_error(Error::FactoryDestroyed);
            }
            inner.pending_endpoints.extend(endpoints.iter().cloned());
        }

        let attempt = Arc::new_cyclic(|weak| ConnectAttempt {
            id: self.next_attempt_id.fetch_add(1, Ordering::Relaxed),
            weak: weak.clone(),
            factory: self.clone(),
            endpoints,
            has_more,
            mode,
            selection,
            callback: Mutex::new(Some(callback)),
            state: Mutex::new(AttemptState {
                phase: Phase::Resolving,
                resolved: Vec::new(),
                next_endpoint: 0,
                candidates: Vec::new(),
                next_candidate: 0,
                current: None,
                last_error: None,
            }),
        });
        attempt.next_endpoint();
    }

    fn prepare(&self, endpoints: &[Endpoint], mode: ConcurrencyMode) -> Result<Vec<Endpoint>, Error> {
        if lock(&self.inner).destroyed {
            return Err(Error::FactoryDestroyed);
        }
        if let Some(endpoint) = endpoints.iter().find(|e| !e.supports_mode(mode)) {
            return Err(Error::FeatureNotSupported {
                feature: format!("{mode:?} concurrency for endpoint `{endpoint}`"),
            });
        }
        Ok(endpoints.iter().map(|e| self.apply_overrides(e)).collect())
    }

    fn apply_overrides(&self, endpoint: &Endpoint) -> Endpoint {
        match self.settings.override_timeout {
            Some(timeout) => endpoint.with_timeout(Some(timeout)),
            None => endpoint.clone(),
        }
    }

    fn find_by_endpoint(
        &self,
        endpoints: &[Endpoint],
        mode: ConcurrencyMode,
    ) -> Result<Option<(Arc<Connection>, bool)>, Error> {
        let inner = lock(&self.inner);
        if inner.destroyed {
            return Err(Error::FactoryDestroyed);
        }
        for endpoint in endpoints {
            let Some(connections) = inner.connections_by_endpoint.get(&endpoint.with_compress(false)) else {
                continue;
            };
            if let Some(connection) = connections
                .iter()
                .find(|c| c.mode() == mode && c.is_active_or_holding())
            {
                trace!(%endpoint, "Reusing connection found by endpoint");
                return Ok(Some((connection.clone(), self.settings.compress_for(endpoint.compress()))));
            }
        }
        Ok(None)
    }

    // Reaps, then either returns a cached connection, reports that another
    // attempt owns one of the routes, or claims every route.
    fn lookup(
        &self,
        inner: &mut Inner,
        candidates: &[Candidate],
        attempt: Option<&Arc<ConnectAttempt>>,
    ) -> Result<Lookup, Error> {
        if let Some(attempt) = attempt {
            let mut state = lock(&attempt.state);
            if state.phase != Phase::Waiting {
                return Ok(Lookup::Ignored);
            }
            if inner.destroyed {
                state.phase = Phase::Done;
            }
        }
        if inner.destroyed {
            return Err(Error::FactoryDestroyed);
        }

        reap(&mut inner.connections);
        reap(&mut inner.connections_by_endpoint);

        for candidate in candidates {
            let Some(connections) = inner.connections.get(&candidate.key) else {
                continue;
            };
            if let Some(connection) = connections.iter().find(|c| c.is_active_or_holding()) {
                let connection = connection.clone();
                if let Some(attempt) = attempt {
                    for candidate in candidates {
                        inner.pending.leave(&candidate.key, attempt.id);
                    }
                    lock(&attempt.state).phase = Phase::Done;
                }
                trace!(connector = %candidate.key.connector(), "Reusing cached connection");
                let compress = self.settings.compress_for(candidate.endpoint.compress());
                return Ok(Lookup::Found(connection, compress));
            }
        }

        if candidates.iter().any(|c| inner.pending.contains(&c.key)) {
            if let Some(attempt) = attempt {
                for candidate in candidates {
                    inner.pending.join(&candidate.key, attempt.id, attempt);
                }
            }
            trace!("Waiting for a pending connection attempt");
            return Ok(Lookup::Waiting);
        }

        inner.pending.claim(candidates.iter().map(|c| &c.key));
        if let Some(attempt) = attempt {
            lock(&attempt.state).phase = Phase::Connecting;
        }
        Ok(Lookup::Claimed)
    }

    // Opens the TCP session and registers the connection before its
    // handshake starts, so destroy() can always reach it.
    fn create_connection(&self, candidate: &Candidate, mode: ConcurrencyMode) -> Result<Arc<Connection>, Error> {
        let timeout = self
            .settings
            .timeout_for(self.settings.override_connect_timeout.or(candidate.endpoint.timeout()));
        let stream = candidate.key.connector().connect(Some(timeout))?;

        let mut inner = lock(&self.inner);
        if inner.destroyed {
            return Err(Error::FactoryDestroyed);
        }
        let connection = Connection::new(
            stream,
            &candidate.endpoint,
            None,
            mode,
            false,
            &self.thread_pool,
            &self.settings,
        );
        inner
            .connections
            .entry(candidate.key.clone())
            .or_default()
            .push(connection.clone());
        inner
            .connections_by_endpoint
            .entry(connection.endpoint().clone())
            .or_default()
            .push(connection.clone());
        debug!(connector = %candidate.key.connector(), "Created outgoing connection");
        Ok(connection)
    }

    fn evict_if_finished(&self, key: &RouteKey, connection: &Arc<Connection>) {
        if !connection.is_finished() {
            return;
        }
        let mut inner = lock(&self.inner);
        evict_entry(&mut inner.connections, key, connection);
        evict_entry(&mut inner.connections_by_endpoint, connection.endpoint(), connection);
    }

    // Ends the attempt: releases the claimed routes and activates the new
    // connection unless the factory was destroyed meanwhile. Returns
    // whether it was.
    fn finish_get_connection(&self, candidates: &[Candidate], connection: Option<&Arc<Connection>>) -> bool {
        let (waiters, destroyed) = {
            let mut inner = lock(&self.inner);
            let waiters = inner.pending.release(candidates.iter().map(|c| &c.key));
            self.cond.notify_all();
            if let Some(connection) = connection {
                if !inner.destroyed {
                    connection.activate();
                }
            }
            (waiters, inner.destroyed)
        };
        for waiter in waiters {
            waiter.retry();
        }
        destroyed
    }

    fn remove_pending_endpoints(&self, endpoints: &[Endpoint]) {
        let mut inner = lock(&self.inner);
        for endpoint in endpoints {
            if let Some(pos) = inner.pending_endpoints.iter().position(|e| e == endpoint) {
                inner.pending_endpoints.swap_remove(pos);
            }
        }
        if inner.pending_endpoints.is_empty() {
            self.cond.notify_all();
        }
    }
}

// ============================================================================
// Retry Tracing
// ============================================================================

impl OutgoingConnectionFactory {
    fn trace_connect_failure(&self, connector: &Connector, err: &Error, more: bool) {
        match (self.settings.trace_retry >= 2, more) {
            (true, true) => debug!(%connector, %err, "connection to endpoint failed, trying next endpoint"),
            (true, false) => debug!(%connector, %err, "connection to endpoint failed and no more endpoints to try"),
            (false, _) => trace!(%connector, %err, more, "connection to endpoint failed"),
        }
    }

    fn trace_resolve_failure(&self, endpoint: &Endpoint, err: &Error, more: bool) {
        match (self.settings.trace_retry >= 2, more) {
            (true, true) => debug!(%endpoint, %err, "couldn't resolve endpoint host, trying next endpoint"),
            (true, false) => debug!(%endpoint, %err, "couldn't resolve endpoint host and no more endpoints to try"),
            (false, _) => trace!(%endpoint, %err, more, "couldn't resolve endpoint host"),
        }
    }
}

// ============================================================================
// Lifecycle and Bulk Operations
// ============================================================================

impl OutgoingConnectionFactory {
    /// Destroys every connection and makes later requests fail with
    /// [`Error::FactoryDestroyed`].
    #[instrument(skip(self))]
    pub fn destroy(&self) {
        let mut inner = lock(&self.inner);
        if inner.destroyed {
            return;
        }
        inner.destroyed = true;
        let count: usize = inner.connections.values().map(Vec::len).sum();
        info!(connections = count, "Destroying outgoing connection factory");
        for connection in inner.connections.values().flatten() {
            connection.destroy(DestroyReason::CommunicatorDestroyed);
        }
        self.cond.notify_all();
    }

    /// Blocks until [`Self::destroy`] has been called, no attempt or
    /// resolution is in flight and every connection is finished.
    pub fn wait_until_finished(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut inner = lock(&self.inner);
            while !inner.destroyed || !inner.pending.is_empty() || !inner.pending_endpoints.is_empty() {
                inner = wait(&self.cond, inner);
            }
            inner.connections.values().flatten().cloned().collect()
        };

        for connection in &connections {
            connection.wait_until_finished();
        }

        let mut inner = lock(&self.inner);
        inner.connections.clear();
        inner.connections_by_endpoint.clear();
        debug!("Outgoing connection factory finished");
    }

    /// Binds `adapter` to the connections made for `router_endpoints`, so
    /// requests arriving over them reach it.
    ///
    /// The endpoints get the same timeout override as connection requests
    /// and their compression flag is ignored. Connections that are already
    /// closing are skipped.
    pub fn rebind_adapter(
        &self,
        router_endpoints: &[Endpoint],
        adapter: Option<Arc<dyn Adapter>>,
    ) -> Result<(), Error> {
        let connections: Vec<Arc<Connection>> = {
            let inner = lock(&self.inner);
            if inner.destroyed {
                return Err(Error::FactoryDestroyed);
            }
            router_endpoints
                .iter()
                .map(|e| self.apply_overrides(e).with_compress(false))
                .filter_map(|e| inner.connections_by_endpoint.get(&e))
                .flatten()
                .cloned()
                .collect()
        };

        for connection in connections {
            if let Err(err) = connection.set_adapter(adapter.clone()) {
                debug!(endpoint = %connection.endpoint(), %err, "Skipping closed connection");
            }
        }
        Ok(())
    }

    /// Unbinds `adapter` from every connection it is bound to.
    pub fn remove_adapter(&self, adapter: &Arc<dyn Adapter>) {
        let connections: Vec<Arc<Connection>> = {
            let inner = lock(&self.inner);
            if inner.destroyed {
                return;
            }
            inner.connections.values().flatten().cloned().collect()
        };

        for connection in connections {
            let bound = connection.adapter();
            if bound.is_some_and(|bound| same_adapter(&bound, adapter)) {
                if let Err(err) = connection.set_adapter(None) {
                    debug!(endpoint = %connection.endpoint(), %err, "Skipping closed connection");
                }
            }
        }
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

    /// Snapshot of the connections that are active or holding.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let inner = lock(&self.inner);
        inner
            .connections
            .values()
            .flatten()
            .filter(|c| c.is_active_or_holding())
            .cloned()
            .collect()
    }
}

fn evict_entry<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, Vec<Arc<Connection>>>,
    key: &K,
    connection: &Arc<Connection>,
) {
    if let Some(connections) = map.get_mut(key) {
        connections.retain(|c| !Arc::ptr_eq(c, connection));
        if connections.is_empty() {
            map.remove(key);
        }
    }
}

fn no_route(endpoints: &[Endpoint]) -> Error {
    let endpoint = endpoints
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(":");
    Error::Resolution {
        endpoint,
        reason: "no connectors".to_string(),
    }
}

// ============================================================================
// Asynchronous Attempts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolving,
    Waiting,
    Connecting,
    Done,
}

struct AttemptState {
    phase: Phase,
    resolved: Vec<(Endpoint, Vec<Connector>)>,
    next_endpoint: usize,
    candidates: Vec<Candidate>,
    next_candidate: usize,
    // Connection being validated and its compression flag.
    current: Option<(Arc<Connection>, bool)>,
    last_error: Option<Error>,
}

/// One asynchronous connection request, driven step by step by resolver
/// callbacks, pool work items, start callbacks and wakeups from other
/// attempts.
struct ConnectAttempt {
    id: u64,
    weak: Weak<ConnectAttempt>,
    factory: Arc<OutgoingConnectionFactory>,
    endpoints: Vec<Endpoint>,
    has_more: bool,
    mode: ConcurrencyMode,
    selection: EndpointSelection,
    callback: Mutex<Option<Arc<dyn ConnectionCallback>>>,
    state: Mutex<AttemptState>,
}

impl ConnectAttempt {
    fn next_endpoint(&self) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let endpoint = {
            let mut state = lock(&self.state);
            let endpoint = self.endpoints.get(state.next_endpoint).cloned();
            state.next_endpoint += 1;
            endpoint
        };
        match endpoint {
            Some(endpoint) => {
                let resolving = endpoint.clone();
                self.factory
                    .resolver
                    .resolve_async(&resolving, Box::new(move |result| this.resolved(endpoint, result)));
            }
            None => self.resolution_done(),
        }
    }

    fn resolved(&self, endpoint: Endpoint, result: Result<Vec<Connector>, Error>) {
        {
            let mut state = lock(&self.state);
            match result {
                Ok(connectors) => state.resolved.push((endpoint, connectors)),
                Err(err) => {
                    let more = self.has_more || state.next_endpoint < self.endpoints.len();
                    self.factory.trace_resolve_failure(&endpoint, &err, more);
                    state.last_error = Some(err);
                }
            }
        }
        self.next_endpoint();
    }

    fn resolution_done(&self) {
        self.factory.remove_pending_endpoints(&self.endpoints);
        let failure = {
            let mut state = lock(&self.state);
            let resolved = std::mem::take(&mut state.resolved);
            state.candidates = build_candidates(resolved, self.mode, self.selection);
            if state.candidates.is_empty() {
                state.phase = Phase::Done;
                Some(state.last_error.take().unwrap_or_else(|| no_route(&self.endpoints)))
            } else {
                state.phase = Phase::Waiting;
                None
            }
        };
        match failure {
            Some(err) => self.set_error(err),
            None => self.retry(),
        }
    }

    // Entry point for the first lookup and for wakeups after another
    // attempt on one of our routes finished.
    fn retry(&self) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let candidates = lock(&self.state).candidates.clone();
        let lookup = {
            let mut inner = lock(&self.factory.inner);
            self.factory.lookup(&mut inner, &candidates, Some(&this))
        };
        match lookup {
            Ok(Lookup::Found(connection, compress)) => self.set_connection(connection, compress),
            Ok(Lookup::Claimed) => self.next_connector(),
            Ok(Lookup::Waiting | Lookup::Ignored) => {}
            Err(err) => self.set_error(err),
        }
    }

    // Connecting blocks until the peer answers or the timeout expires, so
    // it runs on its own thread, never on a pool worker.
    fn next_connector(&self) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let spawned = thread::Builder::new()
            .name("conn-connect".to_string())
            .spawn(move || this.try_connect());
        if let Err(err) = spawned {
            warn!(?err, "Cannot create connect thread");
            self.connect_failed(err.into());
        }
    }

    fn try_connect(&self) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let candidate = {
            let state = lock(&self.state);
            state.candidates.get(state.next_candidate).cloned()
        };
        let Some(candidate) = candidate else {
            return self.finish(None);
        };

        match self.factory.create_connection(&candidate, self.mode) {
            Ok(connection) => {
                let compress = self.factory.settings.compress_for(candidate.endpoint.compress());
                lock(&self.state).current = Some((connection.clone(), compress));
                connection.start_async(this);
            }
            Err(err) => self.connect_failed(err),
        }
    }

    fn connect_failed(&self, err: Error) {
        let destroyed = matches!(err, Error::FactoryDestroyed);
        let exhausted = {
            let mut state = lock(&self.state);
            let index = state.next_candidate;
            let more = index + 1 < state.candidates.len();
            if let Some(candidate) = state.candidates.get(index) {
                self.factory
                    .trace_connect_failure(candidate.key.connector(), &err, self.has_more || more);
            }
            state.last_error = Some(err);
            state.next_candidate += 1;
            destroyed || !more
        };
        if exhausted {
            self.finish(None);
        } else {
            self.next_connector();
        }
    }

    fn finish(&self, established: Option<(Arc<Connection>, bool)>) {
        let (candidates, last_error) = {
            let mut state = lock(&self.state);
            state.current = None;
            (std::mem::take(&mut state.candidates), state.last_error.take())
        };
        let destroyed = self
            .factory
            .finish_get_connection(&candidates, established.as_ref().map(|(c, _)| c));
        {
            let mut state = lock(&self.state);
            state.phase = Phase::Done;
        }

        match established {
            Some(_) if destroyed => self.set_error(Error::FactoryDestroyed),
            Some((connection, compress)) => self.set_connection(connection, compress),
            None => self.set_error(last_error.unwrap_or_else(|| no_route(&self.endpoints))),
        }
    }

    fn set_connection(&self, connection: Arc<Connection>, compress: bool) {
        if let Some(callback) = lock(&self.callback).take() {
            callback.set_connection(connection, compress);
        }
    }

    fn set_error(&self, err: Error) {
        if let Some(callback) = lock(&self.callback).take() {
            callback.set_error(err);
        }
    }
}

impl StartCallback for ConnectAttempt {
    fn start_completed(&self, connection: &Arc<Connection>) {
        let current = lock(&self.state).current.take();
        let compress = match current {
            Some((_, compress)) => compress,
            None => self.factory.settings.compress_for(false),
        };
        self.finish(Some((connection.clone(), compress)));
    }

    fn start_failed(&self, connection: &Arc<Connection>, error: Error) {
        let key = {
            let mut state = lock(&self.state);
            state.current = None;
            state
                .candidates
                .get(state.next_candidate)
                .map(|candidate| candidate.key.clone())
        };
        if let Some(key) = key {
            self.factory.evict_if_finished(&key, connection);
        }
        self.connect_failed(error);
    }
}
