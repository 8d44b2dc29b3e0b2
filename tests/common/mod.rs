//! Shared helpers for the integration tests.
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! TEST_LOG=2 cargo test --test outgoing -- --nocapture
//! ```

#![allow(dead_code)]

use rustcomm_conn::prelude::*;
use rustcomm_conn::{Connector, SystemResolver};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

pub const WAIT: Duration = Duration::from_secs(10);

/// Initialize tracing based on TEST_LOG environment variable
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("rustcomm_conn={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Setup Helpers
// ============================================================================

/// Settings loaded the way an application would, from a `config::Config`.
pub fn settings(pairs: &[(&str, &str)]) -> Settings {
    let mut builder = config::Config::builder().set_default("thread_pool_size", "4").unwrap();
    for (key, value) in pairs {
        builder = builder.set_default(*key, *value).unwrap();
    }
    Settings::new(&builder.build().unwrap()).unwrap()
}

pub fn thread_pool(settings: &Settings) -> ThreadPool {
    ThreadPool::new(settings, "test").unwrap()
}

/// A loopback port nothing listens on.
pub fn refused_endpoint() -> Endpoint {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Endpoint::tcp("127.0.0.1", port)
}

/// Polls `condition` until it holds or [`WAIT`] elapses.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// ============================================================================
// Recording Adapter
// ============================================================================

/// Adapter collecting every byte dispatched to it.
pub struct RecordingAdapter {
    name: String,
    received: Mutex<Vec<u8>>,
    cond: Condvar,
}

impl RecordingAdapter {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            received: Mutex::new(Vec::new()),
            cond: Condvar::new(),
        })
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    /// Waits until at least `len` bytes have arrived.
    pub fn wait_for(&self, len: usize) -> Vec<u8> {
        let guard = self.received.lock().unwrap();
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, WAIT, |received| received.len() < len)
            .unwrap();
        guard.clone()
    }
}

impl Adapter for RecordingAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, _connection: &Arc<Connection>, data: Vec<u8>) {
        self.received.lock().unwrap().extend_from_slice(&data);
        self.cond.notify_all();
    }
}

// ============================================================================
// Resolvers
// ============================================================================

/// System resolver that counts calls and fails for chosen hosts.
#[derive(Default)]
pub struct CountingResolver {
    pub calls: AtomicUsize,
    failing_hosts: HashSet<String>,
    // Resolve asynchronously on a helper thread after this delay.
    async_delay: Option<Duration>,
}

impl CountingResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(hosts: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            failing_hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..Self::default()
        })
    }

    pub fn delayed(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            async_delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Resolver for CountingResolver {
    fn resolve(&self, endpoint: &Endpoint) -> Result<Vec<Connector>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_hosts.contains(endpoint.host()) {
            return Err(Error::Resolution {
                endpoint: endpoint.to_string(),
                reason: "host unknown".to_string(),
            });
        }
        SystemResolver.resolve(endpoint)
    }

    fn resolve_async(&self, endpoint: &Endpoint, callback: rustcomm_conn::ResolveCallback) {
        match self.async_delay {
            None => callback(self.resolve(endpoint)),
            Some(delay) => {
                let result = self.resolve(endpoint);
                thread::spawn(move || {
                    thread::sleep(delay);
                    callback(result);
                });
            }
        }
    }
}

// ============================================================================
// Server Helpers
// ============================================================================

/// An active listener on a loopback port.
pub fn listener(
    mode: ConcurrencyMode,
    pool: &ThreadPool,
    settings: &Settings,
) -> (Arc<IncomingConnectionFactory>, Arc<RecordingAdapter>) {
    let adapter = RecordingAdapter::new("server");
    let factory = IncomingConnectionFactory::new(
        &Endpoint::tcp("127.0.0.1", 0),
        adapter.clone(),
        mode,
        pool,
        settings,
    )
    .unwrap();
    factory.activate();
    (factory, adapter)
}

pub fn addr_of(connection: &Connection) -> SocketAddr {
    connection.peer_addr().unwrap()
}
