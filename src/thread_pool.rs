//! Shared worker pool for the event-driven concurrency model.
//!
//! Workers take turns as the leader: the leader owns the [`mio::Poll`],
//! waits for readiness, then hands the leader role to the next worker
//! before or while it dispatches the event it picked up. Queued work items
//! run ahead of new readiness events.

use crate::config::Settings;
use crate::error::{lock, Error};
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, info, trace, warn};

const WAKE_TOKEN: Token = Token(0);
const FIRST_HANDLER_TOKEN: usize = 1;

/// A unit of work run by one of the pool's workers.
pub type WorkItem = Box<dyn FnOnce() + Send>;

/// Readiness reported for a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// Receiver of readiness notifications for one registered source.
pub trait EventHandler: Send + Sync {
    /// Called on a worker when the source is ready.
    ///
    /// The worker still holds the leader role; call
    /// [`Promotion::promote_follower`] once pool-owned state is no longer
    /// needed so another worker can poll. Returning promotes implicitly.
    fn message(&self, readiness: Readiness, promotion: &mut Promotion<'_>);

    /// Called exactly once for every [`ThreadPool::unregister`], after the
    /// source has been removed from the poll.
    fn finished(&self);
}

struct Leader {
    poll: Poll,
    events: Events,
    ready: VecDeque<(Token, Readiness)>,
}

/// The leader role held by the worker running [`EventHandler::message`].
pub struct Promotion<'a> {
    guard: Option<MutexGuard<'a, Leader>>,
}

impl Promotion<'_> {
    /// Lets another worker become the leader. Idempotent.
    pub fn promote_follower(&mut self) {
        self.guard.take();
    }
}

struct Handlers {
    next_token: usize,
    map: HashMap<Token, Arc<dyn EventHandler>>,
}

struct Shared {
    name: String,
    leader: Mutex<Leader>,
    registry: Registry,
    waker: Waker,
    handlers: Mutex<Handlers>,
    work: Mutex<VecDeque<WorkItem>>,
    destroyed: AtomicBool,
}

/// A pool of worker threads sharing one readiness poll.
///
/// Cheap to clone; all clones drive the same workers.
#[derive(Clone)]
pub struct ThreadPool {
    shared: Arc<Shared>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.shared.name)
            .field("destroyed", &self.shared.destroyed.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ThreadPool {
    /// Starts `settings.thread_pool_size` workers named `{name}-{index}`.
    pub fn new(settings: &Settings, name: &str) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        let shared = Arc::new(Shared {
            name: name.to_string(),
            leader: Mutex::new(Leader {
                poll,
                events: Events::with_capacity(settings.poll_capacity.max(1)),
                ready: VecDeque::new(),
            }),
            registry,
            waker,
            handlers: Mutex::new(Handlers {
                next_token: FIRST_HANDLER_TOKEN,
                map: HashMap::new(),
            }),
            work: Mutex::new(VecDeque::new()),
            destroyed: AtomicBool::new(false),
        });

        let pool = Self {
            shared,
            threads: Arc::new(Mutex::new(Vec::new())),
        };

        for index in 0..settings.thread_pool_size.max(1) {
            let shared = pool.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || run(shared));
            match spawned {
                Ok(handle) => lock(&pool.threads).push(handle),
                Err(err) => {
                    error!(pool = name, ?err, "Cannot create worker thread");
                    pool.destroy();
                    pool.join();
                    return Err(err.into());
                }
            }
        }

        info!(pool = name, size = settings.thread_pool_size, "Thread pool started");
        Ok(pool)
    }
}

// ============================================================================
// Registration
// ============================================================================

impl ThreadPool {
    /// Registers `source` and routes its readiness to `handler`.
    pub fn register<S>(
        &self,
        source: &mut S,
        interest: Interest,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Token, Error>
    where
        S: Source + ?Sized,
    {
        let mut handlers = lock(&self.shared.handlers);
        let token = Token(handlers.next_token);
        self.shared.registry.register(source, token, interest)?;
        handlers.next_token += 1;
        handlers.map.insert(token, handler);
        trace!(pool = %self.shared.name, token = token.0, "Registered handler");
        Ok(token)
    }

    /// Changes the interest of an already registered source.
    pub fn reregister<S>(&self, source: &mut S, token: Token, interest: Interest) -> Result<(), Error>
    where
        S: Source + ?Sized,
    {
        self.shared.registry.reregister(source, token, interest)?;
        Ok(())
    }

    /// Removes `source` from the poll and schedules the handler's
    /// [`EventHandler::finished`] call.
    pub fn unregister<S>(&self, source: &mut S, token: Token)
    where
        S: Source + ?Sized,
    {
        if let Err(err) = self.shared.registry.deregister(source) {
            warn!(pool = %self.shared.name, token = token.0, ?err, "Failed to deregister source");
        }
        let handler = lock(&self.shared.handlers).map.remove(&token);
        match handler {
            Some(handler) => {
                trace!(pool = %self.shared.name, token = token.0, "Unregistered handler");
                self.run_later(Box::new(move || handler.finished()));
            }
            None => warn!(pool = %self.shared.name, token = token.0, "Unregistering unknown token"),
        }
    }

    /// Queues `work` to run on one of the workers.
    pub fn run_later(&self, work: WorkItem) {
        lock(&self.shared.work).push_back(work);
        if let Err(err) = self.shared.waker.wake() {
            error!(pool = %self.shared.name, ?err, "Failed to wake thread pool");
        }
    }
}

// ============================================================================
// Shutdown
// ============================================================================

impl ThreadPool {
    /// Stops the workers once the queued work has drained.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(pool = %self.shared.name, "Destroying thread pool");
        if let Err(err) = self.shared.waker.wake() {
            error!(pool = %self.shared.name, ?err, "Failed to wake thread pool");
        }
    }

    /// Waits for every worker to exit. Must follow [`Self::destroy`].
    ///
    /// Called from a worker, it joins every other worker.
    pub fn join(&self) {
        let current: ThreadId = thread::current().id();
        let handles: Vec<JoinHandle<()>> = lock(&self.threads).drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.shared.name, "Worker thread panicked");
            }
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Worker Loop
// ============================================================================

fn run(shared: Arc<Shared>) {
    'worker: loop {
        let mut guard = lock(&shared.leader);
        loop {
            let work = lock(&shared.work).pop_front();
            if let Some(work) = work {
                drop(guard);
                work();
                continue 'worker;
            }

            if shared.destroyed.load(Ordering::SeqCst) {
                // Let the next worker see the flag too.
                let _ = shared.waker.wake();
                break 'worker;
            }

            if let Some((token, readiness)) = guard.ready.pop_front() {
                let handler = lock(&shared.handlers).map.get(&token).cloned();
                let Some(handler) = handler else {
                    // Stale event for an unregistered source.
                    continue;
                };
                let mut promotion = Promotion { guard: Some(guard) };
                handler.message(readiness, &mut promotion);
                continue 'worker;
            }

            let Leader {
                poll,
                events,
                ready,
            } = &mut *guard;
            if let Err(err) = poll.poll(events, None) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(pool = %shared.name, ?err, "Poll failed, worker exiting");
                break 'worker;
            }
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                ready.push_back((
                    event.token(),
                    Readiness {
                        readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                        writable: event.is_writable() || event.is_write_closed(),
                    },
                ));
            }
        }
    }
    trace!(pool = %shared.name, "Worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    fn pool(size: usize) -> ThreadPool {
        let settings = Settings {
            thread_pool_size: size,
            ..Settings::default()
        };
        ThreadPool::new(&settings, "test-pool").unwrap()
    }

    #[test]
    fn runs_queued_work() {
        let pool = pool(2);
        let (tx, rx) = channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.run_later(Box::new(move || tx.send(i).unwrap()));
        }
        let mut got: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
        pool.destroy();
        pool.join();
    }

    struct CountingHandler {
        messages: AtomicUsize,
        finished: AtomicUsize,
        notify: Mutex<std::sync::mpsc::Sender<&'static str>>,
    }

    impl EventHandler for CountingHandler {
        fn message(&self, _readiness: Readiness, promotion: &mut Promotion<'_>) {
            promotion.promote_follower();
            self.messages.fetch_add(1, Ordering::SeqCst);
            let _ = lock(&self.notify).send("message");
        }

        fn finished(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
            let _ = lock(&self.notify).send("finished");
        }
    }

    #[test]
    fn dispatches_readiness_and_finishes_once() {
        let pool = pool(3);
        let (tx, rx) = channel();
        let handler = Arc::new(CountingHandler {
            messages: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            notify: Mutex::new(tx),
        });

        let mut listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let token = pool
            .register(&mut listener, Interest::READABLE, handler.clone())
            .unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "message");

        pool.unregister(&mut listener, token);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "finished");
        assert_eq!(handler.finished.load(Ordering::SeqCst), 1);

        pool.destroy();
        pool.join();
        assert!(pool.is_destroyed());
    }
}
