//! RustComm-Conn - Connection management core for an RPC runtime
//!
//! RustComm-Conn establishes, deduplicates, caches and tears down the TCP
//! connections that carry remote invocations. The
//! [`OutgoingConnectionFactory`] guarantees at most one connection attempt
//! per route and shares established connections between callers; the
//! [`IncomingConnectionFactory`] accepts connections on one endpoint and
//! mirrors its active/holding/closed state onto every connection it owns.
//!
//! Both sides support two concurrency models with the same observable
//! lifecycle: connections driven by a shared [`ThreadPool`] over a mio
//! poll, or one dedicated thread per connection doing blocking I/O.

// Internal-only modules
pub(crate) mod config;
pub(crate) mod connection;
pub(crate) mod endpoint;
pub(crate) mod error;
pub(crate) mod factory;
pub(crate) mod route;
pub(crate) mod thread_pool;
pub(crate) mod transport;

// These are the intended public API
pub use crate::config::Settings;
pub use connection::{Adapter, Connection, ConnectionState, StartCallback};
pub use endpoint::{
    ConcurrencyMode, Connector, Endpoint, EndpointSelection, ResolveCallback, Resolver,
    SystemResolver,
};
pub use error::{DestroyReason, Error};
pub use factory::{
    ConnectionCallback, IncomingConnectionFactory, ListenerState, OutgoingConnectionFactory,
};
pub use route::RouteKey;
pub use thread_pool::{EventHandler, Promotion, Readiness, ThreadPool, WorkItem};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::connection::{Adapter, Connection, ConnectionState};
    pub use crate::endpoint::{ConcurrencyMode, Endpoint, EndpointSelection, Resolver};
    pub use crate::error::{DestroyReason, Error};
    pub use crate::factory::{
        ConnectionCallback, IncomingConnectionFactory, ListenerState, OutgoingConnectionFactory,
    };
    pub use crate::thread_pool::ThreadPool;
}
