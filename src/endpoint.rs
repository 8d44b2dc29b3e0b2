//! Logical endpoints, the concrete connectors they resolve to, and the
//! resolver seam between them.

use crate::error::Error;
use std::fmt;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace};

/// How connections carry their I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConcurrencyMode {
    /// Readiness is driven by a shared [`ThreadPool`](crate::ThreadPool).
    Pooled,
    /// Each connection (and each listener) owns a dedicated thread doing
    /// blocking I/O.
    ThreadPerConnection,
}

/// Order in which the connectors of one endpoint are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointSelection {
    /// Shuffle the connectors of each endpoint independently.
    #[default]
    Random,
    /// Keep the order produced by the resolver.
    Ordered,
}

/// Immutable description of a TCP target and its options.
///
/// Equality is value based. Every `with_*` method returns a new value and
/// leaves `self` untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
    timeout: Option<Duration>,
    compress: bool,
    connection_id: String,
    requires_thread_per_connection: bool,
}

impl Endpoint {
    /// Creates a TCP endpoint with no timeout and compression disabled.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: None,
            compress: false,
            connection_id: String::new(),
            requires_thread_per_connection: false,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub fn with_compress(&self, compress: bool) -> Self {
        Self {
            compress,
            ..self.clone()
        }
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    /// Endpoints that differ only by connection id never share a
    /// connection.
    pub fn with_connection_id(&self, connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            ..self.clone()
        }
    }

    /// Marks the endpoint as usable only with
    /// [`ConcurrencyMode::ThreadPerConnection`].
    pub fn with_thread_per_connection_required(&self, required: bool) -> Self {
        Self {
            requires_thread_per_connection: required,
            ..self.clone()
        }
    }

    pub fn supports_mode(&self, mode: ConcurrencyMode) -> bool {
        !(self.requires_thread_per_connection && mode == ConcurrencyMode::Pooled)
    }

    /// Resolves the endpoint with the operating system's resolver.
    pub(crate) fn socket_addrs(&self) -> Result<Vec<SocketAddr>, Error> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| Error::Resolution {
                endpoint: self.to_string(),
                reason: err.to_string(),
            })?
            .collect();
        if addrs.is_empty() {
            return Err(Error::Resolution {
                endpoint: self.to_string(),
                reason: "no addresses".to_string(),
            });
        }
        Ok(addrs)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp -h {} -p {}", self.host, self.port)?;
        if let Some(timeout) = self.timeout {
            write!(f, " -t {}", timeout.as_millis())?;
        }
        if self.compress {
            write!(f, " -z")?;
        }
        Ok(())
    }
}

/// A concrete, resolved route derived from an [`Endpoint`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Connector {
    addr: SocketAddr,
    timeout: Option<Duration>,
    connection_id: String,
}

impl Connector {
    pub fn new(addr: SocketAddr, endpoint: &Endpoint) -> Self {
        Self {
            addr,
            timeout: endpoint.timeout,
            connection_id: endpoint.connection_id.clone(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Opens the TCP session, blocking for at most `timeout` if given.
    pub fn connect(&self, timeout: Option<Duration>) -> Result<TcpStream, Error> {
        trace!(addr = %self.addr, ?timeout, "Connecting");
        let result = match timeout {
            Some(timeout) if !timeout.is_zero() => TcpStream::connect_timeout(&self.addr, timeout),
            _ => TcpStream::connect(self.addr),
        };
        let stream = result.map_err(|err| {
            let connector = self.to_string();
            match err.kind() {
                ErrorKind::ConnectionRefused => Error::ConnectionRefused { connector },
                ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::ConnectTimeout { connector },
                _ => Error::ConnectFailed {
                    connector,
                    source: err,
                },
            }
        })?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "Connected");
        Ok(stream)
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp {}", self.addr)
    }
}

/// Receives the outcome of an asynchronous resolution.
pub type ResolveCallback = Box<dyn FnOnce(Result<Vec<Connector>, Error>) + Send>;

/// Turns logical endpoints into connectors.
pub trait Resolver: Send + Sync {
    /// Resolves `endpoint`, blocking the caller.
    fn resolve(&self, endpoint: &Endpoint) -> Result<Vec<Connector>, Error>;

    /// Resolves `endpoint` and reports through `callback`.
    ///
    /// The default implementation resolves on the calling thread.
    fn resolve_async(&self, endpoint: &Endpoint, callback: ResolveCallback) {
        callback(self.resolve(endpoint));
    }
}

/// Resolver backed by the operating system (`ToSocketAddrs`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, endpoint: &Endpoint) -> Result<Vec<Connector>, Error> {
        Ok(endpoint
            .socket_addrs()?
            .into_iter()
            .map(|addr| Connector::new(addr, endpoint))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewriting_produces_new_value() {
        let base = Endpoint::tcp("127.0.0.1", 4061);
        let timed = base.with_timeout(Some(Duration::from_millis(500)));
        assert_ne!(base, timed);
        assert_eq!(base.timeout(), None);
        assert_eq!(timed.with_timeout(None), base);
        assert_eq!(timed.to_string(), "tcp -h 127.0.0.1 -p 4061 -t 500");
        assert_eq!(base.with_compress(true).to_string(), "tcp -h 127.0.0.1 -p 4061 -z");
    }

    #[test]
    fn connection_id_is_part_of_identity() {
        let base = Endpoint::tcp("127.0.0.1", 4061);
        let other = base.with_connection_id("admin");
        assert_ne!(base, other);

        let addr: SocketAddr = "127.0.0.1:4061".parse().unwrap();
        assert_ne!(Connector::new(addr, &base), Connector::new(addr, &other));
        assert_eq!(Connector::new(addr, &base), Connector::new(addr, &base.clone()));
    }

    #[test]
    fn mode_support() {
        let endpoint = Endpoint::tcp("localhost", 1);
        assert!(endpoint.supports_mode(ConcurrencyMode::Pooled));
        let tpc = endpoint.with_thread_per_connection_required(true);
        assert!(!tpc.supports_mode(ConcurrencyMode::Pooled));
        assert!(tpc.supports_mode(ConcurrencyMode::ThreadPerConnection));
    }

    #[test]
    fn system_resolver_resolves_literal_addresses() {
        let endpoint = Endpoint::tcp("127.0.0.1", 4061);
        let connectors = SystemResolver.resolve(&endpoint).unwrap();
        assert_eq!(connectors.len(), 1);
        assert_eq!(connectors[0].addr(), "127.0.0.1:4061".parse().unwrap());
    }

    #[test]
    fn connect_refused_maps_to_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = Connector::new(addr, &Endpoint::tcp("127.0.0.1", addr.port()));
        let err = connector.connect(Some(Duration::from_secs(2))).unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused { .. }), "{err:?}");
    }
}
