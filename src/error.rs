use std::io::ErrorKind;
use std::sync::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

/// The error type for rustcomm-conn operations.
///
/// Errors are grouped the way callers have to treat them: configuration
/// problems are surfaced immediately, resolution and connect failures are
/// only surfaced once every candidate route is exhausted, and
/// [`Error::FactoryDestroyed`] always wins over everything else.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Configuration Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The endpoint cannot be used with the requested concurrency mode.
    ///
    /// This is a caller configuration error and is never retried.
    #[error("Feature not supported: {feature}")]
    FeatureNotSupported { feature: String },

    /// The endpoint value is malformed.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    // ============================================================================
    // Route Errors
    // ============================================================================

    /// The endpoint could not be resolved into any connector.
    #[error("Couldn't resolve endpoint `{endpoint}`: {reason}")]
    Resolution { endpoint: String, reason: String },

    /// The peer refused the connection.
    #[error("Connection to {connector} refused")]
    ConnectionRefused { connector: String },

    /// The connection could not be established in time.
    #[error("Connection to {connector} timed out")]
    ConnectTimeout { connector: String },

    /// Establishing the connection failed for another reason.
    #[error("Connection to {connector} failed: {source}")]
    ConnectFailed {
        connector: String,
        source: std::io::Error,
    },

    /// The validation handshake received unexpected bytes.
    #[error("Connection validation failed: {0}")]
    Validation(String),

    // ============================================================================
    // Lifecycle Errors
    // ============================================================================

    /// The factory (or the runtime owning it) has been destroyed.
    #[error("Connection factory destroyed")]
    FactoryDestroyed,

    /// The listener owning the connection has been closed.
    #[error("Object adapter deactivated")]
    AdapterDeactivated,

    /// The connection was closed before or while the operation ran.
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },
}

impl Error {
    /// Returns true for accept errors that the accept loop silently skips.
    pub fn is_transient_accept(&self) -> bool {
        match self {
            Error::Io(err) => matches!(
                err.kind(),
                ErrorKind::WouldBlock
                    | ErrorKind::Interrupted
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::ConnectionReset
                    | ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Why a connection is being destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// The listener that accepted the connection was closed.
    ObjectAdapterDeactivated,
    /// The outgoing pool was destroyed.
    CommunicatorDestroyed,
}

impl DestroyReason {
    pub(crate) fn to_error(self) -> Error {
        match self {
            DestroyReason::ObjectAdapterDeactivated => Error::AdapterDeactivated,
            DestroyReason::CommunicatorDestroyed => Error::FactoryDestroyed,
        }
    }
}

// Bookkeeping state stays consistent across a panicking callback, so a
// poisoned lock is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cond.wait(guard).unwrap_or_else(|poisoned| poisoned.into_inner())
}
