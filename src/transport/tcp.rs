//! TCP session mechanics.
//!
//! Covers the validation handshake exchanged when a session starts, the
//! non-blocking read and write loops used by pooled connections, and the
//! listening sockets for both concurrency models.

use crate::error::Error;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

// ============================================================================
// Validation Handshake
// ============================================================================

const MAGIC: &[u8] = b"rcv!";
const MAGIC_SIZE: usize = MAGIC.len();
const VERSION_MAJOR: u8 = 1;
const VERSION_MINOR: u8 = 0;
const VALIDATION_SIZE: usize = MAGIC_SIZE + 2;

/// Sends the validation frame. Run by the accepting side.
pub(crate) fn write_validation(stream: &mut TcpStream, timeout: Option<Duration>) -> Result<(), Error> {
    let mut frame = Vec::with_capacity(VALIDATION_SIZE);
    frame.extend_from_slice(MAGIC);
    frame.push(VERSION_MAJOR);
    frame.push(VERSION_MINOR);

    stream.set_write_timeout(timeout.filter(|t| !t.is_zero()))?;
    stream.write_all(&frame).map_err(|err| handshake_error(stream, err))?;
    stream.set_write_timeout(None)?;
    trace!(peer_addr = ?stream.peer_addr().ok(), "Sent validation frame");
    Ok(())
}

/// Waits for and checks the validation frame. Run by the connecting side.
pub(crate) fn read_validation(stream: &mut TcpStream, timeout: Option<Duration>) -> Result<(), Error> {
    let mut frame = [0u8; VALIDATION_SIZE];
    stream.set_read_timeout(timeout.filter(|t| !t.is_zero()))?;
    stream
        .read_exact(&mut frame)
        .map_err(|err| handshake_error(stream, err))?;
    stream.set_read_timeout(None)?;

    if &frame[..MAGIC_SIZE] != MAGIC {
        error!(expected = ?MAGIC, received = ?&frame[..MAGIC_SIZE], "Invalid magic bytes in validation frame");
        return Err(Error::Validation("invalid magic bytes".to_string()));
    }
    let (major, minor) = (frame[MAGIC_SIZE], frame[MAGIC_SIZE + 1]);
    if major != VERSION_MAJOR {
        error!(
            expected_major = VERSION_MAJOR,
            expected_minor = VERSION_MINOR,
            received_major = major,
            received_minor = minor,
            "Protocol version mismatch"
        );
        return Err(Error::Validation(format!(
            "protocol version {major}.{minor} not supported, expected {VERSION_MAJOR}.{VERSION_MINOR}"
        )));
    }
    trace!(peer_addr = ?stream.peer_addr().ok(), "Received validation frame");
    Ok(())
}

fn handshake_error(stream: &TcpStream, err: std::io::Error) -> Error {
    let connector = stream
        .peer_addr()
        .map(|addr| format!("tcp {addr}"))
        .unwrap_or_else(|_| "tcp <unknown>".to_string());
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::ConnectTimeout { connector },
        ErrorKind::UnexpectedEof => Error::ConnectionClosed {
            reason: format!("{connector} closed the connection during validation"),
        },
        _ => Error::ConnectFailed {
            connector,
            source: err,
        },
    }
}

/// Shuts both directions down, ignoring sockets that are already gone.
pub(crate) fn shutdown_stream(stream: &TcpStream) {
    match stream.shutdown(Shutdown::Both) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotConnected => {}
        Err(err) => debug!(?err, "Error shutting down socket"),
    }
}

// ============================================================================
// Non-blocking I/O
// ============================================================================

// Internal data type for read_available
pub(crate) enum ReadResult {
    Ok(Vec<u8>),
    Disconnected(Vec<u8>),
}

/// Reads until the socket would block or the peer goes away.
pub(crate) fn read_available<S: Read>(stream: &mut S, max_read_size: usize) -> ReadResult {
    let mut recv_buf = Vec::<u8>::new();
    let mut recv_pos: usize = 0;

    loop {
        recv_buf.resize(recv_pos + max_read_size, 0);
        match stream.read(&mut recv_buf[recv_pos..]) {
            Ok(0) => {
                recv_buf.truncate(recv_pos);
                return ReadResult::Disconnected(recv_buf);
            }
            Ok(sz) => {
                trace!(len = sz, "Read data from socket");
                recv_pos += sz;
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                match err.kind() {
                    ErrorKind::BrokenPipe => warn!("Broken pipe"),
                    ErrorKind::ConnectionReset => warn!("Connection reset"),
                    _ => error!(?err, "Error reading from socket"),
                }
                recv_buf.truncate(recv_pos);
                return ReadResult::Disconnected(recv_buf);
            }
        }
    }

    recv_buf.truncate(recv_pos);
    ReadResult::Ok(recv_buf)
}

// Internal data type for write_pending
pub(crate) enum WriteResult {
    /// Everything queued was written.
    Drained,
    /// The socket would block with data left in the buffer.
    Partial,
    Disconnected,
}

/// Writes as much of `send_buf` as the socket accepts and removes the
/// written bytes.
pub(crate) fn write_pending<S: Write>(stream: &mut S, send_buf: &mut Vec<u8>) -> WriteResult {
    let mut send_pos = 0;
    let result = loop {
        if send_pos == send_buf.len() {
            break WriteResult::Drained;
        }
        match stream.write(&send_buf[send_pos..]) {
            Ok(0) => {
                warn!(remaining = send_buf.len() - send_pos, "Write to socket returned 0");
                break WriteResult::Partial;
            }
            Ok(sz) => {
                send_pos += sz;
                trace!(len = sz, remaining = send_buf.len() - send_pos, "Wrote to socket");
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => break WriteResult::Partial,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                match err.kind() {
                    ErrorKind::BrokenPipe => warn!("Broken pipe"),
                    ErrorKind::ConnectionReset => warn!("Connection reset"),
                    _ => error!(?err, "Error writing to socket"),
                }
                break WriteResult::Disconnected;
            }
        }
    };
    send_buf.drain(..send_pos);
    result
}

// ============================================================================
// Acceptors
// ============================================================================

/// Listening socket for one bound endpoint.
#[derive(Debug)]
pub(crate) enum Acceptor {
    /// Non-blocking listener registered with a thread pool. `listener` is a
    /// clone of the registered socket and is the one accepting.
    Polled {
        registration: mio::net::TcpListener,
        listener: TcpListener,
    },
    /// Blocking listener driven by a dedicated accept thread.
    Blocking(Arc<TcpListener>),
}

impl Acceptor {
    pub fn bind(addr: SocketAddr, polled: bool) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)?;
        if polled {
            listener.set_nonblocking(true)?;
            let registration = mio::net::TcpListener::from_std(listener.try_clone()?);
            Ok(Acceptor::Polled {
                registration,
                listener,
            })
        } else {
            Ok(Acceptor::Blocking(Arc::new(listener)))
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(match self {
            Acceptor::Polled { listener, .. } => listener.local_addr()?,
            Acceptor::Blocking(listener) => listener.local_addr()?,
        })
    }

    /// Accepts one pending session without blocking. `Ok(None)` means the
    /// accept queue is empty.
    pub fn accept_nonblocking(&self) -> Result<Option<TcpStream>, Error> {
        let Acceptor::Polled { listener, .. } = self else {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::Unsupported,
                "blocking acceptor polled for readiness",
            )));
        };
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                trace!(%peer_addr, "Accepted socket");
                // Some platforms hand out sockets inheriting the listener's
                // non-blocking flag.
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                Ok(Some(stream))
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Blocking accept for the dedicated-thread model.
pub(crate) fn accept_blocking(listener: &TcpListener) -> Result<TcpStream, Error> {
    let (stream, peer_addr) = listener.accept()?;
    trace!(%peer_addr, "Accepted socket");
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Connects to our own listening address to unblock a thread stuck in
/// `accept()`.
pub(crate) fn connect_to_self(addr: SocketAddr) -> Result<(), Error> {
    let target = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port()),
        _ => addr,
    };
    let stream = TcpStream::connect(target)?;
    trace!(%target, "Connected to self");
    drop(stream);
    Ok(())
}
