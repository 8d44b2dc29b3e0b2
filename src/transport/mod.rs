//! Transport layer for the sessions carried by connections.
//!
//! Only TCP is provided. The factories never touch sockets directly; they
//! go through [`Acceptor`] for listening and through
//! [`Connector::connect`](crate::Connector::connect) plus the validation
//! handshake for outgoing sessions.

mod tcp;

pub(crate) use tcp::{
    accept_blocking, connect_to_self, read_available, read_validation, shutdown_stream,
    write_pending, write_validation, Acceptor, ReadResult, WriteResult,
};
