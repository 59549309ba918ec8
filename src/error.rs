//! Connection-level errors.

use thiserror::Error;

use crate::event::LoopError;
use crate::params::Oid;
use crate::tls;

/// Everything that can go wrong on a connection, from configuration through
/// per-query failures. Transient connection errors reach the disconnected
/// handler; query and parameter errors reach the caller (or the execute
/// handler) directly.
#[derive(Debug, Error)]
pub enum Error {
    /// TLS material could not be staged or interpreted.
    #[error("unable to initialize connection")]
    Initialize(#[source] tls::Error),
    /// The configured host index points outside the host list.
    #[error("host index {index} out of range ({count} hosts)")]
    HostIndex {
        /// The requested index.
        index: usize,
        /// Number of configured hosts.
        count: usize,
    },
    /// The hostname did not resolve to any address.
    #[error("unable to resolve host {0:?}")]
    ResolveHost(String),
    /// DNS plus handshake exceeded the configured deadline.
    #[error("connection timeout")]
    ConnectTimeout,
    /// The connection attempt could not be started.
    #[error("connection to database failed: {0}")]
    ConnectFailed(String),
    /// The event loop reported that the peer is unreachable.
    #[error("unable to connect to server: {0}")]
    Unreachable(String),
    /// The event loop reported a failure status.
    #[error("bad poll status {0}")]
    PollStatus(i32),
    /// The event loop reported readiness bits outside the registered pair.
    #[error("unexpected poll event {0:#x}")]
    UnexpectedEvents(u32),
    /// The protocol engine exposed no socket descriptor.
    #[error("unable to get socket descriptor")]
    SocketDescriptor,
    /// The socket descriptor could not be duplicated.
    #[error("unable to duplicate socket descriptor: {0}")]
    DuplicateDescriptor(#[source] std::io::Error),
    /// The event loop rejected a registration or interest update.
    #[error(transparent)]
    Loop(#[from] LoopError),
    /// The handshake poll failed.
    #[error("polling failed: {0}")]
    PollingFailed(String),
    /// Outbound bytes could not be pushed to the server.
    #[error("unable to flush data to server: {0}")]
    FlushFailed(String),
    /// Inbound bytes could not be pulled from the server.
    #[error("unable to receive data from server: {0}")]
    ReceiveFailed(String),
    /// No connection is attached, or it is not yet established.
    #[error("connection is currently disconnected")]
    Disconnected,
    /// An execution is already in flight.
    #[error("connection is busy")]
    Busy,
    /// The server rejected the query.
    #[error("unable to execute query: {0}")]
    ExecuteFailed(String),
    /// The query produced a result the connection does not handle.
    #[error("unsupported query")]
    UnsupportedQuery,
    /// A second result followed the first.
    #[error("handling of more results is not supported")]
    MoreResults,
    /// The parameter count disagrees with the prepared statement.
    #[error("wrong parameter count")]
    ParameterCount,
    /// A declared parameter type disagrees with the prepared statement.
    #[error("wrong parameter type {declared} for parameter {index}. Must be {expected}.")]
    ParameterType {
        /// The declared type OID.
        declared: Oid,
        /// Zero-based parameter index.
        index: usize,
        /// The server-declared type OID.
        expected: Oid,
    },
    /// The reconnect timer could not be scheduled.
    #[error("unable to start reconnect timer")]
    ReconnectTimer,
    /// The state machine was driven in a state that forbids the operation.
    #[error("invalid connection state")]
    InvalidState,
}
