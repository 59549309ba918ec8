//! The libpq-compatible protocol surface.
//!
//! The connection state machine never talks to a socket directly; it drives
//! a [`Protocol`] handle through the same polling surface the C client
//! library exposes: a handshake poll that reports which readiness direction
//! it needs next, a flush/consume pair for the command phase, and blocking
//! round trips for synchronous calls. [`wire`] provides the built-in
//! implementation.

use bytes::Bytes;
use std::io;
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::time::Duration;
use thiserror::Error;

use crate::params::{Oid, QueryData};

pub mod backend;
mod buffer;
pub mod frontend;
pub mod wire;

/// Errors raised by a protocol engine.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The connection attempt could not be started.
    #[error("{0}")]
    Connect(String),
    /// Transport-level failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// TLS negotiation failure.
    #[error("tls negotiation failed: {0}")]
    Tls(#[from] native_tls::Error),
    /// The server rejected the session during startup.
    #[error("{0}")]
    Server(String),
    /// The peer sent something the engine cannot interpret.
    #[error("protocol violation: {0}")]
    Violation(String),
    /// The handle is not in a state that allows the requested operation.
    #[error("connection not ready")]
    NotReady,
}

/// Direction the handshake needs next, mirroring the C library's polling
/// status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polling {
    /// Wait for the socket to become readable, then poll again.
    Reading,
    /// Wait for the socket to become writable, then poll again.
    Writing,
    /// The handshake finished; the session is ready for commands.
    Ok,
    /// The handshake failed; see [`Protocol::error_message`].
    Failed,
}

/// Coarse connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Handshake in progress.
    Started,
    /// Session established.
    Ok,
    /// Unusable; see [`Protocol::error_message`].
    Bad,
}

/// Outcome of a non-blocking outbound flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Everything queued has reached the kernel.
    Done,
    /// Bytes remain; retry once the socket is writable again.
    Pending,
}

/// Execution status of one result, mirroring the C library's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The query string was empty.
    EmptyQuery,
    /// Command completed without returning rows.
    CommandOk,
    /// Rows were returned (possibly zero of them).
    TuplesOk,
    /// Server started a copy-out stream.
    CopyOut,
    /// Server started a copy-in stream.
    CopyIn,
    /// Server started a bidirectional copy stream.
    CopyBoth,
    /// The server's response could not be understood.
    BadResponse,
    /// A non-fatal server error.
    NonfatalError,
    /// A fatal server error.
    FatalError,
    /// One row of a single-row-mode result.
    SingleTuple,
    /// Pipeline synchronization point.
    PipelineSync,
    /// Pipeline aborted.
    PipelineAborted,
}

/// One column of a result.
#[derive(Debug, Clone)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Type OID of the column.
    pub type_oid: Oid,
    /// Wire format code of the column's values.
    pub format: i16,
}

/// One raw protocol result: status, server error text, row data, and (for
/// statement descriptions) the declared parameter types. Row decoding is
/// the caller's concern; cells stay as raw bytes.
#[derive(Debug, Clone, Default)]
pub struct PgResult {
    /// Execution status.
    pub status: Option<ExecStatus>,
    /// Server-reported error message, when the status is an error.
    pub error: Option<String>,
    /// Result columns.
    pub columns: Vec<Column>,
    /// Result rows; `None` cells are NULL.
    pub rows: Vec<Vec<Option<Bytes>>>,
    /// Parameter type OIDs from a statement description.
    pub parameter_types: Vec<Oid>,
    /// Command completion tag, e.g. `SELECT 1`.
    pub command_tag: Option<String>,
}

impl PgResult {
    /// A result carrying just a status.
    #[must_use]
    pub fn with_status(status: ExecStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// The execution status, defaulting to [`ExecStatus::FatalError`] for a
    /// result that never completed.
    #[must_use]
    pub fn exec_status(&self) -> ExecStatus {
        self.status.unwrap_or(ExecStatus::FatalError)
    }
}

/// Connection parameters handed to [`ProtocolFactory::start`].
#[derive(Clone)]
pub struct StartupParams {
    /// Resolved server address.
    pub hostaddr: IpAddr,
    /// Server port.
    pub port: u16,
    /// Role to connect as.
    pub user: String,
    /// Database name; `None` selects the server default.
    pub database: Option<String>,
    /// Deadline applied to blocking round trips.
    pub connect_timeout: Duration,
    /// Authentication and transport security.
    pub security: Security,
}

impl std::fmt::Debug for StartupParams {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("StartupParams")
            .field("hostaddr", &self.hostaddr)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("connect_timeout", &self.connect_timeout)
            .field("tls", &matches!(self.security, Security::Tls(_)))
            .finish()
    }
}

/// How the session authenticates and whether it is encrypted.
#[derive(Clone)]
pub enum Security {
    /// Plain TCP with password authentication.
    Password(String),
    /// TLS with client-certificate authentication.
    Tls(TlsParams),
}

/// TLS session parameters. All certificate material is referenced by path.
#[derive(Debug, Clone)]
pub struct TlsParams {
    /// The unresolved server hostname, used for SNI and certificate
    /// name matching.
    pub host: String,
    /// Client certificate path.
    pub certificate: String,
    /// Client private key path.
    pub private_key: String,
    /// Trusted-CA bundle path. When present the server certificate is
    /// verified against it and the hostname is matched; when absent the
    /// session is encrypted without verification.
    pub ca_bundle: Option<String>,
}

/// One protocol session, from startup through teardown. Dropping a handle
/// finalizes the session (a connected handle sends a terminate message
/// best-effort).
pub trait Protocol {
    /// Coarse status of the session.
    fn status(&self) -> ConnectionStatus;

    /// Human-readable description of the most recent failure.
    fn error_message(&self) -> String;

    /// The raw socket descriptor, for readiness registration.
    fn socket(&self) -> Option<RawFd>;

    /// Advance the startup handshake.
    fn connect_poll(&mut self) -> Polling;

    /// Advance a connection reset.
    fn reset_poll(&mut self) -> Polling;

    /// Push queued outbound bytes without blocking.
    fn flush(&mut self) -> Result<FlushStatus, ProtocolError>;

    /// Pull available inbound bytes without blocking.
    fn consume_input(&mut self) -> Result<(), ProtocolError>;

    /// True while the next result is still incomplete.
    fn is_busy(&self) -> bool;

    /// Dequeue the next complete result; `None` once the current command's
    /// results are exhausted.
    fn take_result(&mut self) -> Option<PgResult>;

    /// Queue a prepared-statement execution (binary result format) without
    /// blocking.
    fn send_query_prepared(&mut self, name: &str, data: &QueryData) -> Result<(), ProtocolError>;

    /// Execute a parameterized query synchronously (binary result format).
    fn exec_params(
        &mut self,
        query: &str,
        data: Option<&QueryData>,
    ) -> Result<PgResult, ProtocolError>;

    /// Create a named prepared statement synchronously.
    fn prepare(
        &mut self,
        name: &str,
        query: &str,
        types: &[Oid],
    ) -> Result<PgResult, ProtocolError>;

    /// Fetch the server's description of a prepared statement, including
    /// its declared parameter types.
    fn describe_prepared(&mut self, name: &str) -> Result<PgResult, ProtocolError>;
}

/// Creates protocol sessions; the seam that lets tests substitute a
/// scripted engine.
pub trait ProtocolFactory {
    /// Begin a session. The returned handle is mid-handshake; drive it with
    /// [`Protocol::connect_poll`].
    fn start(&self, params: &StartupParams) -> Result<Box<dyn Protocol>, ProtocolError>;
}
