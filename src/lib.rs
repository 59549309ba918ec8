//! Event-loop-driven PostgreSQL client connection core.
//!
//! `postlink` manages a single logical connection to a PostgreSQL server on
//! behalf of a host event loop: it resolves the server hostname, performs a
//! non-blocking TCP/TLS handshake and startup negotiation, then serves
//! prepared-statement executions through a readiness-polled command loop.
//! When anything goes wrong the connection tears itself down in a strict
//! order and, if configured, schedules a fresh connection attempt.
//!
//! The crate is deliberately loop-agnostic: the host supplies the event loop
//! (readiness notifications and timers) through [`event::EventLoop`] and the
//! DNS resolver through [`resolver::Resolver`]. The wire protocol itself is
//! reached through [`protocol::Protocol`], for which [`protocol::wire`]
//! provides the built-in non-blocking implementation.
//!
//! All callbacks run on the host loop's single thread; no part of the public
//! API is safe to call from any other thread.
#![deny(missing_docs, unreachable_pub)]

pub mod configuration;
pub mod connection;
pub mod error;
pub mod event;
mod machine;
pub mod params;
mod poller;
pub mod protocol;
pub mod recordset;
pub mod resolver;
pub mod tls;


pub use configuration::{Options, SocketOptions, SslOptions};
pub use connection::{
    Connection, ConnectionId, ExecuteHandler, RequestId, INVALID_REQUEST_ID,
};
pub use error::Error;
pub use params::{Format, Oid, QueryData};
pub use recordset::Recordset;
