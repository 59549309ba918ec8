//! Connection configuration.

use serde::Deserialize;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;
use std::time::Duration;

/// Configuration for one logical connection, immutable for the lifetime of
/// the connection that was initialized with it.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Candidate server hostnames; a connection uses exactly one of them,
    /// selected by the host index passed at initialization.
    pub hosts: Vec<String>,
    /// Server port.
    pub port: u16,
    /// Database name; empty selects the server default.
    pub database_name: String,
    /// Role to connect as. May be left empty when TLS is allowed, in which
    /// case it is derived from the client certificate's common name.
    pub user_name: String,
    /// Password for password-based authentication. Ignored when TLS is
    /// allowed.
    pub password: String,
    /// Hard deadline spanning DNS resolution and the protocol handshake.
    pub connect_timeout: Duration,
    /// Delay before a fresh connection attempt after a disconnect.
    pub reconnect_interval: Duration,
    /// Schedule a fresh connection attempt after any disconnect.
    pub auto_reconnect: bool,
    /// Validate declared parameter OIDs against the server-described types
    /// of the prepared statement before sending an execution.
    pub check_query_parameters: bool,
    /// Options applied to the raw socket once the protocol engine has one.
    pub socket_options: SocketOptions,
    /// TLS credentials and policy.
    pub ssl_options: SslOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            port: default_port(),
            database_name: String::new(),
            user_name: String::new(),
            password: String::new(),
            connect_timeout: default_connect_timeout(),
            reconnect_interval: default_reconnect_interval(),
            auto_reconnect: true,
            check_query_parameters: false,
            socket_options: SocketOptions::default(),
            ssl_options: SslOptions::default(),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Options")
            .field("hosts", &self.hosts)
            .field("port", &self.port)
            .field("database_name", &self.database_name)
            .field("user_name", &self.user_name)
            .field("password", &"******")
            .field("connect_timeout", &self.connect_timeout)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("check_query_parameters", &self.check_query_parameters)
            .field("socket_options", &self.socket_options)
            .field("ssl_options", &self.ssl_options)
            .finish()
    }
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(5)
}

/// Options applied to the connection's raw socket descriptor after the
/// protocol engine opens it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm.
    pub no_delay: bool,
    /// Enable TCP keepalive probing after the given idle time.
    pub keepalive: Option<Duration>,
    /// Kernel receive buffer size in bytes.
    pub receive_buffer_size: Option<usize>,
    /// Kernel send buffer size in bytes.
    pub send_buffer_size: Option<usize>,
}

impl SocketOptions {
    /// Apply the configured options to a raw socket.
    pub fn apply(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        let socket = SockRef::from(&fd);

        if self.no_delay {
            socket.set_nodelay(true)?;
        }

        if let Some(idle) = self.keepalive {
            socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }

        if let Some(size) = self.receive_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }

        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }

        Ok(())
    }
}

/// TLS credentials as PEM blobs, plus the switch that selects TLS over
/// password authentication.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct SslOptions {
    /// Allow TLS; when set, the connection authenticates with the client
    /// certificate below instead of a password.
    pub allow: bool,
    /// Client certificate, PEM-encoded.
    pub certificate_pem_data: String,
    /// Client private key, PEM-encoded (PKCS#8).
    pub private_key_pem_data: String,
    /// Trusted certificate-authority bundles, PEM-encoded. When at least one
    /// is present the server certificate is fully verified against the
    /// first; otherwise the session is encrypted without verification.
    pub trusted_certificates_pem_data: Vec<String>,
}

impl fmt::Debug for SslOptions {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SslOptions")
            .field("allow", &self.allow)
            .field("certificate_pem_data", &"<pem>")
            .field("private_key_pem_data", &"<pem>")
            .field(
                "trusted_certificates_pem_data",
                &self.trusted_certificates_pem_data.len(),
            )
            .finish()
    }
}
