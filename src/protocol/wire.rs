//! Built-in non-blocking protocol engine.
//!
//! Speaks protocol 3.0 over plain TCP or TLS. The handshake advances one
//! readiness edge at a time through [`Protocol::connect_poll`]; command
//! traffic moves through the flush/consume pair. The synchronous entry
//! points temporarily flip the socket to blocking mode for the duration of
//! one round trip and restore it before returning.

use bytes::{Buf, BytesMut};
use native_tls::{Certificate, HandshakeError, Identity, MidHandshakeTlsStream, TlsConnector, TlsStream};
use postgres_protocol::authentication::md5_hash;
use postgres_protocol::authentication::sasl::{ChannelBinding, ScramSha256};
use socket2::{Domain, Protocol as IpProtocol, Socket as RawSocket, Type};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use super::{
    backend, frontend, ConnectionStatus, ExecStatus, FlushStatus, PgResult, Polling, Protocol,
    ProtocolError, ProtocolFactory, Security, StartupParams, TlsParams,
};
use crate::params::{Oid, QueryData};

/// The SASL mechanism the engine speaks.
const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Application name reported to the server at startup.
const APPLICATION_NAME: &str = "postlink";

const READ_CHUNK: usize = 8192;

/// Factory for the built-in engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct Wire;

impl ProtocolFactory for Wire {
    fn start(&self, params: &StartupParams) -> Result<Box<dyn Protocol>, ProtocolError> {
        WireProtocol::start(params.clone()).map(|protocol| Box::new(protocol) as Box<dyn Protocol>)
    }
}

/// Transport under the protocol stream.
enum Socket {
    Plain(TcpStream),
    Handshaking(MidHandshakeTlsStream<TcpStream>),
    Tls(TlsStream<TcpStream>),
    Gone,
}

impl Socket {
    /// The TCP stream under whatever layer is active.
    fn tcp(&self) -> Result<&TcpStream, ProtocolError> {
        match self {
            Self::Plain(stream) => Ok(stream),
            Self::Handshaking(mid) => Ok(mid.get_ref()),
            Self::Tls(stream) => Ok(stream.get_ref()),
            Self::Gone => Err(ProtocolError::NotReady),
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
            Self::Handshaking(_) | Self::Gone => {
                Err(io::Error::from(io::ErrorKind::NotConnected))
            }
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
            Self::Handshaking(_) | Self::Gone => {
                Err(io::Error::from(io::ErrorKind::NotConnected))
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
            Self::Handshaking(_) | Self::Gone => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// TCP connect in progress.
    Connecting,
    /// TLS request sent; awaiting the server's one-byte answer.
    SslRequestSent,
    /// TLS handshake in progress.
    TlsHandshaking,
    /// Startup and authentication messages in flight.
    Startup,
    /// Session established.
    Ready,
    /// Session unusable.
    Failed,
}

/// One protocol session over its own socket.
pub(crate) struct WireProtocol {
    params: StartupParams,
    socket: Socket,
    phase: Phase,
    status: ConnectionStatus,
    error: String,
    read_buf: BytesMut,
    write_buf: BytesMut,
    scram: Option<ScramSha256>,
    parameters: BTreeMap<String, String>,
    backend_key: Option<(i32, i32)>,
    in_query: bool,
    results: VecDeque<PgResult>,
    assembling: Option<PgResult>,
    described_types: Option<Vec<Oid>>,
}

impl WireProtocol {
    /// Open a non-blocking socket toward the server and return the
    /// mid-handshake session.
    pub(crate) fn start(params: StartupParams) -> Result<Self, ProtocolError> {
        let domain = match params.hostaddr {
            IpAddr::V4(_) => Domain::IPV4,
            IpAddr::V6(_) => Domain::IPV6,
        };

        let socket = RawSocket::new(domain, Type::STREAM, Some(IpProtocol::TCP))
            .map_err(|error| ProtocolError::Connect(error.to_string()))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| ProtocolError::Connect(error.to_string()))?;

        let address = SocketAddr::new(params.hostaddr, params.port);

        match socket.connect(&address.into()) {
            Ok(()) => {}
            Err(error)
                if error.raw_os_error() == Some(libc::EINPROGRESS)
                    || error.kind() == io::ErrorKind::WouldBlock => {}
            Err(error) => return Err(ProtocolError::Connect(error.to_string())),
        }

        tracing::debug!(%address, "connection attempt started");

        Ok(Self {
            params,
            socket: Socket::Plain(socket.into()),
            phase: Phase::Connecting,
            status: ConnectionStatus::Started,
            error: String::new(),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            scram: None,
            parameters: BTreeMap::new(),
            backend_key: None,
            in_query: false,
            results: VecDeque::new(),
            assembling: None,
            described_types: None,
        })
    }

    /// A server run-time parameter observed at startup.
    #[cfg(test)]
    pub(crate) fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    fn fail(&mut self, error: &ProtocolError) {
        self.status = ConnectionStatus::Bad;
        self.phase = Phase::Failed;
        self.error = error.to_string();
    }

    fn queue_startup(&mut self) {
        frontend::startup(
            &self.params.user,
            self.params.database.as_deref(),
            APPLICATION_NAME,
            &mut self.write_buf,
        );
    }

    fn password(&self) -> Result<&str, ProtocolError> {
        match &self.params.security {
            Security::Password(password) => Ok(password),
            Security::Tls(_) => Err(ProtocolError::Server(
                "server requested a password, but none was supplied".into(),
            )),
        }
    }

    /// Write queued bytes until done or the socket pushes back.
    fn try_flush(&mut self) -> io::Result<FlushStatus> {
        while !self.write_buf.is_empty() {
            match self.socket.write(&self.write_buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => self.write_buf.advance(written),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushStatus::Pending)
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            }
        }

        match self.socket.flush() {
            Ok(()) => Ok(FlushStatus::Done),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(FlushStatus::Pending),
            Err(error) => Err(error),
        }
    }

    /// Read whatever the socket has; true when any bytes arrived.
    fn fill_read_buf(&mut self) -> Result<bool, ProtocolError> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut any = false;

        loop {
            match self.socket.read(&mut chunk) {
                Ok(0) => {
                    return Err(ProtocolError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed the connection unexpectedly",
                    )))
                }
                Ok(count) => {
                    self.read_buf.extend_from_slice(&chunk[..count]);
                    any = true;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(any),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn begin_tls(&mut self) -> Result<(), ProtocolError> {
        let Security::Tls(tls) = &self.params.security else {
            return Err(ProtocolError::Violation(
                "TLS accepted without TLS parameters".into(),
            ));
        };

        let connector = build_connector(tls)?;

        let stream = match std::mem::replace(&mut self.socket, Socket::Gone) {
            Socket::Plain(stream) => stream,
            other => {
                self.socket = other;
                return Err(ProtocolError::Violation("TLS negotiated twice".into()));
            }
        };

        match connector.connect(&tls.host, stream) {
            Ok(stream) => {
                self.socket = Socket::Tls(stream);
                self.queue_startup();
                self.phase = Phase::Startup;
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                self.socket = Socket::Handshaking(mid);
                self.phase = Phase::TlsHandshaking;
            }
            Err(HandshakeError::Failure(error)) => return Err(ProtocolError::Tls(error)),
        }

        Ok(())
    }

    /// Advance the handshake until it blocks, completes, or fails.
    fn drive_handshake(&mut self) -> Result<Polling, ProtocolError> {
        loop {
            // queued bytes first; the server will not answer an unsent request
            if !self.write_buf.is_empty() {
                if let FlushStatus::Pending = self.try_flush()? {
                    return Ok(Polling::Writing);
                }
            }

            match self.phase {
                Phase::Connecting => {
                    let stream = self.socket.tcp()?;

                    if let Some(error) = stream.take_error().map_err(ProtocolError::Io)? {
                        return Err(ProtocolError::Connect(error.to_string()));
                    }

                    match stream.peer_addr() {
                        Ok(_) => {
                            match self.params.security {
                                Security::Tls(_) => {
                                    frontend::ssl_request(&mut self.write_buf);
                                    self.phase = Phase::SslRequestSent;
                                }
                                Security::Password(_) => {
                                    self.queue_startup();
                                    self.phase = Phase::Startup;
                                }
                            }
                        }
                        Err(error)
                            if error.kind() == io::ErrorKind::NotConnected
                                || error.raw_os_error() == Some(libc::EINPROGRESS)
                                || error.raw_os_error() == Some(libc::EALREADY) =>
                        {
                            return Ok(Polling::Writing)
                        }
                        Err(error) => return Err(ProtocolError::Connect(error.to_string())),
                    }
                }
                Phase::SslRequestSent => {
                    if self.read_buf.is_empty() && !self.fill_read_buf()? {
                        return Ok(Polling::Reading);
                    }

                    match self.read_buf.split_to(1)[0] {
                        b'S' => self.begin_tls()?,
                        b'N' => {
                            return Err(ProtocolError::Connect(
                                "server does not support TLS".into(),
                            ))
                        }
                        other => {
                            return Err(ProtocolError::Violation(format!(
                                "unexpected TLS response {other:#04x}"
                            )))
                        }
                    }
                }
                Phase::TlsHandshaking => {
                    let mid = match std::mem::replace(&mut self.socket, Socket::Gone) {
                        Socket::Handshaking(mid) => mid,
                        other => {
                            self.socket = other;
                            return Err(ProtocolError::Violation(
                                "TLS handshake without a handshake stream".into(),
                            ));
                        }
                    };

                    match mid.handshake() {
                        Ok(stream) => {
                            self.socket = Socket::Tls(stream);
                            self.queue_startup();
                            self.phase = Phase::Startup;
                        }
                        Err(HandshakeError::WouldBlock(mid)) => {
                            self.socket = Socket::Handshaking(mid);
                            return Ok(Polling::Reading);
                        }
                        Err(HandshakeError::Failure(error)) => {
                            return Err(ProtocolError::Tls(error))
                        }
                    }
                }
                Phase::Startup => match backend::next_message(&mut self.read_buf)? {
                    Some(message) => {
                        if self.handle_startup_message(message)? {
                            return Ok(Polling::Ok);
                        }
                    }
                    None => {
                        if !self.fill_read_buf()? {
                            return Ok(Polling::Reading);
                        }
                    }
                },
                Phase::Ready => return Ok(Polling::Ok),
                Phase::Failed => return Ok(Polling::Failed),
            }
        }
    }

    /// Handle one startup-phase message; true once the session is ready.
    fn handle_startup_message(&mut self, message: backend::Message) -> Result<bool, ProtocolError> {
        match message {
            backend::Message::AuthenticationOk => {
                self.scram = None;
            }
            backend::Message::AuthenticationCleartextPassword => {
                let password = self.password()?.to_owned();
                frontend::password(password.as_bytes(), &mut self.write_buf);
            }
            backend::Message::AuthenticationMd5Password { salt } => {
                let password = self.password()?;
                let hashed = md5_hash(self.params.user.as_bytes(), password.as_bytes(), salt);
                frontend::password(hashed.as_bytes(), &mut self.write_buf);
            }
            backend::Message::AuthenticationSasl { mechanisms } => {
                if !mechanisms.iter().any(|mechanism| mechanism == SCRAM_SHA_256) {
                    return Err(ProtocolError::Violation(format!(
                        "no supported SASL mechanism among {mechanisms:?}"
                    )));
                }

                let password = self.password()?;
                let mut scram =
                    ScramSha256::new(password.as_bytes(), ChannelBinding::unrequested());

                frontend::sasl_initial_response(
                    SCRAM_SHA_256,
                    scram.message(),
                    &mut self.write_buf,
                );
                self.scram = Some(scram);
            }
            backend::Message::AuthenticationSaslContinue { data } => {
                let scram = self
                    .scram
                    .as_mut()
                    .ok_or_else(|| ProtocolError::Violation("SASL continue without exchange".into()))?;

                scram.update(&data)?;
                frontend::sasl_response(scram.message(), &mut self.write_buf);
            }
            backend::Message::AuthenticationSaslFinal { data } => {
                let scram = self
                    .scram
                    .as_mut()
                    .ok_or_else(|| ProtocolError::Violation("SASL final without exchange".into()))?;

                scram.finish(&data)?;
            }
            backend::Message::ErrorResponse {
                severity,
                code,
                message,
            } => {
                return Err(ProtocolError::Server(format_server_error(
                    &severity, &code, &message,
                )))
            }
            backend::Message::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
            }
            backend::Message::BackendKeyData {
                process_id,
                secret_key,
            } => {
                self.backend_key = Some((process_id, secret_key));
            }
            backend::Message::NoticeResponse { message } => {
                tracing::trace!(%message, "server notice during startup");
            }
            backend::Message::ReadyForQuery { .. } => {
                self.phase = Phase::Ready;
                self.status = ConnectionStatus::Ok;
                tracing::debug!(
                    user = %self.params.user,
                    server_version = self.parameters.get("server_version").map(String::as_str),
                    backend_pid = self.backend_key.map(|(pid, _)| pid),
                    "session established"
                );
                return Ok(true);
            }
            backend::Message::Unknown { tag } => {
                tracing::trace!(tag, "ignoring unknown startup message");
            }
            other => {
                return Err(ProtocolError::Violation(format!(
                    "unexpected startup message {other:?}"
                )))
            }
        }

        Ok(false)
    }

    /// Handle one command-phase message.
    fn handle_command_message(&mut self, message: backend::Message) -> Result<(), ProtocolError> {
        match message {
            backend::Message::ParseComplete
            | backend::Message::BindComplete
            | backend::Message::CloseComplete
            | backend::Message::NoData => {}
            backend::Message::RowDescription { columns } => {
                self.assembling = Some(PgResult {
                    columns,
                    ..PgResult::default()
                });
            }
            backend::Message::DataRow { values } => match self.assembling.as_mut() {
                Some(result) => result.rows.push(values),
                None => {
                    return Err(ProtocolError::Violation(
                        "row data without a row description".into(),
                    ))
                }
            },
            backend::Message::CommandComplete { tag } => {
                let mut result = self.assembling.take().unwrap_or_default();
                result.status = Some(if result.columns.is_empty() {
                    ExecStatus::CommandOk
                } else {
                    ExecStatus::TuplesOk
                });
                result.command_tag = Some(tag);
                self.results.push_back(result);
            }
            backend::Message::PortalSuspended => {
                let mut result = self.assembling.take().unwrap_or_default();
                result.status = Some(ExecStatus::TuplesOk);
                self.results.push_back(result);
            }
            backend::Message::EmptyQueryResponse => {
                self.results
                    .push_back(PgResult::with_status(ExecStatus::EmptyQuery));
            }
            backend::Message::ErrorResponse {
                severity,
                code,
                message,
            } => {
                self.assembling = None;
                let text = format_server_error(&severity, &code, &message);
                self.error = text.clone();

                let mut result = PgResult::with_status(ExecStatus::FatalError);
                result.error = Some(text);
                self.results.push_back(result);
            }
            backend::Message::CopyInResponse => {
                self.results
                    .push_back(PgResult::with_status(ExecStatus::CopyIn));
            }
            backend::Message::CopyOutResponse => {
                self.results
                    .push_back(PgResult::with_status(ExecStatus::CopyOut));
            }
            backend::Message::CopyBothResponse => {
                self.results
                    .push_back(PgResult::with_status(ExecStatus::CopyBoth));
            }
            backend::Message::ReadyForQuery { .. } => {
                self.in_query = false;
            }
            backend::Message::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
            }
            backend::Message::ParameterDescription { types } => {
                self.described_types = Some(types);
            }
            backend::Message::NoticeResponse { message } => {
                tracing::trace!(%message, "server notice");
            }
            backend::Message::NotificationResponse => {
                tracing::trace!("ignoring asynchronous notification");
            }
            backend::Message::Unknown { tag } => {
                tracing::trace!(tag, "ignoring unknown message");
            }
            other => {
                return Err(ProtocolError::Violation(format!(
                    "unexpected message {other:?}"
                )))
            }
        }

        Ok(())
    }

    fn process_command_messages(&mut self) -> Result<(), ProtocolError> {
        while let Some(message) = backend::next_message(&mut self.read_buf)? {
            self.handle_command_message(message)?;
        }

        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), ProtocolError> {
        if self.phase != Phase::Ready || self.in_query {
            return Err(ProtocolError::NotReady);
        }

        Ok(())
    }

    fn set_blocking(&mut self, blocking: bool) -> Result<(), ProtocolError> {
        let stream = self.socket.tcp()?;
        stream.set_nonblocking(!blocking)?;
        stream.set_read_timeout(blocking.then_some(self.params.connect_timeout))?;

        Ok(())
    }

    /// Drive one blocking exchange: write everything queued, then read until
    /// the server reports ready again.
    fn blocking_exchange(&mut self) -> Result<VecDeque<PgResult>, ProtocolError> {
        self.assembling = None;
        self.results.clear();
        self.in_query = true;

        while !self.write_buf.is_empty() {
            match self.socket.write(&self.write_buf) {
                Ok(0) => return Err(ProtocolError::Io(io::ErrorKind::WriteZero.into())),
                Ok(written) => self.write_buf.advance(written),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }

        self.socket.flush().map_err(ProtocolError::Io)?;

        let mut chunk = [0u8; READ_CHUNK];

        while self.in_query {
            if let Some(message) = backend::next_message(&mut self.read_buf)? {
                self.handle_command_message(message)?;
                continue;
            }

            match self.socket.read(&mut chunk) {
                Ok(0) => {
                    return Err(ProtocolError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed the connection unexpectedly",
                    )))
                }
                Ok(count) => self.read_buf.extend_from_slice(&chunk[..count]),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }

        // a described statement's row layout stays in `assembling` for the
        // caller to harvest; the next exchange clears it
        Ok(std::mem::take(&mut self.results))
    }

    /// Run a queued command synchronously, restoring non-blocking mode on
    /// every path.
    fn roundtrip(&mut self) -> Result<VecDeque<PgResult>, ProtocolError> {
        self.set_blocking(true)?;

        let outcome = self.blocking_exchange();
        let restored = self.set_blocking(false);

        match outcome {
            Ok(results) => {
                restored?;
                Ok(results)
            }
            Err(error) => {
                self.fail(&error);
                Err(error)
            }
        }
    }
}

impl Protocol for WireProtocol {
    fn status(&self) -> ConnectionStatus {
        self.status
    }

    fn error_message(&self) -> String {
        self.error.clone()
    }

    fn socket(&self) -> Option<RawFd> {
        self.socket.tcp().ok().map(AsRawFd::as_raw_fd)
    }

    fn connect_poll(&mut self) -> Polling {
        match self.drive_handshake() {
            Ok(polling) => polling,
            Err(error) => {
                self.fail(&error);
                Polling::Failed
            }
        }
    }

    fn reset_poll(&mut self) -> Polling {
        if matches!(self.phase, Phase::Ready | Phase::Failed) {
            match Self::start(self.params.clone()) {
                Ok(fresh) => *self = fresh,
                Err(error) => {
                    self.fail(&error);
                    return Polling::Failed;
                }
            }
        }

        self.connect_poll()
    }

    fn flush(&mut self) -> Result<FlushStatus, ProtocolError> {
        match self.try_flush() {
            Ok(status) => Ok(status),
            Err(error) => {
                let error = ProtocolError::Io(error);
                self.fail(&error);
                Err(error)
            }
        }
    }

    fn consume_input(&mut self) -> Result<(), ProtocolError> {
        match self.fill_read_buf() {
            // no new bytes is fine; a spurious readable edge
            Ok(_) => {}
            Err(error) => {
                self.fail(&error);
                return Err(error);
            }
        }

        match self.process_command_messages() {
            Ok(()) => Ok(()),
            Err(error) => {
                self.fail(&error);
                Err(error)
            }
        }
    }

    fn is_busy(&self) -> bool {
        self.results.is_empty() && self.in_query
    }

    fn take_result(&mut self) -> Option<PgResult> {
        self.results.pop_front()
    }

    fn send_query_prepared(&mut self, name: &str, data: &QueryData) -> Result<(), ProtocolError> {
        self.ensure_ready()?;

        frontend::bind("", name, Some(data), &mut self.write_buf);
        frontend::describe_portal("", &mut self.write_buf);
        frontend::execute("", 0, &mut self.write_buf);
        frontend::sync(&mut self.write_buf);
        self.in_query = true;

        // opportunistic flush; leftovers drain through the writable poll
        match self.try_flush() {
            Ok(_) => Ok(()),
            Err(error) => {
                let error = ProtocolError::Io(error);
                self.fail(&error);
                Err(error)
            }
        }
    }

    fn exec_params(
        &mut self,
        query: &str,
        data: Option<&QueryData>,
    ) -> Result<PgResult, ProtocolError> {
        self.ensure_ready()?;

        let types = data.map(|data| data.types().to_vec()).unwrap_or_default();

        frontend::parse("", query, &types, &mut self.write_buf);
        frontend::bind("", "", data, &mut self.write_buf);
        frontend::describe_portal("", &mut self.write_buf);
        frontend::execute("", 0, &mut self.write_buf);
        frontend::sync(&mut self.write_buf);

        let mut results = self.roundtrip()?;

        results
            .pop_back()
            .ok_or_else(|| ProtocolError::Violation("command finished without a result".into()))
    }

    fn prepare(
        &mut self,
        name: &str,
        query: &str,
        types: &[Oid],
    ) -> Result<PgResult, ProtocolError> {
        self.ensure_ready()?;

        frontend::parse(name, query, types, &mut self.write_buf);
        frontend::sync(&mut self.write_buf);

        let mut results = self.roundtrip()?;

        // a clean parse produces no result frame of its own
        Ok(results
            .pop_front()
            .unwrap_or_else(|| PgResult::with_status(ExecStatus::CommandOk)))
    }

    fn describe_prepared(&mut self, name: &str) -> Result<PgResult, ProtocolError> {
        self.ensure_ready()?;
        self.described_types = None;

        frontend::describe_statement(name, &mut self.write_buf);
        frontend::sync(&mut self.write_buf);

        let mut results = self.roundtrip()?;

        if let Some(result) = results.pop_front() {
            return Ok(result);
        }

        let mut result = PgResult::with_status(ExecStatus::CommandOk);
        result.parameter_types = self.described_types.take().unwrap_or_default();

        // the description's row layout dangles as an unfinished result
        if let Some(description) = self.assembling.take() {
            result.columns = description.columns;
        }

        Ok(result)
    }
}

impl Drop for WireProtocol {
    fn drop(&mut self) {
        if self.phase == Phase::Ready {
            let mut bytes = BytesMut::new();
            frontend::terminate(&mut bytes);
            let _ = self.socket.write(&bytes);
        }
    }
}

fn format_server_error(severity: &str, code: &str, message: &str) -> String {
    if severity.is_empty() {
        format!("{code}: {message}")
    } else {
        format!("{severity} ({code}): {message}")
    }
}

fn build_connector(tls: &TlsParams) -> Result<TlsConnector, ProtocolError> {
    let certificate = fs::read(&tls.certificate)?;
    let private_key = fs::read(&tls.private_key)?;
    let identity = Identity::from_pkcs8(&certificate, &private_key)?;

    let mut builder = TlsConnector::builder();
    builder.identity(identity);

    match &tls.ca_bundle {
        Some(path) => {
            builder.add_root_certificate(Certificate::from_pem(&fs::read(path)?)?);
        }
        None => {
            // encrypt without verification when no authority is supplied
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
    }

    Ok(builder.build()?)
}

#[cfg(test)]
mod test {
    use super::{Phase, WireProtocol};
    use crate::params::QueryData;
    use crate::protocol::{ExecStatus, Polling, Protocol, Security, StartupParams};
    use bytes::{BufMut, BytesMut};
    use std::io::{Read, Write};
    use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
    use std::time::Duration;

    fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut bytes = BytesMut::new();
        bytes.put_u8(tag);
        bytes.put_i32(4 + body.len() as i32);
        bytes.put_slice(body);
        bytes.to_vec()
    }

    fn ready_for_query() -> Vec<u8> {
        frame(b'Z', b"I")
    }

    /// Read from the peer until the buffer ends with a Sync frame.
    fn read_until_sync(stream: &mut TcpStream) -> Vec<u8> {
        let mut seen = Vec::new();
        let mut chunk = [0u8; 1024];

        while !seen.ends_with(b"S\x00\x00\x00\x04") {
            let count = stream.read(&mut chunk).expect("client bytes");
            assert_ne!(count, 0, "client closed mid-command");
            seen.extend_from_slice(&chunk[..count]);
        }

        seen
    }

    fn drive_to_ready(protocol: &mut WireProtocol) {
        for _ in 0..200 {
            match protocol.connect_poll() {
                Polling::Ok => return,
                Polling::Reading | Polling::Writing => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Polling::Failed => panic!("handshake failed: {}", protocol.error_message()),
            }
        }

        panic!("handshake did not settle");
    }

    #[test]
    fn performs_password_startup_and_binary_query() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
        let port = listener.local_addr().expect("address").port();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("timeout");

            // startup message: length-prefixed, no tag byte
            let mut prefix = [0u8; 4];
            stream.read_exact(&mut prefix).expect("startup length");
            let length = i32::from_be_bytes(prefix) as usize;
            let mut startup = vec![0u8; length - 4];
            stream.read_exact(&mut startup).expect("startup body");
            assert!(startup
                .windows(7)
                .any(|window| window == b"user\0u\0"));

            // demand a cleartext password
            stream
                .write_all(&frame(b'R', &3i32.to_be_bytes()))
                .expect("auth request");

            let mut tag = [0u8; 5];
            stream.read_exact(&mut tag).expect("password frame");
            assert_eq!(tag[0], b'p');
            let length = i32::from_be_bytes(tag[1..5].try_into().unwrap()) as usize;
            let mut password = vec![0u8; length - 4];
            stream.read_exact(&mut password).expect("password body");
            assert_eq!(&password, b"sekret\0");

            let mut session = Vec::new();
            session.extend_from_slice(&frame(b'R', &0i32.to_be_bytes()));
            session.extend_from_slice(&frame(b'S', b"server_version\x0016.1\0"));
            session.extend_from_slice(&frame(b'K', &[0, 0, 0, 9, 0, 0, 0, 7]));
            session.extend_from_slice(&ready_for_query());
            stream.write_all(&session).expect("session established");

            // one extended query: reply with a single binary row
            read_until_sync(&mut stream);

            let mut row_description = BytesMut::new();
            row_description.put_i16(1);
            row_description.put_slice(b"value\0");
            row_description.put_i32(0);
            row_description.put_i16(0);
            row_description.put_u32(23);
            row_description.put_i16(4);
            row_description.put_i32(-1);
            row_description.put_i16(1);

            let mut data_row = BytesMut::new();
            data_row.put_i16(1);
            data_row.put_i32(4);
            data_row.put_slice(&7i32.to_be_bytes());

            let mut reply = Vec::new();
            reply.extend_from_slice(&frame(b'1', b""));
            reply.extend_from_slice(&frame(b'2', b""));
            reply.extend_from_slice(&frame(b'T', &row_description));
            reply.extend_from_slice(&frame(b'D', &data_row));
            reply.extend_from_slice(&frame(b'C', b"SELECT 1\0"));
            reply.extend_from_slice(&ready_for_query());
            stream.write_all(&reply).expect("query reply");
        });

        let mut protocol = WireProtocol::start(StartupParams {
            hostaddr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            user: "u".into(),
            database: None,
            connect_timeout: Duration::from_secs(5),
            security: Security::Password("sekret".into()),
        })
        .expect("connection start");

        drive_to_ready(&mut protocol);
        assert_eq!(protocol.parameter("server_version"), Some("16.1"));

        let result = protocol
            .exec_params("SELECT 7", Some(&QueryData::default()))
            .expect("query result");

        assert_eq!(result.exec_status(), ExecStatus::TuplesOk);
        assert_eq!(result.columns.len(), 1);
        assert_eq!(result.columns[0].name, "value");
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][0].as_deref(), Some(&7i32.to_be_bytes()[..]));
        assert_eq!(protocol.phase, Phase::Ready);
        assert!(!protocol.is_busy());

        server.join().expect("server thread");
    }

    #[test]
    fn surfaces_server_rejection_during_startup() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
        let port = listener.local_addr().expect("address").port();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("timeout");

            let mut prefix = [0u8; 4];
            stream.read_exact(&mut prefix).expect("startup length");
            let length = i32::from_be_bytes(prefix) as usize;
            let mut startup = vec![0u8; length - 4];
            stream.read_exact(&mut startup).expect("startup body");

            stream
                .write_all(&frame(
                    b'E',
                    b"SFATAL\0C28000\0Mrole \"u\" does not exist\0\0",
                ))
                .expect("rejection");
        });

        let mut protocol = WireProtocol::start(StartupParams {
            hostaddr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            user: "u".into(),
            database: Some("app".into()),
            connect_timeout: Duration::from_secs(5),
            security: Security::Password("sekret".into()),
        })
        .expect("connection start");

        for _ in 0..200 {
            match protocol.connect_poll() {
                Polling::Failed => {
                    let message = protocol.error_message();
                    assert!(message.contains("role \"u\" does not exist"), "{message}");
                    server.join().expect("server thread");
                    return;
                }
                _ => std::thread::sleep(Duration::from_millis(5)),
            }
        }

        panic!("rejection never surfaced");
    }
}
