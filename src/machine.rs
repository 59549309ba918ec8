//! The per-attempt connection state machine.
//!
//! One machine owns one protocol handle for its whole life: it is created
//! mid-handshake while the hostname resolves, advances through the
//! readiness-polled handshake, serves commands once established, and is
//! destroyed on the way out. Teardown is ordered: the poll registration
//! stops first, then the duplicated descriptor closes, then the protocol
//! handle finalizes, and the machine itself is only released once the loop
//! acknowledges the poll handle's close.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::rc::{Rc, Weak};

use crate::configuration::Options;
use crate::connection::{
    self, Context, ExecuteHandler, RequestId, Shared, INVALID_REQUEST_ID,
};
use crate::error::Error;
use crate::event::{Events, Interest, PollCallback, TimerHandle, STATUS_UNREACHABLE};
use crate::params::{Oid, QueryData};
use crate::poller::Poller;
use crate::protocol::{
    ConnectionStatus, ExecStatus, FlushStatus, Polling, Protocol, Security, StartupParams,
    TlsParams,
};
use crate::recordset::Recordset;
use crate::resolver::ResolveToken;
use crate::tls::MaterialPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Connecting,
    Connected,
    Disconnecting,
}

/// Which loop the shared poll callback dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollPhase {
    Handshake,
    Command,
}

pub(crate) struct Machine {
    facade: Weak<RefCell<Shared>>,
    context: Context,
    options: Options,
    host: String,
    tls_paths: Option<MaterialPaths>,
    state: State,
    phase: PollPhase,
    protocol: Option<Box<dyn Protocol>>,
    fd: Option<OwnedFd>,
    poller: Option<Poller>,
    dns_token: Option<ResolveToken>,
    connect_timer: Box<dyn TimerHandle>,
    execute_handler: Option<ExecuteHandler>,
    request_id: RequestId,
    busy: bool,
    prepared_types: HashMap<String, Vec<Oid>>,
}

impl Machine {
    /// Begin a connection attempt: arm the connect deadline and kick off
    /// hostname resolution. Everything further happens from callbacks.
    pub(crate) fn start(shared: &Rc<RefCell<Shared>>) -> Rc<RefCell<Machine>> {
        let (context, options, host, tls_paths) = {
            let shared = shared.borrow();
            let host = shared
                .options
                .hosts
                .get(shared.host_index)
                .cloned()
                .unwrap_or_default();
            let tls_paths = if shared.options.ssl_options.allow {
                shared.tls.paths()
            } else {
                None
            };

            (shared.context.clone(), shared.options.clone(), host, tls_paths)
        };

        let connect_timer = context.event_loop.timer();

        let machine = Rc::new(RefCell::new(Machine {
            facade: Rc::downgrade(shared),
            context,
            options,
            host,
            tls_paths,
            state: State::Connecting,
            phase: PollPhase::Handshake,
            protocol: None,
            fd: None,
            poller: None,
            dns_token: None,
            connect_timer,
            execute_handler: None,
            request_id: INVALID_REQUEST_ID,
            busy: false,
            prepared_types: HashMap::new(),
        }));

        // the deadline spans resolution and handshake
        {
            let guard = machine.borrow();
            let weak = Rc::downgrade(&machine);
            let armed = guard.connect_timer.restart(
                guard.options.connect_timeout,
                Box::new(move || {
                    if let Some(machine) = weak.upgrade() {
                        Machine::reconnect(&machine, Error::ConnectTimeout);
                    }
                }),
            );

            if !armed {
                tracing::warn!("unable to arm connect timer");
            }
        }

        let token = {
            let guard = machine.borrow();
            let weak = Rc::downgrade(&machine);
            let host = guard.host.clone();

            guard.context.resolver.resolve(
                &guard.host,
                Box::new(move |addresses| {
                    let Some(machine) = weak.upgrade() else {
                        return;
                    };

                    machine.borrow_mut().dns_token = None;

                    if machine.borrow().facade.strong_count() == 0 {
                        return;
                    }

                    match addresses.first() {
                        Some(&address) => Machine::connect(&machine, address),
                        None => Machine::reconnect(&machine, Error::ResolveHost(host)),
                    }
                }),
            )
        };

        machine.borrow_mut().dns_token = Some(token);

        machine
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy
    }

    pub(crate) fn current_request_id(&self) -> RequestId {
        self.request_id
    }

    pub(crate) fn current_execute_handler(&self) -> Option<ExecuteHandler> {
        self.execute_handler.clone()
    }

    #[cfg(test)]
    pub(crate) fn cached_parameter_types(&self, name: &str) -> Option<Vec<Oid>> {
        self.prepared_types.get(name).cloned()
    }

    fn startup_params(&self, address: IpAddr) -> StartupParams {
        StartupParams {
            hostaddr: address,
            port: self.options.port,
            user: self.options.user_name.clone(),
            database: (!self.options.database_name.is_empty())
                .then(|| self.options.database_name.clone()),
            connect_timeout: self.options.connect_timeout,
            security: match &self.tls_paths {
                Some(paths) => Security::Tls(TlsParams {
                    host: self.host.clone(),
                    certificate: paths.certificate.clone(),
                    private_key: paths.private_key.clone(),
                    ca_bundle: paths.ca_bundle.clone(),
                }),
                None => Security::Password(self.options.password.clone()),
            },
        }
    }

    /// Open the protocol session toward a resolved address and register
    /// its socket with the loop.
    fn connect(machine: &Rc<RefCell<Machine>>, address: IpAddr) {
        if let Err(error) = Self::try_connect(machine, address) {
            Self::reconnect(machine, error);
        }
    }

    fn try_connect(machine: &Rc<RefCell<Machine>>, address: IpAddr) -> Result<(), Error> {
        {
            let mut guard = machine.borrow_mut();
            let m = &mut *guard;

            let params = m.startup_params(address);
            let protocol = m
                .context
                .protocols
                .start(&params)
                .map_err(|error| Error::ConnectFailed(error.to_string()))?;

            if protocol.status() == ConnectionStatus::Bad {
                return Err(Error::ConnectFailed(protocol.error_message()));
            }

            let fd = protocol.socket().ok_or(Error::SocketDescriptor)?;

            // the registration outlives the protocol's own descriptor
            let duplicated = unsafe { BorrowedFd::borrow_raw(fd) }
                .try_clone_to_owned()
                .map_err(Error::DuplicateDescriptor)?;

            if let Err(error) = m
                .options
                .socket_options
                .apply(unsafe { BorrowedFd::borrow_raw(fd) })
            {
                tracing::warn!(%error, "unable to apply socket options");
            }

            let callback: PollCallback = {
                let weak = Rc::downgrade(machine);
                Rc::new(move |status, events| {
                    if let Some(machine) = weak.upgrade() {
                        Machine::on_poll(&machine, status, events);
                    }
                })
            };

            let poller =
                Poller::register(&*m.context.event_loop, duplicated.as_raw_fd(), callback)?;

            m.protocol = Some(protocol);
            m.fd = Some(duplicated);
            m.poller = Some(poller);
        }

        Self::poll_connection(machine)
    }

    /// Shared poll callback, dispatched on the machine's current phase.
    fn on_poll(machine: &Rc<RefCell<Machine>>, status: i32, events: Events) {
        let phase = machine.borrow().phase;

        if status < 0 {
            let error = match phase {
                PollPhase::Handshake if status == STATUS_UNREACHABLE => {
                    let message = machine
                        .borrow()
                        .protocol
                        .as_ref()
                        .map(|protocol| protocol.error_message())
                        .unwrap_or_default();

                    Error::Unreachable(message)
                }
                _ => Error::PollStatus(status),
            };

            Self::reconnect(machine, error);
            return;
        }

        if events.unexpected() {
            Self::reconnect(machine, Error::UnexpectedEvents(events.bits()));
            return;
        }

        let result = match phase {
            PollPhase::Handshake => Self::poll_connection(machine),
            PollPhase::Command => Self::poll_commands(machine, events),
        };

        if let Err(error) = result {
            Self::reconnect(machine, error);
        }
    }

    /// Advance the handshake one readiness edge.
    fn poll_connection(machine: &Rc<RefCell<Machine>>) -> Result<(), Error> {
        let call_connected = {
            let mut guard = machine.borrow_mut();
            let m = &mut *guard;

            let polling = {
                let protocol = m.protocol.as_mut().ok_or(Error::InvalidState)?;

                match m.state {
                    State::Connecting => protocol.connect_poll(),
                    State::Disconnecting => protocol.reset_poll(),
                    State::Connected => return Err(Error::InvalidState),
                }
            };

            match polling {
                Polling::Reading => {
                    m.poller
                        .as_mut()
                        .ok_or(Error::InvalidState)?
                        .start(Interest::READABLE)?;
                    false
                }
                Polling::Writing => {
                    m.poller
                        .as_mut()
                        .ok_or(Error::InvalidState)?
                        .start(Interest::WRITABLE)?;
                    false
                }
                Polling::Ok => {
                    m.connect_timer.stop();
                    m.state = State::Connected;
                    m.phase = PollPhase::Command;
                    m.poller
                        .as_mut()
                        .ok_or(Error::InvalidState)?
                        .start(Interest::both())?;

                    tracing::debug!(host = %m.host, "connected");

                    m.facade.strong_count() > 0
                        && m.protocol
                            .as_ref()
                            .is_some_and(|protocol| protocol.status() == ConnectionStatus::Ok)
                }
                Polling::Failed => {
                    let message = m
                        .protocol
                        .as_ref()
                        .map(|protocol| protocol.error_message())
                        .unwrap_or_default();

                    return Err(Error::PollingFailed(message));
                }
            }
        };

        if call_connected {
            let facade = machine.borrow().facade.upgrade();

            if let Some(shared) = facade {
                let handler = shared.borrow_mut().connected.take();

                if let Some(mut handler) = handler {
                    let outcome = handler();

                    {
                        let mut state = shared.borrow_mut();
                        if state.connected.is_none() {
                            state.connected = Some(handler);
                        }
                    }

                    outcome?;
                }
            }
        }

        Ok(())
    }

    /// Serve one readiness edge of the command loop.
    fn poll_commands(machine: &Rc<RefCell<Machine>>, events: Events) -> Result<(), Error> {
        let finished = {
            let mut guard = machine.borrow_mut();
            let m = &mut *guard;

            let poller = m.poller.as_mut().ok_or(Error::InvalidState)?;
            let protocol = m.protocol.as_mut().ok_or(Error::InvalidState)?;
            let mut interest = poller.interest();

            if events.is_writable() {
                match protocol.flush() {
                    Ok(FlushStatus::Done) => interest = interest.remove(Interest::WRITABLE),
                    Ok(FlushStatus::Pending) => interest = interest.add(Interest::both()),
                    Err(error) => return Err(Error::FlushFailed(error.to_string())),
                }
            }

            let mut finished = None;

            if events.is_readable() {
                protocol
                    .consume_input()
                    .map_err(|error| Error::ReceiveFailed(error.to_string()))?;

                if !protocol.is_busy() {
                    if let Some(result) = protocol.take_result() {
                        let status = result.exec_status();

                        if status != ExecStatus::TuplesOk && status != ExecStatus::CommandOk {
                            while protocol.take_result().is_some() {}

                            let message = result
                                .error
                                .clone()
                                .unwrap_or_else(|| protocol.error_message());

                            finished = Some((
                                Err(Error::ExecuteFailed(message)),
                                Recordset::new(result),
                            ));
                        } else if protocol.take_result().is_some() {
                            return Err(Error::MoreResults);
                        } else {
                            finished = Some((Ok(()), Recordset::new(result)));
                        }
                    }
                }
            }

            poller.ensure(interest)?;

            finished
        };

        if let Some((outcome, recordset)) = finished {
            Self::finish_request(machine, outcome, recordset);
        }

        Ok(())
    }

    /// Complete the in-flight execution and hand the outcome to its
    /// handler outside any machine borrow.
    fn finish_request(
        machine: &Rc<RefCell<Machine>>,
        outcome: Result<(), Error>,
        recordset: Recordset,
    ) {
        let handler = {
            let mut m = machine.borrow_mut();
            m.busy = false;
            m.request_id = INVALID_REQUEST_ID;
            m.execute_handler.take()
        };

        if let Some(handler) = handler {
            match outcome {
                Ok(()) => (*handler)(Ok(recordset)),
                Err(error) => (*handler)(Err(error)),
            }
        }
    }

    /// Execute a parameterized query synchronously.
    pub(crate) fn execute(
        machine: &Rc<RefCell<Machine>>,
        query: &str,
        data: Option<&QueryData>,
        result: Option<&mut Recordset>,
    ) -> Result<(), Error> {
        let mut guard = machine.borrow_mut();
        let m = &mut *guard;

        if m.state != State::Connected {
            return Err(Error::Disconnected);
        }

        if m.busy {
            return Err(Error::Busy);
        }

        let protocol = m.protocol.as_mut().ok_or(Error::Disconnected)?;

        let outcome = protocol
            .exec_params(query, data)
            .map_err(|error| Error::ExecuteFailed(error.to_string()))?;

        match outcome.exec_status() {
            ExecStatus::EmptyQuery | ExecStatus::CommandOk => Ok(()),
            ExecStatus::TuplesOk => {
                if let Some(result) = result {
                    *result = Recordset::new(outcome);
                }
                Ok(())
            }
            ExecStatus::NonfatalError | ExecStatus::BadResponse | ExecStatus::FatalError => {
                Err(Error::ExecuteFailed(
                    outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| protocol.error_message()),
                ))
            }
            _ => Err(Error::UnsupportedQuery),
        }
    }

    /// Create a named prepared statement synchronously, caching the
    /// server's parameter description on success.
    pub(crate) fn prepare(
        machine: &Rc<RefCell<Machine>>,
        name: &str,
        query: &str,
        types: &[Oid],
    ) -> Result<(), Error> {
        let mut guard = machine.borrow_mut();
        let m = &mut *guard;

        if m.state != State::Connected {
            return Err(Error::Disconnected);
        }

        if m.busy {
            return Err(Error::Busy);
        }

        let protocol = m.protocol.as_mut().ok_or(Error::Disconnected)?;

        let outcome = protocol
            .prepare(name, query, types)
            .map_err(|error| Error::ExecuteFailed(error.to_string()))?;

        match outcome.exec_status() {
            ExecStatus::CommandOk => {
                match protocol.describe_prepared(name) {
                    Ok(description) if description.exec_status() == ExecStatus::CommandOk => {
                        m.prepared_types
                            .insert(name.to_owned(), description.parameter_types);
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::debug!(%error, statement = name, "statement description failed");
                    }
                }

                Ok(())
            }
            ExecStatus::NonfatalError | ExecStatus::BadResponse | ExecStatus::FatalError => {
                Err(Error::ExecuteFailed(
                    outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| protocol.error_message()),
                ))
            }
            _ => Err(Error::UnsupportedQuery),
        }
    }

    /// Queue a prepared-statement execution. Preconditions and failures
    /// are reported through `handler`.
    pub(crate) fn execute_prepared(
        machine: &Rc<RefCell<Machine>>,
        name: &str,
        data: Option<&QueryData>,
        handler: ExecuteHandler,
        request_id: RequestId,
    ) {
        let failure = {
            let mut guard = machine.borrow_mut();
            let m = &mut *guard;

            let sent = (|| {
                if m.state != State::Connected {
                    return Err(Error::Disconnected);
                }

                if m.busy {
                    return Err(Error::Busy);
                }

                if m.options.check_query_parameters {
                    if let Some(data) = data {
                        if let Some(expected) = m.prepared_types.get(name) {
                            validate_parameters(expected, data)?;
                        }
                    }
                }

                let protocol = m.protocol.as_mut().ok_or(Error::Disconnected)?;
                let empty = QueryData::default();

                protocol
                    .send_query_prepared(name, data.unwrap_or(&empty))
                    .map_err(|error| Error::ExecuteFailed(error.to_string()))
            })();

            match sent {
                Ok(()) => {
                    m.execute_handler = Some(handler.clone());
                    m.request_id = request_id;
                    m.busy = true;

                    // any unsent tail of the request rides the writable edge
                    let armed = m
                        .poller
                        .as_mut()
                        .ok_or(Error::InvalidState)
                        .and_then(|poller| poller.ensure(Interest::both()).map_err(Error::from));

                    match armed {
                        Ok(()) => None,
                        Err(error) => {
                            m.execute_handler = None;
                            m.request_id = INVALID_REQUEST_ID;
                            m.busy = false;
                            Some(error)
                        }
                    }
                }
                Err(error) => Some(error),
            }
        };

        if let Some(error) = failure {
            (*handler)(Err(error));
        }
    }

    /// Tear the machine down. Idempotent; only the call that still holds
    /// the façade link performs the teardown. Returns the in-flight
    /// execution handler, if any, so the caller can complete it.
    pub(crate) fn disconnect(machine: &Rc<RefCell<Machine>>) -> Option<ExecuteHandler> {
        let (shared, pending, teardown) = {
            let mut guard = machine.borrow_mut();
            let m = &mut *guard;

            m.state = State::Disconnecting;

            let Some(shared) = m.facade.upgrade() else {
                return None;
            };
            m.facade = Weak::new();

            let pending = if m.busy {
                m.busy = false;
                m.request_id = INVALID_REQUEST_ID;
                m.execute_handler.take()
            } else {
                None
            };

            if let Some(token) = m.dns_token.take() {
                m.context.resolver.cancel(token, false);
            }

            m.connect_timer.stop();
            m.prepared_types.clear();

            let teardown = m
                .protocol
                .is_some()
                .then(|| (m.poller.take(), m.fd.take(), m.protocol.take()));

            (shared, pending, teardown)
        };

        shared.borrow_mut().machine = None;

        if let Some((poller, fd, protocol)) = teardown {
            match poller {
                Some(poller) => {
                    poller.stop();
                    drop(fd);
                    drop(protocol);

                    // the machine survives until the loop lets go of the
                    // poll handle
                    let retained = Rc::clone(machine);
                    poller.close(Box::new(move || drop(retained)));
                }
                None => {
                    drop(fd);
                    drop(protocol);
                }
            }
        }

        pending
    }

    /// The sole failure path once a machine exists: tear down, then notify
    /// the façade and (if configured) schedule a fresh attempt.
    pub(crate) fn reconnect(machine: &Rc<RefCell<Machine>>, error: Error) {
        tracing::debug!(%error, "connection lost");

        let facade = machine.borrow().facade.upgrade();

        let pending = Self::disconnect(machine);
        if let Some(handler) = pending {
            (*handler)(Err(Error::Disconnected));
        }

        if let Some(shared) = facade {
            let auto_reconnect = shared.borrow().options.auto_reconnect;
            if auto_reconnect {
                if let Err(timer_error) = connection::start_reconnect_timer(&shared) {
                    tracing::warn!(error = %timer_error, "unable to schedule reconnect");
                }
            }

            let sink = shared.borrow_mut().error_handler.take();
            if let Some(mut sink) = sink {
                sink(&error);

                let mut state = shared.borrow_mut();
                if state.error_handler.is_none() {
                    state.error_handler = Some(sink);
                }
            }

            let handler = shared.borrow_mut().disconnected.take();
            if let Some(mut handler) = handler {
                handler(Err(error));

                let mut state = shared.borrow_mut();
                if state.disconnected.is_none() {
                    state.disconnected = Some(handler);
                }
            }
        }
    }
}

/// Check declared parameter OIDs against a statement's server-described
/// types.
fn validate_parameters(expected: &[Oid], data: &QueryData) -> Result<(), Error> {
    if data.count() != expected.len() {
        return Err(Error::ParameterCount);
    }

    for (index, (&declared, &expected_oid)) in data.types().iter().zip(expected).enumerate() {
        if declared != 0 && declared != expected_oid {
            return Err(Error::ParameterType {
                declared,
                index,
                expected: expected_oid,
            });
        }
    }

    Ok(())
}
