//! The public connection façade.
//!
//! A [`Connection`] keeps its identity, configuration, handlers, and staged
//! TLS credentials across reconnect cycles, while each connection attempt
//! lives in its own state machine underneath. The façade constructs a
//! machine at initialization, replaces it from the reconnect timer after a
//! failure, and forwards query calls to whichever machine is attached.

use std::cell::RefCell;
use std::rc::Rc;
use uuid::Uuid;

use crate::configuration::Options;
use crate::error::Error;
use crate::event::{EventLoop, TimerHandle};
use crate::machine::Machine;
use crate::params::{Oid, QueryData};
use crate::protocol::ProtocolFactory;
use crate::recordset::Recordset;
use crate::resolver::Resolver;
use crate::tls::{self, TlsMaterial};

/// Stable identity of a logical connection across reconnects.
pub type ConnectionId = Uuid;

/// Caller-chosen identifier correlating an asynchronous execution with its
/// completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Sentinel for "no request in flight".
pub const INVALID_REQUEST_ID: RequestId = RequestId(u64::MAX);

/// Invoked once the session is established; a returned error tears the
/// connection back down.
pub type ConnectedHandler = Box<dyn FnMut() -> Result<(), Error>>;

/// Invoked once per connection attempt outcome: `Ok(())` for a graceful
/// close, the error otherwise.
pub type DisconnectedHandler = Box<dyn FnMut(Result<(), Error>)>;

/// Optional sink observing transient connection errors before the
/// disconnected handler runs.
pub type ErrorHandler = Box<dyn FnMut(&Error)>;

/// Completion callback of an asynchronous execution; invoked exactly once
/// per issued execution.
pub type ExecuteHandler = Rc<dyn Fn(Result<Recordset, Error>)>;

/// Host collaborators a connection is built over.
#[derive(Clone)]
pub(crate) struct Context {
    pub(crate) event_loop: Rc<dyn EventLoop>,
    pub(crate) resolver: Rc<dyn Resolver>,
    pub(crate) protocols: Rc<dyn ProtocolFactory>,
}

/// State shared between the façade and its machines.
pub(crate) struct Shared {
    pub(crate) id: ConnectionId,
    pub(crate) options: Options,
    pub(crate) host_index: usize,
    pub(crate) connected: Option<ConnectedHandler>,
    pub(crate) disconnected: Option<DisconnectedHandler>,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) machine: Option<Rc<RefCell<Machine>>>,
    pub(crate) reconnect_timer: Box<dyn TimerHandle>,
    pub(crate) tls: TlsMaterial,
    pub(crate) context: Context,
}

/// One logical connection to a PostgreSQL server.
pub struct Connection {
    shared: Rc<RefCell<Shared>>,
}

impl Connection {
    /// Build an idle connection over the host's event loop, resolver, and
    /// protocol engine. Nothing happens until [`Connection::initialize`].
    pub fn new(
        event_loop: Rc<dyn EventLoop>,
        resolver: Rc<dyn Resolver>,
        protocols: Rc<dyn ProtocolFactory>,
    ) -> Self {
        let reconnect_timer = event_loop.timer();

        Self {
            shared: Rc::new(RefCell::new(Shared {
                id: ConnectionId::nil(),
                options: Options::default(),
                host_index: 0,
                connected: None,
                disconnected: None,
                error_handler: None,
                machine: None,
                reconnect_timer,
                tls: TlsMaterial::default(),
                context: Context {
                    event_loop,
                    resolver,
                    protocols,
                },
            })),
        }
    }

    /// Tear down any existing state and begin a fresh connection attempt
    /// with the given configuration and handlers.
    ///
    /// When TLS is allowed the credentials are staged here, and an empty
    /// user name is derived from the client certificate's common name.
    #[tracing::instrument(skip_all, fields(id = %id, host_index = host_index))]
    pub fn initialize(
        &self,
        id: ConnectionId,
        options: Options,
        host_index: usize,
        connected: ConnectedHandler,
        disconnected: DisconnectedHandler,
    ) -> Result<(), Error> {
        self.destroy();

        if host_index >= options.hosts.len() {
            return Err(Error::HostIndex {
                index: host_index,
                count: options.hosts.len(),
            });
        }

        {
            let mut shared = self.shared.borrow_mut();
            shared.id = id;
            shared.options = options;
            shared.host_index = host_index;
            shared.connected = Some(connected);
            shared.disconnected = Some(disconnected);

            if shared.options.ssl_options.allow {
                let Shared { tls, options, .. } = &mut *shared;

                tls.stage(&options.ssl_options).map_err(Error::Initialize)?;

                if options.user_name.is_empty() {
                    options.user_name = tls::certificate_common_name(
                        options.ssl_options.certificate_pem_data.as_bytes(),
                    )
                    .map_err(Error::Initialize)?;
                }
            }
        }

        let machine = Machine::start(&self.shared);
        self.shared.borrow_mut().machine = Some(machine);

        Ok(())
    }

    /// Gracefully tear everything down: stop the reconnect timer, detach
    /// and destroy the machine, notify the disconnected handler with
    /// success, and clear configuration and staged credentials. The façade
    /// is reusable afterwards.
    pub fn destroy(&self) {
        let machine = {
            let shared = self.shared.borrow();
            shared.reconnect_timer.stop();
            shared.machine.clone()
        };

        if let Some(machine) = machine {
            // an in-flight execution still gets its completion
            if let Some(pending) = Machine::disconnect(&machine) {
                (*pending)(Err(Error::Disconnected));
            }

            let handler = self.shared.borrow_mut().disconnected.take();
            if let Some(mut handler) = handler {
                handler(Ok(()));
            }
        }

        let mut shared = self.shared.borrow_mut();
        shared.connected = None;
        shared.disconnected = None;
        shared.machine = None;
        shared.options = Options::default();
        shared.host_index = 0;
        shared.id = ConnectionId::nil();
        shared.tls.clear();
    }

    /// The connection's identity.
    pub fn id(&self) -> ConnectionId {
        self.shared.borrow().id
    }

    /// A copy of the active configuration.
    pub fn options(&self) -> Options {
        self.shared.borrow().options.clone()
    }

    /// Index of the configured host this connection targets.
    pub fn host_index(&self) -> usize {
        self.shared.borrow().host_index
    }

    /// The hostname this connection targets.
    pub fn host(&self) -> Option<String> {
        let shared = self.shared.borrow();
        shared.options.hosts.get(shared.host_index).cloned()
    }

    /// True while a machine is attached and its session is established.
    pub fn is_valid(&self) -> bool {
        self.shared
            .borrow()
            .machine
            .as_ref()
            .is_some_and(|machine| machine.borrow().is_connected())
    }

    /// True while an asynchronous execution is in flight.
    pub fn is_busy(&self) -> bool {
        self.shared
            .borrow()
            .machine
            .as_ref()
            .is_some_and(|machine| machine.borrow().is_busy())
    }

    /// The request id of the in-flight execution, or
    /// [`INVALID_REQUEST_ID`].
    pub fn current_request_id(&self) -> RequestId {
        self.shared
            .borrow()
            .machine
            .as_ref()
            .map_or(INVALID_REQUEST_ID, |machine| {
                machine.borrow().current_request_id()
            })
    }

    /// The completion handler of the in-flight execution, when one is
    /// pending.
    pub fn current_execute_handler(&self) -> Option<ExecuteHandler> {
        self.shared
            .borrow()
            .machine
            .as_ref()
            .and_then(|machine| machine.borrow().current_execute_handler())
    }

    /// Register a sink observing transient connection errors.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        self.shared.borrow_mut().error_handler = Some(handler);
    }

    /// Execute a parameterized query synchronously, blocking the loop for
    /// the round trip. Rows, if any, land in `result`.
    pub fn execute(
        &self,
        query: &str,
        data: Option<&QueryData>,
        mut result: Option<&mut Recordset>,
    ) -> Result<(), Error> {
        if let Some(result) = result.as_deref_mut() {
            result.clear();
        }

        let machine = self.shared.borrow().machine.clone();

        match machine {
            Some(machine) => Machine::execute(&machine, query, data, result),
            None => Err(Error::Disconnected),
        }
    }

    /// Create a named prepared statement synchronously. On success the
    /// server's parameter description is cached for execution-time
    /// validation.
    pub fn prepare(&self, name: &str, query: &str, types: &[Oid]) -> Result<(), Error> {
        let machine = self.shared.borrow().machine.clone();

        match machine {
            Some(machine) => Machine::prepare(&machine, name, query, types),
            None => Err(Error::Disconnected),
        }
    }

    /// Execute a prepared statement asynchronously. Preconditions and
    /// failures are reported through `handler`, which is invoked exactly
    /// once per call.
    pub fn execute_prepared(
        &self,
        name: &str,
        data: Option<&QueryData>,
        handler: ExecuteHandler,
        request_id: RequestId,
    ) {
        let machine = self.shared.borrow().machine.clone();

        match machine {
            Some(machine) => Machine::execute_prepared(&machine, name, data, handler, request_id),
            None => (*handler)(Err(Error::Disconnected)),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Schedule construction of a fresh machine after the configured reconnect
/// interval. A no-op while the event loop is not running.
pub(crate) fn start_reconnect_timer(shared: &Rc<RefCell<Shared>>) -> Result<(), Error> {
    let state = shared.borrow();

    if !state.context.event_loop.is_running() {
        return Ok(());
    }

    let weak = Rc::downgrade(shared);
    let scheduled = state.reconnect_timer.restart(
        state.options.reconnect_interval,
        Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                tracing::debug!("reconnecting");
                let machine = Machine::start(&shared);
                shared.borrow_mut().machine = Some(machine);
            }
        }),
    );

    if scheduled {
        Ok(())
    } else {
        Err(Error::ReconnectTimer)
    }
}

#[cfg(test)]
mod test {
    use super::{
        ConnectedHandler, Connection, ConnectionId, DisconnectedHandler, ExecuteHandler,
        RequestId, INVALID_REQUEST_ID,
    };
    use crate::configuration::{Options, SslOptions};
    use crate::error::Error;
    use crate::event::{Events, Interest};
    use crate::params::{Format, QueryData};
    use crate::protocol::{ExecStatus, FlushStatus, PgResult, Polling, ProtocolError, Security};
    use crate::recordset::Recordset;
    use crate::test::Harness;
    use bytes::Bytes;
    use std::cell::RefCell;
    use std::net::{IpAddr, Ipv4Addr};
    use std::rc::Rc;
    use std::time::Duration;

    const ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));

    // timer slots: the façade's reconnect timer registers first, then each
    // machine's connect timer
    const RECONNECT_TIMER: usize = 0;
    const CONNECT_TIMER: usize = 1;

    fn options(host: &str) -> Options {
        Options {
            hosts: vec![host.into()],
            user_name: "u".into(),
            password: "p".into(),
            auto_reconnect: false,
            check_query_parameters: true,
            connect_timeout: Duration::from_secs(3),
            reconnect_interval: Duration::from_millis(500),
            ..Options::default()
        }
    }

    #[derive(Default)]
    struct Observed {
        connected: RefCell<u32>,
        disconnected: RefCell<Vec<Option<String>>>,
    }

    fn initialize(connection: &Connection, options: Options) -> Rc<Observed> {
        let observed = Rc::new(Observed::default());

        let connected: ConnectedHandler = {
            let observed = Rc::clone(&observed);
            Box::new(move || {
                *observed.connected.borrow_mut() += 1;
                Ok(())
            })
        };

        let disconnected: DisconnectedHandler = {
            let observed = Rc::clone(&observed);
            Box::new(move |outcome| {
                observed
                    .disconnected
                    .borrow_mut()
                    .push(outcome.err().map(|error| error.to_string()));
            })
        };

        connection
            .initialize(ConnectionId::new_v4(), options, 0, connected, disconnected)
            .expect("initialize");

        observed
    }

    /// Drive a fresh connection through resolution and handshake to the
    /// established state.
    fn connect(harness: &Harness, connection: &Connection) -> Rc<Observed> {
        harness
            .factory
            .script_connect_polls([Polling::Writing, Polling::Ok]);

        let observed = initialize(connection, options("h1"));

        harness.resolver.deliver(0, vec![ADDRESS]);
        harness
            .event_loop
            .fire_poll(0, 0, Events::from(Interest::WRITABLE));

        assert!(connection.is_valid());
        observed
    }

    fn collecting_handler() -> (ExecuteHandler, Rc<RefCell<Vec<Result<usize, String>>>>) {
        let outcomes: Rc<RefCell<Vec<Result<usize, String>>>> = Rc::default();
        let handler: ExecuteHandler = {
            let outcomes = Rc::clone(&outcomes);
            Rc::new(move |outcome| {
                outcomes.borrow_mut().push(match outcome {
                    Ok(recordset) => Ok(recordset.len()),
                    Err(error) => Err(error.to_string()),
                });
            })
        };

        (handler, outcomes)
    }

    fn int4(value: i32, type_oid: u32) -> QueryData {
        QueryData::builder()
            .parameter(
                Some(Bytes::copy_from_slice(&value.to_be_bytes())),
                Format::Binary,
                type_oid,
            )
            .build()
    }

    fn one_row_result() -> PgResult {
        let mut result = PgResult::with_status(ExecStatus::TuplesOk);
        result.rows = vec![vec![Some(Bytes::from_static(b"\x00\x00\x00\x07"))]];
        result
    }

    #[test]
    #[tracing_test::traced_test]
    fn connects_and_reports_validity() {
        let harness = Harness::new();
        let connection = harness.connection();

        harness
            .factory
            .script_connect_polls([Polling::Writing, Polling::Ok]);

        let observed = initialize(&connection, options("h1"));
        assert_eq!(harness.resolver.lookup_host(0), "h1");
        assert!(!connection.is_valid());

        harness.resolver.deliver(0, vec![ADDRESS]);
        assert_eq!(harness.event_loop.interest(0), Interest::WRITABLE);
        assert!(harness.event_loop.timer_armed(CONNECT_TIMER));

        harness
            .event_loop
            .fire_poll(0, 0, Events::from(Interest::WRITABLE));

        assert_eq!(*observed.connected.borrow(), 1);
        assert!(connection.is_valid());
        assert!(!connection.is_busy());
        assert_eq!(harness.event_loop.poll_count(), 1);
        assert!(harness.event_loop.poll_fd(0) >= 0);
        assert_eq!(harness.event_loop.interest(0), Interest::both());
        assert!(!harness.event_loop.timer_armed(CONNECT_TIMER));

        let state = harness.factory.state.borrow();
        let params = state.last_params.as_ref().expect("startup parameters");
        assert_eq!(params.hostaddr, ADDRESS);
        assert_eq!(params.user, "u");
        assert!(matches!(&params.security, Security::Password(password) if password == "p"));
    }

    #[test]
    fn prepared_statement_round_trip() {
        let harness = Harness::new();
        let connection = harness.connection();
        connect(&harness, &connection);

        harness
            .factory
            .state
            .borrow_mut()
            .describe_results
            .push_back({
                let mut description = PgResult::with_status(ExecStatus::CommandOk);
                description.parameter_types = vec![23];
                description
            });

        connection
            .prepare("s1", "SELECT $1::int", &[23])
            .expect("prepare");

        assert_eq!(
            harness.factory.state.borrow().prepared,
            vec![("s1".to_string(), "SELECT $1::int".to_string())]
        );

        {
            let shared = connection.shared.borrow();
            let machine = shared.machine.as_ref().expect("machine");
            assert_eq!(
                machine.borrow().cached_parameter_types("s1"),
                Some(vec![23])
            );
        }

        let (handler, outcomes) = collecting_handler();
        connection.execute_prepared("s1", Some(&int4(7, 23)), handler, RequestId(42));

        assert!(connection.is_busy());
        assert_eq!(connection.current_request_id(), RequestId(42));
        assert!(connection.current_execute_handler().is_some());
        assert!(outcomes.borrow().is_empty());
        assert_eq!(
            harness.factory.state.borrow().sent,
            vec![("s1".to_string(), 1)]
        );

        harness.factory.complete_with(one_row_result());
        harness
            .event_loop
            .fire_poll(0, 0, Events::from(Interest::READABLE));

        assert_eq!(&*outcomes.borrow(), &[Ok(1)]);
        assert!(!connection.is_busy());
        assert_eq!(connection.current_request_id(), INVALID_REQUEST_ID);
        assert!(connection.current_execute_handler().is_none());
    }

    #[test]
    fn validation_uses_the_server_description() {
        let harness = Harness::new();
        let connection = harness.connection();
        connect(&harness, &connection);

        // the server describes $1 as int8 even though the client declared
        // int4 at prepare time
        harness
            .factory
            .state
            .borrow_mut()
            .describe_results
            .push_back({
                let mut description = PgResult::with_status(ExecStatus::CommandOk);
                description.parameter_types = vec![20];
                description
            });

        connection
            .prepare("s1", "SELECT $1::int", &[23])
            .expect("prepare");

        let (handler, outcomes) = collecting_handler();
        connection.execute_prepared("s1", Some(&int4(7, 23)), handler, RequestId(1));

        assert_eq!(
            &*outcomes.borrow(),
            &[Err("wrong parameter type 23 for parameter 0. Must be 20.".to_string())]
        );
        assert!(harness.factory.state.borrow().sent.is_empty());
        assert!(!connection.is_busy());
    }

    #[test]
    fn rejects_mismatched_parameter_types_before_sending() {
        let harness = Harness::new();
        let connection = harness.connection();
        connect(&harness, &connection);

        harness
            .factory
            .state
            .borrow_mut()
            .describe_results
            .push_back({
                let mut description = PgResult::with_status(ExecStatus::CommandOk);
                description.parameter_types = vec![23];
                description
            });

        connection
            .prepare("s1", "SELECT $1::int", &[23])
            .expect("prepare");

        let (handler, outcomes) = collecting_handler();
        connection.execute_prepared("s1", Some(&int4(7, 25)), handler, RequestId(9));

        assert_eq!(
            &*outcomes.borrow(),
            &[Err("wrong parameter type 25 for parameter 0. Must be 23.".to_string())]
        );
        assert!(harness.factory.state.borrow().sent.is_empty());

        let (handler, outcomes) = collecting_handler();
        connection.execute_prepared("s1", Some(&int4(7, 0)), handler, RequestId(10));
        assert!(outcomes.borrow().is_empty(), "unspecified types pass");
        assert_eq!(harness.factory.state.borrow().sent.len(), 1);
    }

    #[test]
    fn empty_resolution_schedules_reconnect() {
        let harness = Harness::new();
        let connection = harness.connection();

        let mut configured = options("h1");
        configured.auto_reconnect = true;

        let observed = initialize(&connection, configured);

        harness.resolver.deliver(0, Vec::new());

        assert_eq!(
            &*observed.disconnected.borrow(),
            &[Some("unable to resolve host \"h1\"".to_string())]
        );
        assert!(harness.event_loop.timer_armed(RECONNECT_TIMER));
        assert_eq!(
            harness.event_loop.timer_delay(RECONNECT_TIMER),
            Some(Duration::from_millis(500))
        );

        harness.event_loop.fire_timer(RECONNECT_TIMER);

        assert_eq!(harness.resolver.lookup_count(), 2);
        assert_eq!(harness.resolver.lookup_host(1), "h1");
    }

    #[test]
    fn connect_timeout_cancels_resolution_without_delivery() {
        let harness = Harness::new();
        let connection = harness.connection();

        let observed = initialize(&connection, options("h1"));

        harness.event_loop.fire_timer(CONNECT_TIMER);

        assert_eq!(
            &*observed.disconnected.borrow(),
            &[Some("connection timeout".to_string())]
        );
        assert!(harness.resolver.cancelled_without_delivery(0));

        // a late resolver answer is suppressed entirely
        harness.resolver.deliver(0, vec![ADDRESS]);
        assert_eq!(harness.factory.state.borrow().started, 0);
        assert!(!harness.event_loop.timer_armed(RECONNECT_TIMER));
    }

    #[test]
    fn midquery_failure_completes_the_handler_then_disconnects() {
        let harness = Harness::new();
        let connection = harness.connection();
        let observed = connect(&harness, &connection);

        let sink_errors: Rc<RefCell<Vec<String>>> = Rc::default();
        connection.set_error_handler({
            let sink_errors = Rc::clone(&sink_errors);
            Box::new(move |error| sink_errors.borrow_mut().push(error.to_string()))
        });

        let (handler, outcomes) = collecting_handler();
        connection.execute_prepared("s1", Some(&int4(7, 0)), handler, RequestId(42));
        assert!(connection.is_busy());

        harness.event_loop.fire_poll(0, -9, Events::new(0));

        assert_eq!(
            &*outcomes.borrow(),
            &[Err("connection is currently disconnected".to_string())]
        );
        assert_eq!(&*sink_errors.borrow(), &["bad poll status -9".to_string()]);
        assert_eq!(
            &*observed.disconnected.borrow(),
            &[Some("bad poll status -9".to_string())]
        );
        assert!(!connection.is_valid());
        assert_eq!(connection.current_request_id(), INVALID_REQUEST_ID);
        assert!(harness
            .trace
            .borrow()
            .contains(&"protocol_finalize"));
    }

    #[test]
    fn teardown_order_is_strict() {
        let harness = Harness::new();
        let connection = harness.connection();
        let observed = connect(&harness, &connection);

        let machine = Rc::downgrade(
            connection
                .shared
                .borrow()
                .machine
                .as_ref()
                .expect("machine"),
        );

        connection.destroy();

        assert_eq!(
            &*harness.trace.borrow(),
            &["poll_stop", "protocol_finalize", "poll_close_requested"]
        );
        assert!(harness.event_loop.close_requested(0));
        assert!(
            machine.upgrade().is_some(),
            "machine must survive until the loop acknowledges the close"
        );
        assert_eq!(&*observed.disconnected.borrow(), &[None]);

        harness.event_loop.ack_close(0);

        assert_eq!(
            &*harness.trace.borrow(),
            &[
                "poll_stop",
                "protocol_finalize",
                "poll_close_requested",
                "poll_closed"
            ]
        );
        assert!(machine.upgrade().is_none());

        // idempotent: nothing more fires
        connection.destroy();
        assert_eq!(&*observed.disconnected.borrow(), &[None]);
    }

    #[test]
    fn synchronous_execute_fills_the_recordset() {
        let harness = Harness::new();
        let connection = harness.connection();
        connect(&harness, &connection);

        harness
            .factory
            .state
            .borrow_mut()
            .exec_results
            .push_back(one_row_result());

        let mut recordset = Recordset::default();
        connection
            .execute("SELECT 7", None, Some(&mut recordset))
            .expect("execute");

        assert_eq!(recordset.len(), 1);
    }

    #[test]
    fn synchronous_execute_surfaces_server_errors_and_unsupported_results() {
        let harness = Harness::new();
        let connection = harness.connection();
        connect(&harness, &connection);

        {
            let mut state = harness.factory.state.borrow_mut();

            let mut rejected = PgResult::with_status(ExecStatus::FatalError);
            rejected.error = Some("ERROR (42P01): relation \"missing\" does not exist".into());
            state.exec_results.push_back(rejected);

            state
                .exec_results
                .push_back(PgResult::with_status(ExecStatus::CopyIn));
        }

        let error = connection
            .execute("SELECT 1", None, None)
            .expect_err("server rejection");
        assert!(error.to_string().contains("42P01"), "{error}");

        let error = connection
            .execute("COPY t FROM STDIN", None, None)
            .expect_err("copy is unsupported");
        assert!(matches!(error, Error::UnsupportedQuery));
    }

    #[test]
    fn busy_connections_reject_further_calls() {
        let harness = Harness::new();
        let connection = harness.connection();
        connect(&harness, &connection);

        let (handler, _outcomes) = collecting_handler();
        connection.execute_prepared("s1", Some(&int4(7, 0)), handler, RequestId(1));

        assert!(matches!(
            connection.execute("SELECT 1", None, None),
            Err(Error::Busy)
        ));
        assert!(matches!(
            connection.prepare("s2", "SELECT 1", &[]),
            Err(Error::Busy)
        ));

        let (handler, outcomes) = collecting_handler();
        connection.execute_prepared("s1", None, handler, RequestId(2));
        assert_eq!(
            &*outcomes.borrow(),
            &[Err("connection is busy".to_string())]
        );
    }

    #[test]
    fn uninitialized_connections_report_disconnected() {
        let harness = Harness::new();
        let connection = harness.connection();

        assert!(matches!(
            connection.execute("SELECT 1", None, None),
            Err(Error::Disconnected)
        ));
        assert!(matches!(
            connection.prepare("s1", "SELECT 1", &[]),
            Err(Error::Disconnected)
        ));
        assert_eq!(connection.current_request_id(), INVALID_REQUEST_ID);
        assert!(connection.current_execute_handler().is_none());
        assert!(!connection.is_valid());
        assert!(!connection.is_busy());

        let (handler, outcomes) = collecting_handler();
        connection.execute_prepared("s1", None, handler, RequestId(1));
        assert_eq!(
            &*outcomes.borrow(),
            &[Err("connection is currently disconnected".to_string())]
        );
    }

    #[test]
    fn connected_handler_errors_tear_the_connection_down() {
        let harness = Harness::new();
        let connection = harness.connection();

        let observed = Rc::new(Observed::default());

        let connected: ConnectedHandler = {
            let observed = Rc::clone(&observed);
            Box::new(move || {
                *observed.connected.borrow_mut() += 1;
                Err(Error::ExecuteFailed("schema bootstrap failed".into()))
            })
        };

        let disconnected: DisconnectedHandler = {
            let observed = Rc::clone(&observed);
            Box::new(move |outcome| {
                observed
                    .disconnected
                    .borrow_mut()
                    .push(outcome.err().map(|error| error.to_string()));
            })
        };

        connection
            .initialize(
                ConnectionId::new_v4(),
                options("h1"),
                0,
                connected,
                disconnected,
            )
            .expect("initialize");

        harness.resolver.deliver(0, vec![ADDRESS]);

        assert_eq!(*observed.connected.borrow(), 1);
        assert!(!connection.is_valid());
        assert_eq!(
            &*observed.disconnected.borrow(),
            &[Some(
                "unable to execute query: schema bootstrap failed".to_string()
            )]
        );
    }

    #[test]
    fn failed_connection_start_reports_the_cause() {
        let harness = Harness::new();
        let connection = harness.connection();

        harness
            .factory
            .state
            .borrow_mut()
            .start_errors
            .push_back(ProtocolError::Connect("connection refused".into()));

        let observed = initialize(&connection, options("h1"));
        harness.resolver.deliver(0, vec![ADDRESS]);

        assert_eq!(
            &*observed.disconnected.borrow(),
            &[Some(
                "connection to database failed: connection refused".to_string()
            )]
        );
    }

    #[test]
    fn send_failures_reach_the_handler_without_marking_busy() {
        let harness = Harness::new();
        let connection = harness.connection();
        connect(&harness, &connection);

        harness
            .factory
            .state
            .borrow_mut()
            .send_errors
            .push_back(ProtocolError::NotReady);

        let (handler, outcomes) = collecting_handler();
        connection.execute_prepared("s1", Some(&int4(7, 0)), handler, RequestId(3));

        assert_eq!(
            &*outcomes.borrow(),
            &[Err("unable to execute query: connection not ready".to_string())]
        );
        assert!(!connection.is_busy());
        assert_eq!(connection.current_request_id(), INVALID_REQUEST_ID);
    }

    #[test]
    fn pending_flush_keeps_writable_interest() {
        let harness = Harness::new();
        let connection = harness.connection();
        connect(&harness, &connection);

        harness
            .event_loop
            .fire_poll(0, 0, Events::from(Interest::WRITABLE));
        assert_eq!(harness.event_loop.interest(0), Interest::READABLE);

        harness
            .factory
            .state
            .borrow_mut()
            .flush_outcomes
            .push_back(FlushStatus::Pending);
        harness
            .event_loop
            .fire_poll(0, 0, Events::from(Interest::WRITABLE));
        assert_eq!(harness.event_loop.interest(0), Interest::both());
    }

    #[test]
    fn stopped_loop_skips_the_reconnect_timer() {
        let harness = Harness::new();
        let connection = harness.connection();

        let mut configured = options("h1");
        configured.auto_reconnect = true;

        initialize(&connection, configured);
        harness.event_loop.set_running(false);
        harness.resolver.deliver(0, Vec::new());

        assert!(!harness.event_loop.timer_armed(RECONNECT_TIMER));
    }

    #[test]
    fn derives_the_user_from_the_client_certificate() {
        let harness = Harness::new();
        let connection = harness.connection();

        let (certificate, private_key) = crate::test::self_signed("svc-ledger");

        let mut configured = options("h1");
        configured.user_name = String::new();
        configured.ssl_options = SslOptions {
            allow: true,
            certificate_pem_data: String::from_utf8(certificate.clone()).expect("pem is text"),
            private_key_pem_data: String::from_utf8(private_key).expect("pem is text"),
            trusted_certificates_pem_data: Vec::new(),
        };

        initialize(&connection, configured);

        assert_eq!(connection.options().user_name, "svc-ledger");

        harness.resolver.deliver(0, vec![ADDRESS]);

        let state = harness.factory.state.borrow();
        let params = state.last_params.as_ref().expect("startup parameters");

        match &params.security {
            Security::Tls(tls) => {
                assert_eq!(tls.host, "h1");
                assert!(tls.ca_bundle.is_none());
                let staged = std::fs::read(&tls.certificate).expect("staged certificate");
                assert_eq!(staged, certificate);
            }
            Security::Password(_) => panic!("expected TLS security"),
        }
    }
}
