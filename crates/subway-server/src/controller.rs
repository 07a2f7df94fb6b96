//! Per-connection protocol state machine.
//!
//! A [`ConnectionController`] moves one connection through
//! `AwaitingInit → Initialized → Closed`, dispatching each inbound message and
//! deciding what goes out on the [`OrderedWriter`]. Three producers feed the
//! writer concurrently: the controller itself, one observer task per live
//! operation, and the keep-alive loop. All of them stop when the connection's
//! cancellation token fires.
//!
//! Teardown is owned by whoever takes the token out of `teardown` first, so
//! [`ConnectionController::dispose`] runs its cancel-and-dispose sequence
//! exactly once no matter how many callers race.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use subway_auth::{
    AnonymousAuthenticator, Authenticator, AuthorizationGate, AuthorizationHooks,
    AuthorizationOutcome, Credentials, Identity, NoopAuthorizationHooks,
};
use subway_core::{
    EventStream, ExecutionError, ExecutionOutcome, MessageType, OperationMessage, PanicError,
};
use subway_settings::WebSocketSettings;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::errors::{ConnectionError, RequestError};
use crate::executor::{OperationRequest, RequestExecutor};
use crate::hooks::{ConnectionHooks, DefaultHooks, HookOutcome};
use crate::keepalive::run_keep_alive;
use crate::metrics::{OPERATION_ERRORS_TOTAL, OPERATIONS_STARTED_TOTAL};
use crate::observer::{ErrorPolicy, StreamObserver};
use crate::registry::{ReserveError, SubscriptionHandle, SubscriptionRegistry};
use crate::transport::ActivityClock;
use crate::writer::OrderedWriter;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for `connection_init`.
    AwaitingInit,
    /// `connection_init` accepted; operations may start.
    Initialized,
    /// Torn down. Terminal.
    Closed,
}

/// Collaborators shared by every connection on a server.
#[derive(Clone)]
pub struct ConnectionServices {
    /// Runs operations.
    pub executor: Arc<dyn RequestExecutor>,
    /// Resolves credentials at `connection_init`.
    pub authenticator: Arc<dyn Authenticator>,
    /// Connection-level authorization.
    pub gate: AuthorizationGate,
    /// Per-stage authorization failure callbacks.
    pub auth_hooks: Arc<dyn AuthorizationHooks>,
    /// Protocol event behavior.
    pub hooks: Arc<dyn ConnectionHooks>,
}

impl ConnectionServices {
    /// Services with anonymous authentication, no authorization requirements
    /// and default hooks.
    pub fn new(executor: Arc<dyn RequestExecutor>) -> Self {
        Self {
            executor,
            authenticator: Arc::new(AnonymousAuthenticator),
            gate: AuthorizationGate::allow_all(),
            auth_hooks: Arc::new(NoopAuthorizationHooks),
            hooks: Arc::new(DefaultHooks),
        }
    }

    /// Replace the authenticator.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Replace the gate.
    #[must_use]
    pub fn with_gate(mut self, gate: AuthorizationGate) -> Self {
        self.gate = gate;
        self
    }

    /// Replace the authorization hooks.
    #[must_use]
    pub fn with_authorization_hooks(mut self, hooks: Arc<dyn AuthorizationHooks>) -> Self {
        self.auth_hooks = hooks;
        self
    }

    /// Replace the connection hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn ConnectionHooks>) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Drives one connection from handshake to teardown.
pub struct ConnectionController {
    id: String,
    settings: WebSocketSettings,
    init_timeout: Option<Duration>,
    keep_alive: Option<Duration>,
    state: Mutex<ConnectionState>,
    teardown: Mutex<Option<CancellationToken>>,
    cancel: CancellationToken,
    registry: Arc<SubscriptionRegistry>,
    writer: OrderedWriter,
    clock: ActivityClock,
    credentials: Credentials,
    identity: Mutex<Arc<Identity>>,
    services: ConnectionServices,
}

impl ConnectionController {
    /// Build a controller. Timeouts are validated here, so a misconfigured
    /// server fails before it accepts any traffic.
    ///
    /// The connection's cancellation token is a child of `parent`.
    pub fn new(
        id: impl Into<String>,
        settings: &WebSocketSettings,
        services: ConnectionServices,
        credentials: Credentials,
        writer: OrderedWriter,
        clock: ActivityClock,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, ConnectionError> {
        settings.validate()?;
        let init_timeout = settings.init_wait_timeout()?;
        let keep_alive = settings.keep_alive_interval()?;
        let cancel = parent.child_token();

        Ok(Arc::new(Self {
            id: id.into(),
            settings: settings.clone(),
            init_timeout,
            keep_alive,
            state: Mutex::new(ConnectionState::AwaitingInit),
            teardown: Mutex::new(Some(cancel.clone())),
            cancel,
            registry: Arc::new(SubscriptionRegistry::new()),
            writer,
            clock,
            credentials,
            identity: Mutex::new(Arc::new(Identity::anonymous())),
            services,
        }))
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Whether the connection is closed or its token was cancelled.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed || self.cancel.is_cancelled()
    }

    /// Resolves when the connection is torn down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Identity established at `connection_init` (anonymous before that).
    pub fn identity(&self) -> Arc<Identity> {
        Arc::clone(&self.identity.lock())
    }

    /// Active operations.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Outbound queue.
    pub fn writer(&self) -> &OrderedWriter {
        &self.writer
    }

    /// Start the `connection_init` wait timer, if one is configured.
    pub fn initialize_connection(self: &Arc<Self>) {
        let Some(timeout) = self.init_timeout else {
            debug!(connection_id = %self.id, "init wait timeout disabled");
            return;
        };
        let this = Arc::clone(self);
        let _ = tokio::spawn(async move {
            tokio::select! {
                () = this.cancel.cancelled() => {}
                () = tokio::time::sleep(timeout) => this.on_init_deadline().await,
            }
        });
    }

    /// Dispatch one decoded inbound message.
    ///
    /// Returns `Err(Cancelled)` once the connection is torn down; the caller
    /// should stop reading.
    #[instrument(skip_all, fields(connection_id = %self.id, message_type = %message.message_type))]
    pub async fn on_message_received(
        &self,
        message: OperationMessage,
    ) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Cancelled);
        }
        debug!("message received");

        match message.message_type {
            MessageType::ConnectionInit => self.handle_init(message.payload).await,
            MessageType::Start => self.handle_start(message).await,
            MessageType::Stop => {
                self.handle_stop(&message);
                Ok(())
            }
            MessageType::ConnectionTerminate => {
                info!("client requested termination");
                let outcome = self.services.hooks.on_terminate(&self.writer).await;
                self.apply(outcome);
                Ok(())
            }
            _ => {
                warn!("unrecognized message");
                let outcome = self
                    .services
                    .hooks
                    .on_unrecognized(&self.writer, Some(&message))
                    .await;
                self.apply(outcome);
                Ok(())
            }
        }
    }

    /// Report a frame that could not be decoded.
    pub async fn on_invalid_frame(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Cancelled);
        }
        warn!(connection_id = %self.id, "undecodable frame");
        let outcome = self.services.hooks.on_unrecognized(&self.writer, None).await;
        self.apply(outcome);
        Ok(())
    }

    /// Tear the connection down. Idempotent and safe to call concurrently.
    pub fn dispose(&self) {
        let Some(token) = self.teardown.lock().take() else {
            return;
        };
        *self.state.lock() = ConnectionState::Closed;
        token.cancel();
        self.registry.dispose();
        self.writer.complete();
        info!(connection_id = %self.id, "connection disposed");
    }

    fn apply(&self, outcome: HookOutcome) {
        if outcome.is_fatal() {
            self.dispose();
        }
    }

    async fn on_init_deadline(&self) {
        if self.state() != ConnectionState::AwaitingInit {
            return;
        }
        warn!(connection_id = %self.id, "connection_init not received in time");
        let outcome = self.services.hooks.on_init_timeout(&self.writer).await;
        self.apply(outcome);
    }

    async fn handle_init(&self, payload: Option<Value>) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Initialized => {
                warn!("repeated connection_init");
                let outcome = self.services.hooks.on_too_many_init(&self.writer).await;
                self.apply(outcome);
                return Ok(());
            }
            ConnectionState::Closed => return Err(ConnectionError::Cancelled),
            ConnectionState::AwaitingInit => {}
        }

        let credentials = self.credentials.clone().with_init_payload(payload);
        let authorized = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(ConnectionError::Cancelled),
            authorized = self.authorize(&credentials) => authorized,
        };
        let identity = match authorized {
            Ok(identity) => identity,
            Err(outcome) => {
                info!(?outcome, "connection rejected");
                let outcome = self
                    .services
                    .hooks
                    .on_access_denied(&self.writer, &outcome)
                    .await;
                self.apply(outcome);
                return Ok(());
            }
        };

        {
            let mut state = self.state.lock();
            if *state != ConnectionState::AwaitingInit {
                return Err(ConnectionError::Cancelled);
            }
            *state = ConnectionState::Initialized;
        }
        info!(name = identity.name.as_deref(), "connection initialized");
        *self.identity.lock() = Arc::new(identity);

        self.services.hooks.on_acknowledge(&self.writer).await;
        self.start_keep_alive();
        Ok(())
    }

    async fn authorize(&self, credentials: &Credentials) -> Result<Identity, AuthorizationOutcome> {
        let identity = match self.services.authenticator.authenticate(credentials).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "authentication failed");
                return Err(AuthorizationOutcome::NotAuthenticated);
            }
        };
        let outcome = self
            .services
            .gate
            .authorize(&identity, self.services.auth_hooks.as_ref())
            .await;
        if outcome.is_authorized() {
            Ok(identity)
        } else {
            Err(outcome)
        }
    }

    fn start_keep_alive(&self) {
        let Some(interval) = self.keep_alive else {
            return;
        };
        let mode = self.settings.keep_alive_mode;
        let writer = self.writer.clone();
        let hooks = Arc::clone(&self.services.hooks);
        let clock = self.clock.clone();
        let cancel = self.cancel.clone();
        debug!(?mode, ?interval, "starting keep-alive");

        let _ = tokio::spawn(async move {
            let result = run_keep_alive(mode, interval, clock, cancel, move || {
                let writer = writer.clone();
                let hooks = Arc::clone(&hooks);
                async move { hooks.on_send_keep_alive(&writer).await }
            })
            .await;
            debug!(?result, "keep-alive stopped");
        });
    }

    #[instrument(skip_all, fields(operation_id = tracing::field::Empty))]
    async fn handle_start(&self, message: OperationMessage) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Initialized {
            let outcome = self
                .services
                .hooks
                .on_not_initialized(&self.writer, message.operation_id())
                .await;
            self.apply(outcome);
            return Ok(());
        }

        let Some(id) = message.operation_id().map(str::to_owned) else {
            let outcome = self.services.hooks.on_blank_id(&self.writer).await;
            self.apply(outcome);
            return Ok(());
        };
        let _ = tracing::Span::current().record("operation_id", id.as_str());

        let reserved = if self.settings.overwrite_duplicate_ids {
            self.registry.reserve_overwrite(&id)
        } else {
            self.registry.reserve(&id)
        };
        let token = match reserved {
            Ok(token) => token,
            Err(ReserveError::Duplicate) => {
                let outcome = self.services.hooks.on_id_exists(&self.writer, &id).await;
                self.apply(outcome);
                return Ok(());
            }
            Err(ReserveError::Disposed) => return Err(ConnectionError::Cancelled),
        };
        counter!(OPERATIONS_STARTED_TOTAL).increment(1);
        debug!("operation reserved");

        let request = OperationRequest {
            id: id.clone(),
            payload: message.payload,
            identity: self.identity(),
            cancel: self.cancel.child_token(),
        };
        let executed = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                let _ = self.registry.remove_if_current(&id, token);
                return Err(ConnectionError::Cancelled);
            }
            executed = AssertUnwindSafe(self.services.executor.execute(request)).catch_unwind() => executed,
        };
        let executed = match executed {
            Ok(executed) => executed,
            Err(panic) => {
                let panic = PanicError::from_payload(panic.as_ref());
                error!(error = %panic, "executor panicked during setup");
                self.fail(&id, token, &[ExecutionError::setup_failed(&panic)]).await;
                return Ok(());
            }
        };

        match executed {
            Ok(ExecutionOutcome::Stream(stream)) => self.attach_stream(id, token, stream),
            Ok(ExecutionOutcome::Single(result)) => {
                if self.registry.contains(&id, token) {
                    self.send(OperationMessage::data(&id, &result)).await;
                    self.send(OperationMessage::complete(&id)).await;
                } else {
                    debug!("operation stopped during execution, discarding result");
                }
                let _ = self.registry.remove_if_current(&id, token);
            }
            Ok(ExecutionOutcome::Rejected(errors)) => self.fail(&id, token, &errors).await,
            Err(RequestError::Execution(e)) => self.fail(&id, token, &[e]).await,
            Err(RequestError::Cancelled) => {
                if self.cancel.is_cancelled() {
                    let _ = self.registry.remove_if_current(&id, token);
                    return Err(ConnectionError::Cancelled);
                }
                self.fail(&id, token, &[ExecutionError::cancelled()]).await;
            }
            Err(RequestError::Unhandled(source)) => {
                error!(error = %source, "operation setup failed");
                let wrapped = ExecutionError::setup_failed(&*source);
                self.fail(&id, token, &[wrapped]).await;
            }
        }
        Ok(())
    }

    fn attach_stream(&self, id: String, token: u64, stream: EventStream) {
        let cancel = self.cancel.child_token();
        let handle = SubscriptionHandle::new(cancel.clone());
        match self.registry.compare_exchange(&id, token, handle) {
            Ok(()) => {
                debug!("operation live");
                StreamObserver {
                    id,
                    token,
                    registry: Arc::clone(&self.registry),
                    writer: self.writer.clone(),
                    policy: ErrorPolicy {
                        disconnect_after_error_event: self.settings.disconnect_after_error_event,
                        disconnect_after_any_error: self.settings.disconnect_after_any_error,
                    },
                    cancel,
                }
                .spawn(stream);
            }
            Err(handle) => {
                debug!("operation stopped during setup, disposing stream");
                handle.dispose();
                drop(stream);
            }
        }
    }

    async fn fail(&self, id: &str, token: u64, errors: &[ExecutionError]) {
        if self.registry.contains(id, token) {
            for e in errors {
                counter!(OPERATION_ERRORS_TOTAL, "kind" => e.kind.default_code()).increment(1);
            }
            self.send(OperationMessage::error(id, errors)).await;
        }
        let _ = self.registry.remove_if_current(id, token);
    }

    fn handle_stop(&self, message: &OperationMessage) {
        match message.operation_id() {
            Some(id) if self.registry.try_remove(id) => debug!(operation_id = id, "operation stopped"),
            Some(id) => debug!(operation_id = id, "stop for unknown operation"),
            None => debug!("stop without id"),
        }
    }

    async fn send(&self, message: OperationMessage) {
        if let Err(e) = self.writer.send(message).await {
            debug!(error = %e, "writer closed, dropping message");
        }
    }
}

impl std::fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionController")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("operations", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use subway_auth::{AuthorizationRequirements, PolicyRegistry, StaticTokenAuthenticator};
    use subway_core::errors::SUBSCRIBE_FAILED_MESSAGE;
    use subway_core::{ErrorKind, ExecutionResult};
    use subway_settings::{KeepAliveMode, TimeoutSetting};
    use tokio::sync::mpsc;

    use crate::test_support::{RecordingTransport, settle};

    type Sender = mpsc::UnboundedSender<Result<ExecutionResult, ExecutionError>>;

    struct DropGuard(Arc<AtomicUsize>);

    impl Drop for DropGuard {
        fn drop(&mut self) {
            let _ = self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Dispatches on `payload.query`.
    #[derive(Default)]
    struct ScriptedExecutor {
        senders: parking_lot::Mutex<Vec<Sender>>,
        dropped: Arc<AtomicUsize>,
        executed: AtomicUsize,
        controller: parking_lot::Mutex<Option<std::sync::Weak<ConnectionController>>>,
    }

    impl ScriptedExecutor {
        fn sender(&self, index: usize) -> Sender {
            self.senders.lock()[index].clone()
        }

        fn dropped(&self) -> usize {
            self.dropped.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RequestExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            request: OperationRequest,
        ) -> Result<ExecutionOutcome, RequestError> {
            let _ = self.executed.fetch_add(1, Ordering::SeqCst);
            match request.query().unwrap_or_default() {
                "subscription" => {
                    let (tx, mut rx) = mpsc::unbounded_channel();
                    self.senders.lock().push(tx);
                    let guard = DropGuard(Arc::clone(&self.dropped));
                    Ok(ExecutionOutcome::Stream(Box::pin(async_stream::stream! {
                        let _guard = guard;
                        while let Some(item) = rx.recv().await {
                            yield item;
                        }
                    })))
                }
                "whoami" => Ok(ExecutionOutcome::Single(ExecutionResult::data(
                    json!({ "name": request.identity.name }),
                ))),
                "fail" => Err(ExecutionError::execution("resolver failed").into()),
                "reject" => Ok(ExecutionOutcome::Rejected(vec![ExecutionError::new(
                    ErrorKind::Validation,
                    "bad document",
                )])),
                "boom" => Err(RequestError::unhandled("secret internals")),
                "panic" => panic!("secret internals"),
                "teardown" => {
                    // tear the connection down after the stream is built but
                    // before the controller installs it
                    let controller = self.controller.lock().as_ref().and_then(std::sync::Weak::upgrade);
                    if let Some(controller) = controller {
                        controller.dispose();
                    }
                    let guard = DropGuard(Arc::clone(&self.dropped));
                    Ok(ExecutionOutcome::Stream(Box::pin(async_stream::stream! {
                        let _guard = guard;
                        yield Ok::<_, ExecutionError>(ExecutionResult::data(json!({ "late": true })));
                    })))
                }
                "cancel" => Err(RequestError::Cancelled),
                "hang" => {
                    request.cancel.cancelled().await;
                    Err(RequestError::Cancelled)
                }
                _ => Ok(ExecutionOutcome::Single(ExecutionResult::data(
                    json!({ "echo": request.variables().cloned().unwrap_or(Value::Null) }),
                ))),
            }
        }
    }

    struct Fixture {
        controller: Arc<ConnectionController>,
        transport: RecordingTransport,
        executor: Arc<ScriptedExecutor>,
    }

    impl Fixture {
        fn new(settings: WebSocketSettings) -> Self {
            Self::with(settings, |s| s, Credentials::default())
        }

        fn with(
            settings: WebSocketSettings,
            configure: impl FnOnce(ConnectionServices) -> ConnectionServices,
            credentials: Credentials,
        ) -> Self {
            let transport = RecordingTransport::new();
            let clock = ActivityClock::new();
            let writer = OrderedWriter::spawn(transport.clone(), None, clock.clone());
            let executor = Arc::new(ScriptedExecutor::default());
            let services = configure(ConnectionServices::new(executor.clone()));
            let controller = ConnectionController::new(
                "conn-test",
                &settings,
                services,
                credentials,
                writer,
                clock,
                &CancellationToken::new(),
            )
            .unwrap();
            *executor.controller.lock() = Some(Arc::downgrade(&controller));
            Self {
                controller,
                transport,
                executor,
            }
        }

        async fn recv(&self, message: OperationMessage) -> Result<(), ConnectionError> {
            let result = self.controller.on_message_received(message).await;
            settle().await;
            result
        }

        async fn init(&self) {
            self.recv(OperationMessage::new(MessageType::ConnectionInit))
                .await
                .unwrap();
        }

        async fn start(&self, id: &str, query: &str) {
            self.recv(start(id, query)).await.unwrap();
        }
    }

    fn start(id: &str, query: &str) -> OperationMessage {
        OperationMessage::new(MessageType::Start)
            .with_id(id)
            .with_payload(json!({ "query": query, "variables": { "n": 1 } }))
    }

    fn stop(id: &str) -> OperationMessage {
        OperationMessage::new(MessageType::Stop).with_id(id)
    }

    fn quiet() -> WebSocketSettings {
        WebSocketSettings {
            connection_init_wait_timeout: TimeoutSetting::Disabled,
            ..WebSocketSettings::default()
        }
    }

    fn error_code(message: &OperationMessage) -> String {
        message.payload.as_ref().unwrap()["errors"][0]["extensions"]["code"]
            .as_str()
            .unwrap()
            .to_owned()
    }

    // ── Construction ──

    #[tokio::test]
    async fn invalid_timeout_rejected_eagerly() {
        let writer = OrderedWriter::spawn(RecordingTransport::new(), None, ActivityClock::new());
        let settings = WebSocketSettings {
            connection_init_wait_timeout: TimeoutSetting::Millis(0),
            ..WebSocketSettings::default()
        };
        let err = ConnectionController::new(
            "c",
            &settings,
            ConnectionServices::new(Arc::new(ScriptedExecutor::default())),
            Credentials::default(),
            writer,
            ActivityClock::new(),
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ConnectionError::Config(_)));
    }

    // ── Initialization ──

    #[tokio::test]
    async fn init_acknowledges_once() {
        let f = Fixture::new(quiet());
        assert_eq!(f.controller.state(), ConnectionState::AwaitingInit);
        f.init().await;
        assert_eq!(f.controller.state(), ConnectionState::Initialized);
        assert_eq!(f.transport.types(), vec!["connection_ack"]);
    }

    #[tokio::test]
    async fn second_init_is_rejected_without_second_ack() {
        let f = Fixture::new(quiet());
        f.init().await;
        f.init().await;
        assert_eq!(f.transport.of_type("connection_ack").len(), 1);
        assert_eq!(f.transport.close_frame().unwrap().0, 4429);
        assert_eq!(f.controller.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn access_denied_closes_4401() {
        let gate = AuthorizationGate::new(
            AuthorizationRequirements::authenticated(),
            Arc::new(PolicyRegistry::new()),
        );
        let f = Fixture::with(quiet(), |s| s.with_gate(gate), Credentials::default());
        f.init().await;

        assert_eq!(f.transport.types(), vec!["connection_error"]);
        assert_eq!(f.transport.close_frame().unwrap().0, 4401);
        assert_eq!(f.controller.state(), ConnectionState::Closed);
        assert!(matches!(
            f.controller.on_message_received(start("1", "query")).await,
            Err(ConnectionError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn authenticated_identity_reaches_executor() {
        let mut tokens = StaticTokenAuthenticator::new();
        tokens.insert("t0k", Identity::authenticated("ana").with_role("reader"));
        let gate = AuthorizationGate::new(
            AuthorizationRequirements::authenticated().with_roles(["reader"]),
            Arc::new(PolicyRegistry::new()),
        );
        let f = Fixture::with(
            quiet(),
            |s| s.with_gate(gate).with_authenticator(Arc::new(tokens)),
            Credentials::default(),
        );
        f.recv(
            OperationMessage::new(MessageType::ConnectionInit)
                .with_payload(json!({ "authToken": "t0k" })),
        )
        .await
        .unwrap();
        assert_eq!(f.controller.identity().name.as_deref(), Some("ana"));

        f.start("1", "whoami").await;
        let data = &f.transport.of_type("data")[0];
        assert_eq!(data.payload.as_ref().unwrap()["data"]["name"], "ana");
    }

    #[tokio::test]
    async fn malformed_credentials_are_denied() {
        let gate = AuthorizationGate::new(
            AuthorizationRequirements::none(),
            Arc::new(PolicyRegistry::new()),
        );
        let f = Fixture::with(
            quiet(),
            |s| {
                s.with_gate(gate)
                    .with_authenticator(Arc::new(StaticTokenAuthenticator::new()))
            },
            Credentials::from_headers([("authorization", "Basic abc")]),
        );
        f.init().await;
        assert_eq!(f.transport.close_frame().unwrap().0, 4401);
    }

    #[tokio::test(start_paused = true)]
    async fn init_timeout_closes_4408() {
        let settings = WebSocketSettings {
            connection_init_wait_timeout: TimeoutSetting::Millis(500),
            ..WebSocketSettings::default()
        };
        let f = Fixture::new(settings);
        f.controller.initialize_connection();

        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        assert_eq!(f.controller.state(), ConnectionState::AwaitingInit);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(f.controller.state(), ConnectionState::Closed);
        assert_eq!(f.transport.close_frame().unwrap().0, 4408);
    }

    #[tokio::test(start_paused = true)]
    async fn init_before_timeout_keeps_connection() {
        let settings = WebSocketSettings {
            connection_init_wait_timeout: TimeoutSetting::Millis(500),
            ..WebSocketSettings::default()
        };
        let f = Fixture::new(settings);
        f.controller.initialize_connection();
        f.init().await;
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert_eq!(f.controller.state(), ConnectionState::Initialized);
        assert!(f.transport.close_frame().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_starts_after_ack() {
        let settings = WebSocketSettings {
            connection_init_wait_timeout: TimeoutSetting::Disabled,
            keep_alive_timeout: TimeoutSetting::Millis(1_000),
            keep_alive_mode: KeepAliveMode::Fixed,
            ..WebSocketSettings::default()
        };
        let f = Fixture::new(settings);
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        assert!(f.transport.sent().is_empty());

        f.init().await;
        tokio::time::sleep(std::time::Duration::from_millis(2_500)).await;
        settle().await;
        let types = f.transport.types();
        assert_eq!(types[0], "connection_ack");
        assert_eq!(types.iter().filter(|t| *t == "ka").count(), 2);

        f.controller.dispose();
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert_eq!(f.transport.of_type("ka").len(), 2);
    }

    // ── Start / stop ──

    #[tokio::test]
    async fn start_before_init_is_not_initialized() {
        let f = Fixture::new(quiet());
        f.start("1", "subscription").await;
        let msgs = f.transport.messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].message_type, MessageType::Error);
        assert_eq!(error_code(&msgs[0]), "NOT_INITIALIZED");
        assert!(f.controller.registry().is_empty());
        assert_eq!(f.executor.executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blank_id_never_touches_registry() {
        let f = Fixture::new(quiet());
        f.init().await;
        f.start("", "subscription").await;
        f.recv(OperationMessage::new(MessageType::Start)).await.unwrap();
        assert_eq!(f.transport.of_type("connection_error").len(), 2);
        assert!(f.controller.registry().is_empty());
        assert_eq!(f.executor.executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subscription_lifecycle() {
        let f = Fixture::new(quiet());
        f.init().await;
        f.start("1", "subscription").await;

        assert_eq!(f.controller.registry().ids(), vec!["1".to_string()]);
        assert_eq!(f.transport.types(), vec!["connection_ack"]);

        f.executor
            .sender(0)
            .send(Ok(ExecutionResult::data(json!({ "tick": 1 }))))
            .unwrap();
        settle().await;
        let data = f.transport.of_type("data");
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].id.as_deref(), Some("1"));

        f.recv(stop("1")).await.unwrap();
        assert!(f.controller.registry().is_empty());
        assert_eq!(f.executor.dropped(), 1);

        let before = f.transport.sent().len();
        let _ = f.executor.sender(0).send(Ok(ExecutionResult::data(json!({ "tick": 2 }))));
        settle().await;
        assert_eq!(f.transport.sent().len(), before);
        assert_eq!(f.executor.dropped(), 1);
    }

    #[tokio::test]
    async fn stream_end_sends_complete() {
        let f = Fixture::new(quiet());
        f.init().await;
        f.start("1", "subscription").await;
        drop(f.executor.senders.lock().remove(0));
        settle().await;
        assert_eq!(f.transport.types(), vec!["connection_ack", "complete"]);
        assert!(f.controller.registry().is_empty());
    }

    #[tokio::test]
    async fn query_yields_data_then_complete() {
        let f = Fixture::new(quiet());
        f.init().await;
        f.start("1", "query { echo }").await;
        assert_eq!(f.transport.types(), vec!["connection_ack", "data", "complete"]);
        let data = &f.transport.messages()[1];
        assert_eq!(data.payload.as_ref().unwrap()["data"]["echo"]["n"], 1);
        assert!(f.controller.registry().is_empty());
    }

    #[tokio::test]
    async fn duplicate_id_rejected_and_first_stays_active() {
        let f = Fixture::new(quiet());
        f.init().await;
        f.start("1", "subscription").await;
        f.start("1", "subscription").await;

        let errors = f.transport.of_type("error");
        assert_eq!(errors.len(), 1);
        assert_eq!(error_code(&errors[0]), "ID_ALREADY_EXISTS");
        assert_eq!(f.executor.executed.load(Ordering::SeqCst), 1);

        f.executor
            .sender(0)
            .send(Ok(ExecutionResult::data(json!({ "tick": 1 }))))
            .unwrap();
        settle().await;
        assert_eq!(f.transport.of_type("data").len(), 1);
    }

    #[tokio::test]
    async fn overwrite_disposes_previous_operation() {
        let settings = WebSocketSettings {
            overwrite_duplicate_ids: true,
            ..quiet()
        };
        let f = Fixture::new(settings);
        f.init().await;
        f.start("1", "subscription").await;
        f.start("1", "subscription").await;

        assert_eq!(f.executor.dropped(), 1);
        assert_eq!(f.controller.registry().len(), 1);
        assert!(f.transport.of_type("error").is_empty());

        f.executor
            .sender(1)
            .send(Ok(ExecutionResult::data(json!({ "tick": 1 }))))
            .unwrap();
        settle().await;
        assert_eq!(f.transport.of_type("data").len(), 1);
    }

    #[tokio::test]
    async fn stop_unknown_id_is_noop() {
        let f = Fixture::new(quiet());
        f.init().await;
        f.recv(stop("missing")).await.unwrap();
        assert_eq!(f.transport.types(), vec!["connection_ack"]);
    }

    // ── Failures ──

    #[tokio::test]
    async fn execution_error_is_forwarded() {
        let f = Fixture::new(quiet());
        f.init().await;
        f.start("1", "fail").await;
        let err = &f.transport.of_type("error")[0];
        assert_eq!(error_code(err), "EXECUTION_ERROR");
        assert!(f.controller.registry().is_empty());
        assert_eq!(f.controller.state(), ConnectionState::Initialized);
    }

    #[tokio::test]
    async fn rejection_is_forwarded() {
        let f = Fixture::new(quiet());
        f.init().await;
        f.start("1", "reject").await;
        assert_eq!(error_code(&f.transport.of_type("error")[0]), "INVALID_OPERATION");
    }

    #[tokio::test]
    async fn unhandled_error_is_wrapped() {
        let f = Fixture::new(quiet());
        f.init().await;
        f.start("1", "boom").await;
        let err = &f.transport.of_type("error")[0];
        assert_eq!(error_code(err), "UNHANDLED_ERROR");
        let payload = err.payload.as_ref().unwrap();
        assert_eq!(payload["errors"][0]["message"], SUBSCRIBE_FAILED_MESSAGE);
        assert!(!payload.to_string().contains("secret"));
    }

    #[tokio::test]
    async fn executor_panic_is_reported_for_the_id() {
        let f = Fixture::new(quiet());
        f.init().await;
        f.start("1", "panic").await;

        let errors = f.transport.of_type("error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].id.as_deref(), Some("1"));
        assert_eq!(error_code(&errors[0]), "UNHANDLED_ERROR");
        assert!(!errors[0].payload.as_ref().unwrap().to_string().contains("secret"));
        assert!(f.controller.registry().is_empty());
        assert_eq!(f.controller.state(), ConnectionState::Initialized);

        // the id is free again and the connection keeps serving
        f.start("1", "query").await;
        assert_eq!(f.transport.of_type("complete").len(), 1);
    }

    #[tokio::test]
    async fn teardown_before_install_disposes_fresh_stream() {
        let f = Fixture::new(quiet());
        f.init().await;
        let result = f.recv(start("1", "teardown")).await;
        assert!(result.is_ok());

        assert_eq!(f.executor.dropped(), 1);
        assert!(f.controller.registry().is_empty());
        assert_eq!(f.controller.state(), ConnectionState::Closed);
        assert_eq!(f.transport.types(), vec!["connection_ack"]);
    }

    #[tokio::test]
    async fn stray_cancellation_is_reported() {
        let f = Fixture::new(quiet());
        f.init().await;
        f.start("1", "cancel").await;
        assert_eq!(
            error_code(&f.transport.of_type("error")[0]),
            "OPERATION_CANCELLED"
        );
    }

    #[tokio::test]
    async fn teardown_during_execution_is_silent() {
        let f = Fixture::new(quiet());
        f.init().await;
        let controller = Arc::clone(&f.controller);
        let pending =
            tokio::spawn(async move { controller.on_message_received(start("1", "hang")).await });
        settle().await;
        assert_eq!(f.controller.registry().len(), 1);

        f.controller.dispose();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ConnectionError::Cancelled)));
        settle().await;
        assert_eq!(f.transport.types(), vec!["connection_ack"]);
        assert!(f.controller.registry().is_empty());
    }

    #[tokio::test]
    async fn unrecognized_keeps_connection_open() {
        let f = Fixture::new(quiet());
        f.init().await;
        f.recv(OperationMessage::new("subscribe".to_string().into()))
            .await
            .unwrap();
        f.recv(OperationMessage::new(MessageType::Data)).await.unwrap();
        f.controller.on_invalid_frame().await.unwrap();
        settle().await;
        assert_eq!(f.transport.of_type("connection_error").len(), 3);

        f.start("1", "query").await;
        assert_eq!(f.transport.of_type("complete").len(), 1);
        assert!(f.transport.close_frame().is_none());
    }

    // ── Teardown ──

    #[tokio::test]
    async fn terminate_closes_and_disposes() {
        let f = Fixture::new(quiet());
        f.init().await;
        f.start("1", "subscription").await;
        f.start("2", "subscription").await;
        f.recv(OperationMessage::new(MessageType::ConnectionTerminate))
            .await
            .unwrap();

        assert_eq!(f.transport.close_frame().unwrap().0, 1000);
        assert_eq!(f.controller.state(), ConnectionState::Closed);
        assert!(f.controller.registry().is_empty());
        assert_eq!(f.executor.dropped(), 2);
        f.controller.writer().completion().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispose_runs_once() {
        let f = Fixture::new(quiet());
        f.init().await;
        f.start("1", "subscription").await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&f.controller);
            handles.push(tokio::spawn(async move { c.dispose() }));
        }
        for h in handles {
            h.await.unwrap();
        }
        f.controller.writer().completion().await;
        for _ in 0..100 {
            if f.executor.dropped() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert_eq!(f.controller.state(), ConnectionState::Closed);
        assert!(f.controller.registry().is_disposed());
        assert_eq!(f.executor.dropped(), 1);
        assert!(f.controller.is_closed());
    }

    #[tokio::test]
    async fn parent_cancellation_closes_connection() {
        let parent = CancellationToken::new();
        let transport = RecordingTransport::new();
        let clock = ActivityClock::new();
        let writer = OrderedWriter::spawn(transport, None, clock.clone());
        let controller = ConnectionController::new(
            "child",
            &quiet(),
            ConnectionServices::new(Arc::new(ScriptedExecutor::default())),
            Credentials::default(),
            writer,
            clock,
            &parent,
        )
        .unwrap();
        parent.cancel();
        controller.closed().await;
        assert!(controller.is_closed());
    }
}
