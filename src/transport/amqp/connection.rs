//! AMQP connection lifecycle.
//!
//! The connection owns one engine epoch at a time: it starts the engine,
//! spawns a worker that drains the engine's event stream through a single
//! dispatch function, and drives the state machine
//! `Closed -> Opening -> Authenticating -> LinksOpening -> Open`.
//! Failures classify the wire condition through the error taxonomy, notify
//! listeners, and hand control to the reconnect path, which tears the epoch
//! down and starts a fresh one after a backoff delay.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use crate::{connection_span, message_span};

use crate::config::DeviceConfig;
use crate::error::{TransportError, TransportResult};
use crate::transport::amqp::cbs::{self, PutTokenOutcome};
use crate::transport::amqp::engine::{AmqpEngine, EngineEvent, EngineHandle, EngineMessage};
use crate::transport::amqp::multiplexer::{ChannelCategory, Multiplexer};
use crate::transport::error::{from_amqp_condition, ConnectionStatusError, ProtocolError};
use crate::transport::status::HubStatusCode;
use crate::transport::{
    AckOutcome, ListenerRegistry, ReconnectPolicy, State, TransportListener, TransportMessage,
};

const AMQP_PORT: u16 = 5671;
const WEBSOCKET_PORT: u16 = 443;
const WEBSOCKET_PATH: &str = "/$iothub/websocket";
const WEBSOCKET_SUBPROTOCOL: &str = "AMQPWSB10";

const OPEN_TIMEOUT: Duration = Duration::from_secs(60);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(60);
const WORKER_STOP_GRACE: Duration = Duration::from_secs(5);

const STATUS_CODE_PROPERTY: &str = "status-code";
const STATUS_DESCRIPTION_PROPERTY: &str = "status-description";

/// Progress of the claims-based-security exchange within one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthPhase {
    Idle,
    Pending,
    Authenticated,
    Failed,
}

/// Device-side AMQP transport connection.
pub struct AmqpConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    config: DeviceConfig,
    /// `host:port`, chosen by the websocket flag.
    host: String,
    state_tx: watch::Sender<State>,
    /// Bound event processed this epoch.
    ready_tx: watch::Sender<bool>,
    auth_tx: watch::Sender<AuthPhase>,
    /// ShutdownComplete observed this epoch.
    shutdown_tx: watch::Sender<bool>,
    listeners: StdMutex<ListenerRegistry>,
    multiplexer: Mutex<Multiplexer>,
    engine: Mutex<Box<dyn AmqpEngine>>,
    handle: Mutex<Option<Arc<dyn EngineHandle>>>,
    worker: StdMutex<Option<JoinHandle<()>>>,
    /// Serializes outbound sends and acknowledgements.
    send_lock: Mutex<()>,
    /// Outbound transfers awaiting a disposition, by delivery tag.
    pending: StdMutex<HashMap<u64, TransportMessage>>,
    /// Request id of the in-flight put-token exchange.
    pending_auth: StdMutex<Option<String>>,
    auth_error: StdMutex<Option<ConnectionStatusError>>,
    link_credit: AtomicI32,
    reconnect_requested: AtomicBool,
    reconnect_attempt: AtomicU32,
    policy: ReconnectPolicy,
}

impl AmqpConnection {
    pub fn new(config: DeviceConfig, engine: Box<dyn AmqpEngine>) -> Self {
        let host = if config.use_websocket {
            format!("{}:{}", config.hostname, WEBSOCKET_PORT)
        } else {
            format!("{}:{}", config.hostname, AMQP_PORT)
        };

        let mut multiplexer = Multiplexer::new(&config.device_id);
        if config.is_sas_auth() {
            multiplexer.add_channel(ChannelCategory::Authentication, Some(&config));
        }
        multiplexer.add_channel(ChannelCategory::Telemetry, Some(&config));
        multiplexer.add_channel(ChannelCategory::DeviceTwin, Some(&config));
        multiplexer.add_channel(ChannelCategory::DeviceMethods, Some(&config));

        let (state_tx, _) = watch::channel(State::Closed);
        let (ready_tx, _) = watch::channel(false);
        let (auth_tx, _) = watch::channel(AuthPhase::Idle);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(ConnectionInner {
                config,
                host,
                state_tx,
                ready_tx,
                auth_tx,
                shutdown_tx,
                listeners: StdMutex::new(ListenerRegistry::new()),
                multiplexer: Mutex::new(multiplexer),
                engine: Mutex::new(engine),
                handle: Mutex::new(None),
                worker: StdMutex::new(None),
                send_lock: Mutex::new(()),
                pending: StdMutex::new(HashMap::new()),
                pending_auth: StdMutex::new(None),
                auth_error: StdMutex::new(None),
                link_credit: AtomicI32::new(-1),
                reconnect_requested: AtomicBool::new(false),
                reconnect_attempt: AtomicU32::new(0),
                policy: ReconnectPolicy::default(),
            }),
        }
    }

    pub fn state(&self) -> State {
        self.inner.state()
    }

    pub fn add_listener(&self, listener: Arc<dyn TransportListener>) {
        self.inner.listeners.lock().unwrap().add(listener);
    }

    /// Open the connection. No-op when already open. Blocks until the
    /// engine binds, authentication completes, and link attaches have been
    /// issued; the transition to [`State::Open`] itself happens on the
    /// worker when the peer confirms every link.
    pub async fn open(&self) -> TransportResult<()> {
        if self.inner.state() == State::Open {
            return Ok(());
        }
        let span = connection_span!(transport = "amqp", host = %self.inner.host);
        match ConnectionInner::open_epoch(&self.inner).instrument(span).await {
            Ok(()) => Ok(()),
            Err(error) => {
                let _ = self.close().await;
                Err(error)
            }
        }
    }

    /// Close the connection and stop the engine worker. Idempotent.
    pub async fn close(&self) -> TransportResult<()> {
        let inner = &self.inner;
        inner.set_state(State::Closed);
        inner.reconnect_requested.store(false, Ordering::SeqCst);
        inner.multiplexer.lock().await.reset();
        inner.pending.lock().unwrap().clear();
        *inner.pending_auth.lock().unwrap() = None;

        let handle = inner.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(stop_error) = handle.shutdown().await {
                debug!(%stop_error, "engine already stopped");
                inner.shutdown_tx.send_replace(true);
            }
            let mut done = inner.shutdown_tx.subscribe();
            if timeout(CLOSE_TIMEOUT, done.wait_for(|done| *done))
                .await
                .is_err()
            {
                if let Some(task) = inner.worker.lock().unwrap().take() {
                    task.abort();
                }
                return Err(TransportError::CloseTimeout(CLOSE_TIMEOUT));
            }
        }

        let task = inner.worker.lock().unwrap().take();
        if let Some(mut task) = task {
            if timeout(WORKER_STOP_GRACE, &mut task).await.is_err() {
                task.abort();
                if timeout(WORKER_STOP_GRACE, &mut task).await.is_err() {
                    warn!("engine worker did not stop after abort");
                }
            }
        }
        Ok(())
    }

    /// Queue a message for delivery. Returns the delivery tag, or `None`
    /// when the connection is closed or the session has no send credit.
    pub async fn send_message(&self, message: TransportMessage) -> TransportResult<Option<u64>> {
        let span = message_span!(category = ?message.category);
        let inner = &self.inner;
        async move {
            let _guard = inner.send_lock.lock().await;
            if inner.state() == State::Closed {
                debug!("dropping send attempt on closed connection");
                return Ok(None);
            }
            if inner.link_credit.load(Ordering::SeqCst) <= 0 {
                debug!("dropping send attempt without link credit");
                return Ok(None);
            }
            let handle = inner
                .current_handle()
                .await
                .ok_or(TransportError::NotOpen {
                    state: inner.state(),
                })?;

            let tag = inner
                .multiplexer
                .lock()
                .await
                .send(handle.as_ref(), &message)
                .await?;
            inner.pending.lock().unwrap().insert(tag, message);
            Ok(Some(tag))
        }
        .instrument(span)
        .await
    }

    /// Settle a previously received message with the given outcome.
    /// Returns `false` when the connection is closed or the settle cannot
    /// be issued.
    pub async fn send_message_result(
        &self,
        message: &TransportMessage,
        outcome: AckOutcome,
    ) -> bool {
        let inner = &self.inner;
        let _guard = inner.send_lock.lock().await;
        if inner.state() == State::Closed {
            return false;
        }
        let Some(handle) = inner.current_handle().await else {
            return false;
        };
        let Some(delivery_tag) = message.delivery_tag else {
            warn!("acknowledgement for a message without a delivery tag");
            return false;
        };
        let multiplexer = inner.multiplexer.lock().await;
        let Some(link) = multiplexer.receiver_link_for(message.category) else {
            return false;
        };
        handle.settle(link, delivery_tag, outcome).await.is_ok()
    }
}

impl Drop for AmqpConnection {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.inner.worker.lock() {
            if let Some(task) = worker.take() {
                task.abort();
            }
        }
    }
}

impl ConnectionInner {
    fn state(&self) -> State {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: State) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "connection state changed");
        }
    }

    async fn current_handle(&self) -> Option<Arc<dyn EngineHandle>> {
        self.handle.lock().await.clone()
    }

    /// Full open sequence for one engine epoch.
    ///
    /// Boxed: the spawned event worker re-enters this function when a
    /// reconnect completes, which would otherwise make the future type
    /// recursive.
    fn open_epoch(
        inner: &Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        Box::pin(async move {
            Self::spawn_epoch(inner).await;
            Self::wait_ready(inner).await?;
            Self::authenticate(inner).await?;
            Self::open_links(inner).await?;
            Ok(())
        })
    }

    /// Start a fresh engine run and the worker that drains its events.
    async fn spawn_epoch(inner: &Arc<Self>) {
        inner.ready_tx.send_replace(false);
        inner.shutdown_tx.send_replace(false);
        inner.auth_tx.send_replace(AuthPhase::Idle);
        inner.link_credit.store(-1, Ordering::SeqCst);
        inner.set_state(State::Opening);

        let (handle, mut events) = inner.engine.lock().await.start();
        *inner.handle.lock().await = Some(handle);

        let worker_inner = Arc::clone(inner);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let last = matches!(event, EngineEvent::ShutdownComplete);
                Self::handle_engine_event(&worker_inner, event).await;
                if last {
                    break;
                }
            }
            debug!("engine event stream ended");
        });
        let previous = inner.worker.lock().unwrap().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn wait_ready(inner: &Arc<Self>) -> TransportResult<()> {
        let mut ready = inner.ready_tx.subscribe();
        let waited = timeout(OPEN_TIMEOUT, ready.wait_for(|ready| *ready)).await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::engine(
                "engine worker stopped before the transport bound",
            )),
            Err(_) => Err(TransportError::OpenTimeout(OPEN_TIMEOUT)),
        }
    }

    /// Run the claims-based-security exchange. Skipped when already
    /// authenticated; certificate auth authenticates at the TLS layer.
    async fn authenticate(inner: &Arc<Self>) -> TransportResult<()> {
        let mut multiplexer = inner.multiplexer.lock().await;
        if multiplexer.is_authenticated() {
            return Ok(());
        }
        if !inner.config.is_sas_auth() {
            multiplexer.mark_authenticated();
            return Ok(());
        }

        inner.set_state(State::Authenticating);
        let handle = inner
            .current_handle()
            .await
            .ok_or(TransportError::NotOpen {
                state: inner.state(),
            })?;
        multiplexer
            .open_authentication_links(handle.as_ref())
            .await?;

        let (request, request_id) = cbs::build_put_token_request(&inner.config);
        *inner.pending_auth.lock().unwrap() = Some(request_id);
        inner.auth_tx.send_replace(AuthPhase::Pending);
        multiplexer
            .send_authentication(handle.as_ref(), request)
            .await?;
        drop(multiplexer);

        let mut progress = inner.auth_tx.subscribe();
        let waited = timeout(
            OPEN_TIMEOUT,
            progress.wait_for(|phase| *phase != AuthPhase::Pending),
        )
        .await;
        match waited {
            Err(_) => Err(TransportError::OpenTimeout(OPEN_TIMEOUT)),
            Ok(Err(_)) => Err(TransportError::engine(
                "engine worker stopped during authentication",
            )),
            Ok(Ok(_)) => {
                let phase = *inner.auth_tx.borrow();
                if phase == AuthPhase::Authenticated {
                    info!("connection authenticated");
                    Ok(())
                } else {
                    let error = inner.auth_error.lock().unwrap().take();
                    match error {
                        Some(error) => Err(TransportError::Status(error)),
                        None => Err(TransportError::engine("authentication failed")),
                    }
                }
            }
        }
    }

    async fn open_links(inner: &Arc<Self>) -> TransportResult<()> {
        inner.set_state(State::LinksOpening);
        let handle = inner
            .current_handle()
            .await
            .ok_or(TransportError::NotOpen {
                state: inner.state(),
            })?;
        inner
            .multiplexer
            .lock()
            .await
            .open_channel_links(handle.as_ref())
            .await?;
        Ok(())
    }

    /// Single dispatch point for everything the engine reports.
    async fn handle_engine_event(inner: &Arc<Self>, event: EngineEvent) {
        match event {
            EngineEvent::Initialized => {
                if let Some(handle) = inner.current_handle().await {
                    if let Err(bind_error) = handle.bind(&inner.host).await {
                        warn!(%bind_error, host = %inner.host, "failed to bind transport");
                    }
                }
            }
            EngineEvent::Bound => {
                if inner.config.use_websocket {
                    if let Some(handle) = inner.current_handle().await {
                        if let Err(ws_error) = handle
                            .enable_websocket(
                                &inner.config.hostname,
                                WEBSOCKET_PATH,
                                WEBSOCKET_SUBPROTOCOL,
                            )
                            .await
                        {
                            warn!(%ws_error, "failed to layer websocket transport");
                        }
                    }
                }
                inner.ready_tx.send_replace(true);
            }
            EngineEvent::LinkFlow { credit } => {
                inner.link_credit.store(credit, Ordering::SeqCst);
            }
            EngineEvent::LinkRemoteOpen { link } => {
                let all_open = inner.multiplexer.lock().await.on_link_remote_open(&link);
                if all_open {
                    inner.set_state(State::Open);
                    inner.reconnect_attempt.store(0, Ordering::SeqCst);
                    info!(host = %inner.host, "transport connection open");
                    inner.listeners.lock().unwrap().notify_connection_established();
                }
            }
            EngineEvent::LinkRemoteClose { link, condition } => {
                let known = inner.multiplexer.lock().await.is_link_found(&link);
                inner.set_state(State::Closed);
                let status_error = condition.as_deref().map(from_amqp_condition);
                warn!(link, ?condition, "link closed by peer");
                inner
                    .listeners
                    .lock()
                    .unwrap()
                    .notify_connection_lost(status_error.as_ref());
                if known {
                    Self::start_reconnect(inner).await;
                }
            }
            EngineEvent::Delivery {
                link,
                delivery_tag,
                message,
            } => {
                Self::handle_delivery(inner, &link, delivery_tag, message).await;
            }
            EngineEvent::Disposition {
                delivery_tag,
                accepted,
            } => {
                let sent = inner.pending.lock().unwrap().remove(&delivery_tag);
                if let Some(sent) = sent {
                    let status_error = if accepted {
                        None
                    } else {
                        Some(
                            ConnectionStatusError::protocol(ProtocolError::Generic)
                                .with_message("delivery was not accepted by the service")
                                .with_retryable(true),
                        )
                    };
                    inner
                        .listeners
                        .lock()
                        .unwrap()
                        .notify_message_sent(&sent, status_error.as_ref());
                } else {
                    debug!(delivery_tag, "disposition for unknown delivery");
                }
            }
            EngineEvent::TransportError { condition } => {
                inner.set_state(State::Closed);
                let status_error = condition
                    .as_deref()
                    .map(from_amqp_condition)
                    .unwrap_or_else(|| {
                        ConnectionStatusError::protocol(ProtocolError::Generic)
                            .with_message("transport failed without an error condition")
                    });
                error!(%status_error, "transport-level failure");
                inner
                    .listeners
                    .lock()
                    .unwrap()
                    .notify_connection_lost(Some(&status_error));
                Self::start_reconnect(inner).await;
            }
            EngineEvent::ConnectionUnbound => {
                inner.set_state(State::Closed);
            }
            EngineEvent::ShutdownComplete => {
                inner.shutdown_tx.send_replace(true);
                if inner.reconnect_requested.swap(false, Ordering::SeqCst) {
                    let reopen_inner = Arc::clone(inner);
                    tokio::spawn(async move {
                        match Self::open_epoch(&reopen_inner).await {
                            Ok(()) => {}
                            Err(TransportError::Status(status)) if !status.is_retryable() => {
                                error!(%status, "reconnect abandoned after non-retryable failure");
                            }
                            Err(retry_error) => {
                                warn!(%retry_error, "reconnect attempt failed");
                                Self::start_reconnect(&reopen_inner).await;
                            }
                        }
                    });
                }
            }
        }
    }

    async fn handle_delivery(
        inner: &Arc<Self>,
        link: &str,
        delivery_tag: u64,
        message: EngineMessage,
    ) {
        let mut multiplexer = inner.multiplexer.lock().await;
        match multiplexer.category_for_receiver(link) {
            Some(ChannelCategory::Authentication) => {
                let request_id = inner.pending_auth.lock().unwrap().clone();
                if let Some(request_id) = request_id {
                    match cbs::evaluate_put_token_reply(&message, &request_id) {
                        PutTokenOutcome::Authenticated => {
                            multiplexer.mark_authenticated();
                            *inner.pending_auth.lock().unwrap() = None;
                            inner.auth_tx.send_replace(AuthPhase::Authenticated);
                        }
                        PutTokenOutcome::Rejected(status_error) => {
                            *inner.pending_auth.lock().unwrap() = None;
                            *inner.auth_error.lock().unwrap() = Some(status_error);
                            inner.auth_tx.send_replace(AuthPhase::Failed);
                        }
                        PutTokenOutcome::Unrecognized => {
                            debug!("unmatched authentication reply");
                        }
                    }
                }
                drop(multiplexer);
                if let Some(handle) = inner.current_handle().await {
                    let _ = handle.settle(link, delivery_tag, AckOutcome::Complete).await;
                }
            }
            Some(_) => {
                if let Some(received) = multiplexer.convert_inbound(link, delivery_tag, &message) {
                    drop(multiplexer);
                    let status_error = status_error_from_properties(&received);
                    inner
                        .listeners
                        .lock()
                        .unwrap()
                        .notify_message_received(&received, status_error.as_ref());
                }
            }
            None => {
                debug!(link, "delivery on unknown link");
            }
        }
    }

    /// Request a reconnect: back off, then tear the current epoch down.
    /// The worker reopens once the engine confirms shutdown.
    async fn start_reconnect(inner: &Arc<Self>) {
        if inner.reconnect_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let attempt = inner.reconnect_attempt.load(Ordering::SeqCst);
        let delay = inner.policy.delay_for_attempt(attempt);
        inner
            .reconnect_attempt
            .store(ReconnectPolicy::next_attempt(attempt), Ordering::SeqCst);
        info!(attempt, ?delay, "scheduling reconnect");
        tokio::time::sleep(delay).await;

        inner.multiplexer.lock().await.reset();
        inner.pending.lock().unwrap().clear();
        *inner.pending_auth.lock().unwrap() = None;

        let handle = inner.handle.lock().await.take();
        match handle {
            Some(handle) if handle.shutdown().await.is_ok() => {}
            _ => {
                // weird state without a live engine; reopen directly
                inner.shutdown_tx.send_replace(true);
                if inner.reconnect_requested.swap(false, Ordering::SeqCst) {
                    let reopen_inner = Arc::clone(inner);
                    tokio::spawn(async move {
                        if let Err(retry_error) = Self::open_epoch(&reopen_inner).await {
                            warn!(%retry_error, "reconnect attempt failed");
                        }
                    });
                }
            }
        }
    }
}

/// Map an application-level status code carried in message properties to a
/// taxonomy error. Absent, successful, or unparsable codes map to `None`.
fn status_error_from_properties(message: &TransportMessage) -> Option<ConnectionStatusError> {
    let raw = message.properties.get(STATUS_CODE_PROPERTY)?;
    let status = raw.parse::<u32>().ok()?;
    let description = message
        .properties
        .get(STATUS_DESCRIPTION_PROPERTY)
        .map(String::as_str)
        .unwrap_or("");
    HubStatusCode::from_u32(status).to_status_error(description)
}
