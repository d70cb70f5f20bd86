//! MQTT connection lifecycle.
//!
//! A much simpler machine than the AMQP side: the connection is either
//! closed or open, opening blocks on the broker's connection
//! acknowledgement, and a lost connection is reported to listeners but
//! never retried here. Reconnection is the caller's decision.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Packet, QoS, Transport,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::DeviceConfig;
use crate::{connection_span, message_span};
use crate::error::{TransportError, TransportResult};
use crate::transport::error::{
    from_mqtt_client_fault, mqtt_reason_code, ClientFaultCause, ConnectionStatusError,
    MqttClientFault,
};
use crate::transport::mqtt::channels::ChannelSet;
use crate::transport::status::HubStatusCode;
use crate::transport::{
    AckOutcome, ListenerRegistry, MessageCategory, State, TransportListener, TransportMessage,
};

const MQTT_PORT: u16 = 8883;
const WEBSOCKET_PORT: u16 = 443;

const API_VERSION: &str = "2016-11-14";
const CLIENT_TYPE: &str = concat!("hublink%2F", env!("CARGO_PKG_VERSION"));

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const KEEP_ALIVE: Duration = Duration::from_secs(230);
const WORKER_STOP_GRACE: Duration = Duration::from_secs(5);

/// Connection phase as tracked by the broker worker.
#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Closed,
    Connecting,
    Connected,
    Failed(String),
}

/// Device-side MQTT transport connection.
pub struct MqttConnection {
    config: DeviceConfig,
    phase_tx: watch::Sender<Phase>,
    shutdown_tx: watch::Sender<bool>,
    client: StdMutex<Option<AsyncClient>>,
    channels: Arc<ChannelSet>,
    listeners: Arc<StdMutex<ListenerRegistry>>,
    worker: StdMutex<Option<JoinHandle<()>>>,
    /// Classified cause of the most recent connection failure.
    last_failure: Arc<StdMutex<Option<ConnectionStatusError>>>,
}

impl MqttConnection {
    pub fn new(config: DeviceConfig) -> Self {
        let channels = Arc::new(ChannelSet::new(&config.device_id));
        let (phase_tx, _) = watch::channel(Phase::Closed);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            phase_tx,
            shutdown_tx,
            client: StdMutex::new(None),
            channels,
            listeners: Arc::new(StdMutex::new(ListenerRegistry::new())),
            worker: StdMutex::new(None),
            last_failure: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn state(&self) -> State {
        match &*self.phase_tx.borrow() {
            Phase::Connected => State::Open,
            _ => State::Closed,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn TransportListener>) {
        self.listeners.lock().unwrap().add(listener);
    }

    /// Connect to the hub's broker. No-op when already open. Returns only
    /// after the broker acknowledges the connection; anything started in a
    /// failed attempt is stopped before the error is returned.
    pub async fn open(&self) -> TransportResult<()> {
        if self.state() == State::Open {
            return Ok(());
        }
        if self.config.use_websocket && self.config.is_x509_auth() {
            return Err(TransportError::WebsocketWithX509);
        }

        let options = self.build_options();
        let (client, event_loop) = AsyncClient::new(options, 10);
        *self.client.lock().unwrap() = Some(client.clone());
        *self.last_failure.lock().unwrap() = None;
        self.phase_tx.send_replace(Phase::Connecting);
        self.shutdown_tx.send_replace(false);
        self.spawn_worker(event_loop);

        let span = connection_span!(transport = "mqtt", host = %self.config.hostname);
        match self.wait_for_connack().instrument(span).await {
            Ok(()) => {}
            Err(connect_error) => {
                let _ = self.close().await;
                return Err(connect_error);
            }
        }

        if let Err(subscribe_error) = self
            .channels
            .channel(MessageCategory::Telemetry)
            .start(&client)
            .await
        {
            let _ = self.close().await;
            return Err(TransportError::open_failed(subscribe_error));
        }
        info!(host = %self.config.hostname, "broker connection open");
        Ok(())
    }

    /// Disconnect from the broker and stop the worker. Idempotent,
    /// best-effort: a broker that is already gone is not an error.
    pub async fn close(&self) -> TransportResult<()> {
        self.phase_tx.send_replace(Phase::Closed);
        let client = self.client.lock().unwrap().take();
        if let Some(client) = client {
            self.channels.stop_all(&client).await;
            if let Err(disconnect_error) = client.disconnect().await {
                debug!(%disconnect_error, "broker already disconnected");
            }
        }
        self.shutdown_tx.send_replace(true);

        let task = self.worker.lock().unwrap().take();
        if let Some(mut task) = task {
            if timeout(WORKER_STOP_GRACE, &mut task).await.is_err() {
                task.abort();
                if timeout(WORKER_STOP_GRACE, &mut task).await.is_err() {
                    warn!("broker worker did not stop after abort");
                }
            }
        }
        Ok(())
    }

    /// Publish a device-to-cloud message and report the hub's verdict as a
    /// status code. Publish failures are swallowed into
    /// [`HubStatusCode::Error`]; calling on a closed connection is a caller
    /// bug and errors instead.
    pub async fn send_event(&self, message: &TransportMessage) -> TransportResult<HubStatusCode> {
        // twin and method traffic legitimately sends empty bodies
        if message.body.is_empty() && message.category == MessageCategory::Telemetry {
            return Ok(HubStatusCode::BadFormat);
        }
        if self.state() != State::Open {
            return Err(TransportError::NotOpen {
                state: self.state(),
            });
        }
        if self.config.is_sas_auth() && self.config.token_renewal_due() {
            warn!("shared access token needs renewal; refusing to publish");
            return Ok(HubStatusCode::Unauthorized);
        }
        let Some(client) = self.client.lock().unwrap().clone() else {
            return Err(TransportError::NotOpen {
                state: self.state(),
            });
        };

        let span = message_span!(category = ?message.category);
        async move {
            let channel = self.channels.channel(message.category);
            if !channel.is_started() {
                if let Err(subscribe_error) = channel.start(&client).await {
                    warn!(%subscribe_error, category = ?message.category, "channel start failed");
                    return Ok(HubStatusCode::Error);
                }
            }

            let topic = channel.publish_topic(message);
            match client
                .publish(topic, QoS::AtLeastOnce, false, message.body.clone())
                .await
            {
                Ok(()) => Ok(HubStatusCode::Ok),
                Err(publish_error) => {
                    warn!(%publish_error, "publish failed");
                    Ok(HubStatusCode::Error)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Subscribe the channel for a message category so its inbound traffic
    /// starts flowing. Messaging is subscribed at open; twin and methods
    /// opt in here.
    pub async fn enable_receiving(&self, category: MessageCategory) -> TransportResult<()> {
        if self.state() != State::Open {
            return Err(TransportError::NotOpen {
                state: self.state(),
            });
        }
        let Some(client) = self.client.lock().unwrap().clone() else {
            return Err(TransportError::NotOpen {
                state: self.state(),
            });
        };
        self.channels
            .channel(category)
            .start(&client)
            .await
            .map_err(|subscribe_error| TransportError::ReceiveFailed(subscribe_error.to_string()))
    }

    /// Pull the next received message: method calls first, then twin
    /// responses, then cloud-to-device messages.
    pub fn receive_message(&self) -> TransportResult<Option<TransportMessage>> {
        if self.state() != State::Open {
            return Err(TransportError::NotOpen {
                state: self.state(),
            });
        }
        Ok(self.channels.next_inbound())
    }

    /// Complete a previously received message. Quality-of-service
    /// acknowledgements are handled by the client library, so only
    /// completion on an open connection reports success.
    pub fn send_message_result(&self, _message: &TransportMessage, outcome: AckOutcome) -> bool {
        outcome == AckOutcome::Complete && self.state() == State::Open
    }

    fn build_options(&self) -> MqttOptions {
        let config = &self.config;
        let mut options = if config.use_websocket {
            let url = format!(
                "wss://{}/$iothub/websocket?iothub-no-client-cert=true",
                config.hostname
            );
            let mut options = MqttOptions::new(&config.device_id, url, WEBSOCKET_PORT);
            options.set_transport(Transport::wss_with_default_config());
            options
        } else {
            let mut options = MqttOptions::new(&config.device_id, &config.hostname, MQTT_PORT);
            options.set_transport(Transport::tls_with_default_config());
            options
        };

        if config.is_sas_auth() {
            let username = format!(
                "{}/{}/?api-version={API_VERSION}&DeviceClientType={CLIENT_TYPE}",
                config.hostname, config.device_id
            );
            let password = config.sas_token().unwrap_or_default();
            options.set_credentials(username, password);
        }
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(false);
        options
    }

    fn spawn_worker(&self, mut event_loop: rumqttc::EventLoop) {
        let phase_tx = self.phase_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let channels = Arc::clone(&self.channels);
        let listeners = Arc::clone(&self.listeners);
        let last_failure = Arc::clone(&self.last_failure);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("shutdown signal received, stopping broker worker");
                            break;
                        }
                    }
                    polled = event_loop.poll() => match polled {
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                            if ack.code == ConnectReturnCode::Success {
                                phase_tx.send_replace(Phase::Connected);
                                info!("broker acknowledged connection");
                                listeners.lock().unwrap().notify_connection_established();
                            } else {
                                debug!(code = ?ack.code, "connection acknowledgement refused");
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            match channels.route_inbound(&publish.topic, publish.payload) {
                                Some(received) => {
                                    listeners
                                        .lock()
                                        .unwrap()
                                        .notify_message_received(&received, None);
                                }
                                None => {
                                    debug!(topic = %publish.topic, "publish on unrecognized topic");
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(poll_error) => {
                            let status_error = classify_connection_error(&poll_error);
                            let was_connected =
                                matches!(&*phase_tx.borrow(), Phase::Connected);
                            error!(%status_error, "broker connection failed");
                            if was_connected {
                                listeners
                                    .lock()
                                    .unwrap()
                                    .notify_connection_lost(Some(&status_error));
                            }
                            *last_failure.lock().unwrap() = Some(status_error);
                            phase_tx.send_replace(Phase::Failed(poll_error.to_string()));
                            break;
                        }
                    }
                }
            }
            debug!("broker worker stopped");
        });

        let previous = self.worker.lock().unwrap().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Block until the broker accepts or rejects the connection.
    async fn wait_for_connack(&self) -> TransportResult<()> {
        let mut phase_rx = self.phase_tx.subscribe();
        let waited = timeout(CONNECT_TIMEOUT, async {
            loop {
                {
                    let phase = phase_rx.borrow_and_update().clone();
                    match phase {
                        Phase::Connected => return Ok(()),
                        Phase::Failed(reason) => return Err(reason),
                        Phase::Closed | Phase::Connecting => {}
                    }
                }
                if phase_rx.changed().await.is_err() {
                    return Err("broker worker stopped".to_owned());
                }
            }
        })
        .await;

        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => {
                let stored = self.last_failure.lock().unwrap().take();
                match stored {
                    Some(status_error) => Err(TransportError::Status(status_error)),
                    None => Err(TransportError::engine(reason)),
                }
            }
            Err(_) => Err(TransportError::OpenTimeout(CONNECT_TIMEOUT)),
        }
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(task) = worker.take() {
                task.abort();
            }
        }
    }
}

/// Map a broker-client failure onto the error taxonomy.
fn classify_connection_error(error: &ConnectionError) -> ConnectionStatusError {
    let fault = match error {
        ConnectionError::ConnectionRefused(return_code) => {
            let reason = match return_code {
                ConnectReturnCode::RefusedProtocolVersion => {
                    mqtt_reason_code::INVALID_PROTOCOL_VERSION
                }
                ConnectReturnCode::BadClientId => mqtt_reason_code::INVALID_CLIENT_ID,
                ConnectReturnCode::ServiceUnavailable => mqtt_reason_code::BROKER_UNAVAILABLE,
                ConnectReturnCode::BadUserNamePassword => mqtt_reason_code::FAILED_AUTHENTICATION,
                ConnectReturnCode::NotAuthorized => mqtt_reason_code::NOT_AUTHORIZED,
                ConnectReturnCode::Success => mqtt_reason_code::CLIENT_EXCEPTION,
            };
            MqttClientFault::new(reason)
        }
        ConnectionError::Io(io_error) => {
            let cause = match io_error.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::AddrNotAvailable => {
                    ClientFaultCause::UnknownHost(io_error.to_string())
                }
                std::io::ErrorKind::Interrupted => ClientFaultCause::Interrupted,
                _ => ClientFaultCause::Other(io_error.to_string()),
            };
            MqttClientFault::with_cause(mqtt_reason_code::CLIENT_EXCEPTION, cause)
        }
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            MqttClientFault::new(mqtt_reason_code::CLIENT_TIMEOUT)
        }
        ConnectionError::MqttState(_) => MqttClientFault::new(mqtt_reason_code::CONNECTION_LOST),
        other => MqttClientFault::with_cause(
            mqtt_reason_code::CLIENT_EXCEPTION,
            ClientFaultCause::Other(other.to_string()),
        ),
    };
    from_mqtt_client_fault(&fault)
}
