//! Mock implementations for testing
//!
//! Provides a scriptable protocol engine and a recording listener so the
//! connection state machines can be exercised without a live hub.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::transport::amqp::engine::{
    AmqpEngine, EngineError, EngineEvent, EngineHandle, EngineMessage, LinkDescriptor,
};
use crate::transport::error::ConnectionStatusError;
use crate::transport::{AckOutcome, MessageCategory, TransportListener, TransportMessage};

const EVENT_BUFFER: usize = 64;

/// Every command a connection issued to the mock engine, in order.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Bind(String),
    EnableWebsocket {
        host: String,
        path: String,
        subprotocol: String,
    },
    AttachLink {
        name: String,
        address: String,
    },
    Transfer {
        link: String,
        message: EngineMessage,
        delivery_tag: u64,
    },
    Settle {
        link: String,
        delivery_tag: u64,
        outcome: AckOutcome,
    },
    Shutdown,
}

/// How the mock answers connection commands.
#[derive(Debug, Clone)]
pub struct MockEngineBehavior {
    /// Emit `Bound` when `bind` is called.
    pub confirm_bind: bool,
    /// Confirm each `attach_link` with `LinkRemoteOpen`.
    pub confirm_links: bool,
    /// Answer put-token transfers on the authentication link with a
    /// status 200 reply.
    pub grant_tokens: bool,
    /// Credit announced via `LinkFlow` right after binding.
    pub initial_credit: i32,
}

impl Default for MockEngineBehavior {
    fn default() -> Self {
        Self {
            confirm_bind: true,
            confirm_links: true,
            grant_tokens: true,
            initial_credit: 100,
        }
    }
}

/// Scriptable protocol engine. Each `start` opens a fresh epoch whose event
/// stream the test (and the mock's own auto-responses) can feed.
pub struct MockEngine {
    behavior: MockEngineBehavior,
    events: Arc<StdMutex<Option<mpsc::Sender<EngineEvent>>>>,
    commands: Arc<Mutex<Vec<EngineCommand>>>,
    epochs: Arc<AtomicU32>,
}

/// Test-side handle onto a [`MockEngine`], alive across epochs.
#[derive(Clone)]
pub struct MockEngineController {
    events: Arc<StdMutex<Option<mpsc::Sender<EngineEvent>>>>,
    commands: Arc<Mutex<Vec<EngineCommand>>>,
    epochs: Arc<AtomicU32>,
}

impl MockEngine {
    pub fn new() -> (Self, MockEngineController) {
        Self::with_behavior(MockEngineBehavior::default())
    }

    pub fn with_behavior(behavior: MockEngineBehavior) -> (Self, MockEngineController) {
        let events = Arc::new(StdMutex::new(None));
        let commands = Arc::new(Mutex::new(Vec::new()));
        let epochs = Arc::new(AtomicU32::new(0));
        let controller = MockEngineController {
            events: Arc::clone(&events),
            commands: Arc::clone(&commands),
            epochs: Arc::clone(&epochs),
        };
        (
            Self {
                behavior,
                events,
                commands,
                epochs,
            },
            controller,
        )
    }
}

impl AmqpEngine for MockEngine {
    fn start(&mut self) -> (Arc<dyn EngineHandle>, mpsc::Receiver<EngineEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        // the worker is up before any command arrives
        let _ = event_tx.try_send(EngineEvent::Initialized);
        *self.events.lock().unwrap() = Some(event_tx.clone());
        self.epochs.fetch_add(1, Ordering::SeqCst);

        let handle = MockEngineHandle {
            behavior: self.behavior.clone(),
            events: event_tx,
            commands: Arc::clone(&self.commands),
        };
        (Arc::new(handle), event_rx)
    }
}

impl MockEngineController {
    /// Feed an event into the current epoch's stream.
    pub async fn emit(&self, event: EngineEvent) {
        let sender = self.events.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    pub async fn commands(&self) -> Vec<EngineCommand> {
        self.commands.lock().await.clone()
    }

    pub async fn clear_commands(&self) {
        self.commands.lock().await.clear();
    }

    /// How many epochs have been started.
    pub fn epochs(&self) -> u32 {
        self.epochs.load(Ordering::SeqCst)
    }
}

struct MockEngineHandle {
    behavior: MockEngineBehavior,
    events: mpsc::Sender<EngineEvent>,
    commands: Arc<Mutex<Vec<EngineCommand>>>,
}

impl MockEngineHandle {
    async fn record(&self, command: EngineCommand) {
        self.commands.lock().await.push(command);
    }

    async fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event).await;
    }
}

#[async_trait]
impl EngineHandle for MockEngineHandle {
    async fn bind(&self, host: &str) -> Result<(), EngineError> {
        self.record(EngineCommand::Bind(host.to_owned())).await;
        if self.behavior.confirm_bind {
            self.emit(EngineEvent::Bound).await;
            if self.behavior.initial_credit > 0 {
                self.emit(EngineEvent::LinkFlow {
                    credit: self.behavior.initial_credit,
                })
                .await;
            }
        }
        Ok(())
    }

    async fn enable_websocket(
        &self,
        host: &str,
        path: &str,
        subprotocol: &str,
    ) -> Result<(), EngineError> {
        self.record(EngineCommand::EnableWebsocket {
            host: host.to_owned(),
            path: path.to_owned(),
            subprotocol: subprotocol.to_owned(),
        })
        .await;
        Ok(())
    }

    async fn attach_link(&self, descriptor: LinkDescriptor) -> Result<(), EngineError> {
        self.record(EngineCommand::AttachLink {
            name: descriptor.name.clone(),
            address: descriptor.address.clone(),
        })
        .await;
        if self.behavior.confirm_links {
            self.emit(EngineEvent::LinkRemoteOpen {
                link: descriptor.name,
            })
            .await;
        }
        Ok(())
    }

    async fn transfer(
        &self,
        link: &str,
        message: EngineMessage,
        delivery_tag: u64,
    ) -> Result<(), EngineError> {
        self.record(EngineCommand::Transfer {
            link: link.to_owned(),
            message: message.clone(),
            delivery_tag,
        })
        .await;

        if self.behavior.grant_tokens && link.starts_with("cbs-sender-") {
            let reply_link = link.replacen("sender", "receiver", 1);
            let mut reply = EngineMessage {
                correlation_id: message.message_id,
                ..Default::default()
            };
            reply
                .application_properties
                .insert("status-code".to_owned(), "200".to_owned());
            self.emit(EngineEvent::Delivery {
                link: reply_link,
                delivery_tag: u64::MAX,
                message: reply,
            })
            .await;
        }
        Ok(())
    }

    async fn settle(
        &self,
        link: &str,
        delivery_tag: u64,
        outcome: AckOutcome,
    ) -> Result<(), EngineError> {
        self.record(EngineCommand::Settle {
            link: link.to_owned(),
            delivery_tag,
            outcome,
        })
        .await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.record(EngineCommand::Shutdown).await;
        self.emit(EngineEvent::ShutdownComplete).await;
        Ok(())
    }
}

/// What a listener observed, flattened for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Established,
    Lost {
        error: Option<String>,
        retryable: Option<bool>,
    },
    MessageReceived {
        category: MessageCategory,
        error: Option<String>,
    },
    MessageSent {
        category: MessageCategory,
        error: Option<String>,
    },
}

/// Listener that records every callback in order.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: StdMutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn established_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| **e == ListenerEvent::Established)
            .count()
    }

    pub fn lost_events(&self) -> Vec<ListenerEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, ListenerEvent::Lost { .. }))
            .collect()
    }
}

impl TransportListener for RecordingListener {
    fn on_connection_established(&self) {
        self.events
            .lock()
            .unwrap()
            .push(ListenerEvent::Established);
    }

    fn on_connection_lost(&self, error: Option<&ConnectionStatusError>) {
        self.events.lock().unwrap().push(ListenerEvent::Lost {
            error: error.map(|e| e.to_string()),
            retryable: error.map(ConnectionStatusError::is_retryable),
        });
    }

    fn on_message_received(
        &self,
        message: &TransportMessage,
        error: Option<&ConnectionStatusError>,
    ) {
        self.events
            .lock()
            .unwrap()
            .push(ListenerEvent::MessageReceived {
                category: message.category,
                error: error.map(|e| e.to_string()),
            });
    }

    fn on_message_sent(&self, message: &TransportMessage, error: Option<&ConnectionStatusError>) {
        self.events.lock().unwrap().push(ListenerEvent::MessageSent {
            category: message.category,
            error: error.map(|e| e.to_string()),
        });
    }
}
