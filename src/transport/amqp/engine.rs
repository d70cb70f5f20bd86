//! Protocol-engine seam for the AMQP transport.
//!
//! The connection state machine never talks to an AMQP stack directly. It
//! consumes a stream of [`EngineEvent`]s and issues commands through an
//! [`EngineHandle`], mirroring the client/event-loop split the MQTT side
//! gets from its broker library. Production wires a real protocol engine
//! behind the trait; tests script the event stream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::transport::AckOutcome;

/// Errors surfaced by engine commands.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine's worker has stopped and no longer accepts commands.
    #[error("engine command channel closed")]
    ChannelClosed,
    /// The engine rejected or failed a command.
    #[error("engine failure: {0}")]
    Failure(String),
}

/// Direction of a link from the device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    Sender,
    Receiver,
}

/// Description of one link to attach over the physical session.
#[derive(Debug, Clone)]
pub struct LinkDescriptor {
    /// Unique link name, used to correlate engine events back to a channel.
    pub name: String,
    /// Node address the link targets (sender) or sources (receiver).
    pub address: String,
    pub direction: LinkDirection,
}

impl LinkDescriptor {
    pub fn sender(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            direction: LinkDirection::Sender,
        }
    }

    pub fn receiver(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            direction: LinkDirection::Receiver,
        }
    }
}

/// Wire-level message as the engine sees it, in both directions.
#[derive(Debug, Clone, Default)]
pub struct EngineMessage {
    pub body: Bytes,
    pub application_properties: HashMap<String, String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Reply-to address, used by request/response nodes.
    pub reply_to: Option<String>,
    /// Target address override for anonymous-terminus sends.
    pub to: Option<String>,
}

/// Events the engine worker emits as the reactor makes progress.
#[derive(Debug)]
pub enum EngineEvent {
    /// The worker is up; the connection should bind the remote host.
    Initialized,
    /// The physical transport is bound and the protocol layers are in place.
    Bound,
    /// Flow-control update for the sending side of the session.
    LinkFlow { credit: i32 },
    /// The peer confirmed a link attach.
    LinkRemoteOpen { link: String },
    /// The peer detached a link, possibly carrying an error condition.
    LinkRemoteClose {
        link: String,
        condition: Option<String>,
    },
    /// An inbound transfer arrived on a receiver link.
    Delivery {
        link: String,
        delivery_tag: u64,
        message: EngineMessage,
    },
    /// The peer settled an outbound transfer.
    Disposition { delivery_tag: u64, accepted: bool },
    /// Transport-level failure, possibly carrying an error condition.
    TransportError { condition: Option<String> },
    /// The physical connection came unbound.
    ConnectionUnbound,
    /// The worker has fully stopped; no further events will arrive.
    ShutdownComplete,
}

/// Command surface of a running engine.
///
/// All methods are fire-and-forget from the state machine's perspective:
/// results come back asynchronously as [`EngineEvent`]s.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Bind the physical transport to the remote host.
    async fn bind(&self, host: &str) -> Result<(), EngineError>;

    /// Layer a websocket beneath the protocol transport. Must be issued
    /// before the first open frame goes out.
    async fn enable_websocket(
        &self,
        host: &str,
        path: &str,
        subprotocol: &str,
    ) -> Result<(), EngineError>;

    /// Attach a link over the session.
    async fn attach_link(&self, descriptor: LinkDescriptor) -> Result<(), EngineError>;

    /// Queue an outbound transfer on the named sender link.
    async fn transfer(
        &self,
        link: &str,
        message: EngineMessage,
        delivery_tag: u64,
    ) -> Result<(), EngineError>;

    /// Settle an inbound delivery with the given outcome.
    async fn settle(
        &self,
        link: &str,
        delivery_tag: u64,
        outcome: AckOutcome,
    ) -> Result<(), EngineError>;

    /// Tear the engine down. The worker emits [`EngineEvent::ShutdownComplete`]
    /// once the reactor has fully stopped.
    async fn shutdown(&self) -> Result<(), EngineError>;
}

/// Factory for engine runs. Each connection epoch starts a fresh worker;
/// reconnection discards the previous run entirely.
pub trait AmqpEngine: Send {
    fn start(&mut self) -> (Arc<dyn EngineHandle>, mpsc::Receiver<EngineEvent>);
}
