//! Transport layer for device-to-hub communication
//!
//! This module provides the shared transport surface (lifecycle state,
//! message model, listener contract, reconnect policy) and the two wire
//! protocol implementations: AMQP and MQTT.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub mod amqp;
pub mod error;
pub mod mqtt;
pub mod status;

pub use error::ConnectionStatusError;
pub use status::HubStatusCode;

/// Lifecycle state of a transport connection.
///
/// The MQTT transport only uses `Closed` and `Open`; the AMQP transport
/// passes through the intermediate states while its links come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Opening,
    Authenticating,
    LinksOpening,
    Open,
}

/// Which logical message stream a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCategory {
    /// Device-to-cloud events and cloud-to-device commands.
    Telemetry,
    /// Device-state synchronization.
    DeviceTwin,
    /// Remote procedure calls.
    DeviceMethods,
}

/// A message as the transport layer sees it: opaque body bytes plus the
/// routing metadata needed to pick a channel and correlate replies.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub body: Bytes,
    pub category: MessageCategory,
    pub message_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,
    pub properties: HashMap<String, String>,
    /// Wire-level delivery tag for inbound AMQP transfers. `None` for
    /// outbound messages and for transports that settle implicitly.
    pub delivery_tag: Option<u64>,
}

impl TransportMessage {
    pub fn new(category: MessageCategory, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            category,
            message_id: Some(Uuid::new_v4()),
            correlation_id: None,
            properties: HashMap::new(),
            delivery_tag: None,
        }
    }

    /// Device-to-cloud telemetry message.
    pub fn telemetry(body: impl Into<Bytes>) -> Self {
        Self::new(MessageCategory::Telemetry, body)
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Acknowledgement outcome for a previously received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Complete,
    Abandon,
    Reject,
}

/// Callback interface a transport owner implements to observe connection
/// and message events.
///
/// All callbacks are invoked synchronously, in listener registration order.
/// Failures inside a listener are not isolated from the others.
pub trait TransportListener: Send + Sync {
    fn on_connection_established(&self);
    fn on_connection_lost(&self, error: Option<&ConnectionStatusError>);
    fn on_message_received(
        &self,
        message: &TransportMessage,
        error: Option<&ConnectionStatusError>,
    );
    fn on_message_sent(&self, message: &TransportMessage, error: Option<&ConnectionStatusError>);
}

/// Insertion-ordered listener set. Registrations are never deduplicated and
/// never removed automatically.
#[derive(Default, Clone)]
pub struct ListenerRegistry {
    listeners: Vec<Arc<dyn TransportListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn TransportListener>) {
        self.listeners.push(listener);
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn notify_connection_established(&self) {
        for listener in &self.listeners {
            listener.on_connection_established();
        }
    }

    pub fn notify_connection_lost(&self, error: Option<&ConnectionStatusError>) {
        for listener in &self.listeners {
            listener.on_connection_lost(error);
        }
    }

    pub fn notify_message_received(
        &self,
        message: &TransportMessage,
        error: Option<&ConnectionStatusError>,
    ) {
        for listener in &self.listeners {
            listener.on_message_received(message, error);
        }
    }

    pub fn notify_message_sent(
        &self,
        message: &TransportMessage,
        error: Option<&ConnectionStatusError>,
    ) {
        for listener in &self.listeners {
            listener.on_message_sent(message, error);
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("len", &self.listeners.len())
            .finish()
    }
}

/// Exponential backoff policy for reconnection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// First-attempt delay in milliseconds.
    pub base_delay_ms: u64,
    /// Ceiling for the computed delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 60_000,
        }
    }
}

impl ReconnectPolicy {
    /// Compute the sleep interval for the given attempt number.
    /// Doubles per attempt from the base, capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(9);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Advance the attempt counter, wrapping to zero at the integer
    /// overflow boundary.
    pub fn next_attempt(attempt: u32) -> u32 {
        if attempt == u32::MAX {
            0
        } else {
            attempt + 1
        }
    }
}
