//! Session/link multiplexer.
//!
//! One physical AMQP session carries several logical channels, each backed
//! by a sender/receiver link pair: authentication, telemetry, twin, and
//! direct methods. The multiplexer owns channel registration, link naming,
//! per-channel open progress, and the mapping between wire messages and
//! [`TransportMessage`]s.

use tracing::debug;
use uuid::Uuid;

use crate::config::DeviceConfig;
use crate::transport::amqp::cbs;
use crate::transport::amqp::engine::{EngineHandle, EngineMessage, LinkDescriptor};
use crate::transport::error::{ConnectionStatusError, ProtocolError};
use crate::transport::{MessageCategory, TransportMessage};

/// Which logical channel a link pair belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelCategory {
    Authentication,
    Telemetry,
    DeviceTwin,
    DeviceMethods,
}

impl From<MessageCategory> for ChannelCategory {
    fn from(category: MessageCategory) -> Self {
        match category {
            MessageCategory::Telemetry => ChannelCategory::Telemetry,
            MessageCategory::DeviceTwin => ChannelCategory::DeviceTwin,
            MessageCategory::DeviceMethods => ChannelCategory::DeviceMethods,
        }
    }
}

impl ChannelCategory {
    fn tag(self) -> &'static str {
        match self {
            ChannelCategory::Authentication => "cbs",
            ChannelCategory::Telemetry => "telemetry",
            ChannelCategory::DeviceTwin => "twin",
            ChannelCategory::DeviceMethods => "methods",
        }
    }

    fn message_category(self) -> Option<MessageCategory> {
        match self {
            ChannelCategory::Authentication => None,
            ChannelCategory::Telemetry => Some(MessageCategory::Telemetry),
            ChannelCategory::DeviceTwin => Some(MessageCategory::DeviceTwin),
            ChannelCategory::DeviceMethods => Some(MessageCategory::DeviceMethods),
        }
    }

    fn sender_address(self, device_id: &str) -> String {
        match self {
            ChannelCategory::Authentication => cbs::CBS_TARGET.to_owned(),
            ChannelCategory::Telemetry => format!("/devices/{device_id}/messages/events"),
            ChannelCategory::DeviceTwin => format!("/devices/{device_id}/twin"),
            ChannelCategory::DeviceMethods => format!("/devices/{device_id}/methods/devicebound"),
        }
    }

    fn receiver_address(self, device_id: &str) -> String {
        match self {
            ChannelCategory::Authentication => cbs::CBS_TARGET.to_owned(),
            ChannelCategory::Telemetry => format!("/devices/{device_id}/messages/devicebound"),
            ChannelCategory::DeviceTwin => format!("/devices/{device_id}/twin"),
            ChannelCategory::DeviceMethods => format!("/devices/{device_id}/methods/devicebound"),
        }
    }
}

/// Open progress of one link pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    /// Registered but never attached this epoch.
    Unknown,
    /// Attach frames sent, remote confirmation pending.
    Opening,
    /// Both links confirmed by the peer.
    Opened,
}

#[derive(Debug)]
struct LogicalChannel {
    category: ChannelCategory,
    state: ChannelState,
    sender_opened: bool,
    receiver_opened: bool,
    sender_link: String,
    receiver_link: String,
    sender_address: String,
    receiver_address: String,
}

impl LogicalChannel {
    fn new(category: ChannelCategory, device_id: &str) -> Self {
        let tag = category.tag();
        Self {
            category,
            state: ChannelState::Unknown,
            sender_opened: false,
            receiver_opened: false,
            sender_link: format!("{tag}-sender-{device_id}"),
            receiver_link: format!("{tag}-receiver-{device_id}"),
            sender_address: category.sender_address(device_id),
            receiver_address: category.receiver_address(device_id),
        }
    }

    fn reset(&mut self) {
        self.state = ChannelState::Unknown;
        self.sender_opened = false;
        self.receiver_opened = false;
    }
}

/// Channel registry and link bookkeeping for one AMQP connection.
#[derive(Debug)]
pub struct Multiplexer {
    device_id: String,
    channels: Vec<LogicalChannel>,
    authenticated: bool,
    next_delivery_tag: u64,
}

impl Multiplexer {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            channels: Vec::new(),
            authenticated: false,
            next_delivery_tag: 0,
        }
    }

    /// Register a logical channel. Ignored when the configuration is absent
    /// or the channel is already registered.
    pub fn add_channel(&mut self, category: ChannelCategory, config: Option<&DeviceConfig>) {
        if config.is_none() {
            return;
        }
        if self.channels.iter().any(|c| c.category == category) {
            return;
        }
        self.channels
            .push(LogicalChannel::new(category, &self.device_id));
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn mark_authenticated(&mut self) {
        self.authenticated = true;
    }

    /// Attach the authentication link pair. Idempotent per epoch.
    pub async fn open_authentication_links(
        &mut self,
        handle: &dyn EngineHandle,
    ) -> Result<(), ConnectionStatusError> {
        self.attach_channel_links(handle, |category| {
            category == ChannelCategory::Authentication
        })
        .await
    }

    /// Attach the device-operation link pairs. No-op until authentication
    /// has completed.
    pub async fn open_channel_links(
        &mut self,
        handle: &dyn EngineHandle,
    ) -> Result<(), ConnectionStatusError> {
        if !self.authenticated {
            return Ok(());
        }
        self.attach_channel_links(handle, |category| {
            category != ChannelCategory::Authentication
        })
        .await
    }

    async fn attach_channel_links(
        &mut self,
        handle: &dyn EngineHandle,
        select: impl Fn(ChannelCategory) -> bool,
    ) -> Result<(), ConnectionStatusError> {
        for channel in &mut self.channels {
            if !select(channel.category) || channel.state != ChannelState::Unknown {
                continue;
            }
            debug!(channel = channel.category.tag(), "attaching link pair");
            handle
                .attach_link(LinkDescriptor::sender(
                    channel.sender_link.clone(),
                    channel.sender_address.clone(),
                ))
                .await
                .map_err(engine_failure)?;
            handle
                .attach_link(LinkDescriptor::receiver(
                    channel.receiver_link.clone(),
                    channel.receiver_address.clone(),
                ))
                .await
                .map_err(engine_failure)?;
            channel.state = ChannelState::Opening;
        }
        Ok(())
    }

    /// Whether the named link belongs to a registered channel.
    pub fn is_link_found(&self, link: &str) -> bool {
        self.channels
            .iter()
            .any(|c| c.sender_link == link || c.receiver_link == link)
    }

    /// Record a remote link open. Returns `true` exactly when every
    /// registered channel has both links confirmed.
    pub fn on_link_remote_open(&mut self, link: &str) -> bool {
        for channel in &mut self.channels {
            if channel.sender_link == link {
                channel.sender_opened = true;
            } else if channel.receiver_link == link {
                channel.receiver_opened = true;
            } else {
                continue;
            }
            if channel.sender_opened && channel.receiver_opened {
                channel.state = ChannelState::Opened;
            }
        }
        !self.channels.is_empty()
            && self
                .channels
                .iter()
                .all(|c| c.state == ChannelState::Opened)
    }

    /// The category owning the named receiver link. Authentication replies
    /// map to [`ChannelCategory::Authentication`].
    pub fn category_for_receiver(&self, link: &str) -> Option<ChannelCategory> {
        self.channels
            .iter()
            .find(|c| c.receiver_link == link)
            .map(|c| c.category)
    }

    /// Send a message over the channel matching its category. Fails when no
    /// channel is registered for the category.
    pub async fn send(
        &mut self,
        handle: &dyn EngineHandle,
        message: &TransportMessage,
    ) -> Result<u64, ConnectionStatusError> {
        let category = ChannelCategory::from(message.category);
        let link = self
            .channels
            .iter()
            .find(|c| c.category == category)
            .map(|c| c.sender_link.clone())
            .ok_or_else(|| {
                ConnectionStatusError::protocol(ProtocolError::NotFound).with_message(format!(
                    "no channel registered for {:?} messages",
                    message.category
                ))
            })?;

        let tag = self.next_delivery_tag;
        self.next_delivery_tag = self.next_delivery_tag.wrapping_add(1);
        handle
            .transfer(&link, outbound_to_wire(message), tag)
            .await
            .map_err(engine_failure)?;
        Ok(tag)
    }

    /// Send a raw wire message over the authentication sender link.
    pub async fn send_authentication(
        &mut self,
        handle: &dyn EngineHandle,
        message: EngineMessage,
    ) -> Result<(), ConnectionStatusError> {
        let link = self
            .channels
            .iter()
            .find(|c| c.category == ChannelCategory::Authentication)
            .map(|c| c.sender_link.clone())
            .ok_or_else(|| {
                ConnectionStatusError::protocol(ProtocolError::NotFound)
                    .with_message("authentication channel not registered")
            })?;
        let tag = self.next_delivery_tag;
        self.next_delivery_tag = self.next_delivery_tag.wrapping_add(1);
        handle
            .transfer(&link, message, tag)
            .await
            .map_err(engine_failure)?;
        Ok(())
    }

    /// Convert an inbound wire message into a [`TransportMessage`], tagged
    /// with the category of the link it arrived on. Authentication traffic
    /// and unknown links yield `None`.
    pub fn convert_inbound(
        &self,
        link: &str,
        delivery_tag: u64,
        wire: &EngineMessage,
    ) -> Option<TransportMessage> {
        let category = self.category_for_receiver(link)?.message_category()?;
        let mut message = TransportMessage::new(category, wire.body.clone());
        message.message_id = wire.message_id.as_deref().and_then(parse_uuid);
        message.correlation_id = wire.correlation_id.as_deref().and_then(parse_uuid);
        message.properties = wire.application_properties.clone();
        message.delivery_tag = Some(delivery_tag);
        Some(message)
    }

    /// The receiver link the given message arrived on, by category.
    pub fn receiver_link_for(&self, category: MessageCategory) -> Option<&str> {
        let category = ChannelCategory::from(category);
        self.channels
            .iter()
            .find(|c| c.category == category)
            .map(|c| c.receiver_link.as_str())
    }

    /// Drop per-epoch progress so the next open starts from scratch.
    pub fn reset(&mut self) {
        self.authenticated = false;
        for channel in &mut self.channels {
            channel.reset();
        }
    }
}

fn engine_failure(error: crate::transport::amqp::engine::EngineError) -> ConnectionStatusError {
    ConnectionStatusError::protocol(ProtocolError::Generic)
        .with_message(error.to_string())
        .with_retryable(true)
}

fn parse_uuid(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw).ok()
}

fn outbound_to_wire(message: &TransportMessage) -> EngineMessage {
    EngineMessage {
        body: message.body.clone(),
        application_properties: message.properties.clone(),
        message_id: message.message_id.map(|id| id.to_string()),
        correlation_id: message.correlation_id.map(|id| id.to_string()),
        reply_to: None,
        to: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::config::AuthConfig;
    use crate::transport::amqp::engine::{EngineError, EngineHandle};
    use crate::transport::AckOutcome;

    #[derive(Default)]
    struct RecordingHandle {
        attached: Mutex<Vec<LinkDescriptor>>,
        transfers: Mutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl EngineHandle for RecordingHandle {
        async fn bind(&self, _host: &str) -> Result<(), EngineError> {
            Ok(())
        }

        async fn enable_websocket(
            &self,
            _host: &str,
            _path: &str,
            _subprotocol: &str,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        async fn attach_link(&self, descriptor: LinkDescriptor) -> Result<(), EngineError> {
            self.attached.lock().unwrap().push(descriptor);
            Ok(())
        }

        async fn transfer(
            &self,
            link: &str,
            _message: EngineMessage,
            delivery_tag: u64,
        ) -> Result<(), EngineError> {
            self.transfers
                .lock()
                .unwrap()
                .push((link.to_owned(), delivery_tag));
            Ok(())
        }

        async fn settle(
            &self,
            _link: &str,
            _delivery_tag: u64,
            _outcome: AckOutcome,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn config() -> DeviceConfig {
        DeviceConfig::new(
            "contoso.azure-devices.net",
            "thermostat-01",
            "contoso",
            AuthConfig::SasToken {
                shared_access_key: "key".to_owned(),
                current_token: String::new(),
                token_expiry: None,
            },
        )
        .unwrap()
    }

    fn full_multiplexer() -> Multiplexer {
        let config = config();
        let mut mux = Multiplexer::new(&config.device_id);
        mux.add_channel(ChannelCategory::Authentication, Some(&config));
        mux.add_channel(ChannelCategory::Telemetry, Some(&config));
        mux.add_channel(ChannelCategory::DeviceTwin, Some(&config));
        mux.add_channel(ChannelCategory::DeviceMethods, Some(&config));
        mux
    }

    fn open_all(mux: &mut Multiplexer) -> bool {
        let links: Vec<(String, String)> = mux
            .channels
            .iter()
            .map(|c| (c.sender_link.clone(), c.receiver_link.clone()))
            .collect();
        let mut all = false;
        for (sender, receiver) in links {
            mux.on_link_remote_open(&sender);
            all = mux.on_link_remote_open(&receiver);
        }
        all
    }

    #[test]
    fn add_channel_is_idempotent_and_needs_config() {
        let config = config();
        let mut mux = Multiplexer::new(&config.device_id);
        mux.add_channel(ChannelCategory::Telemetry, None);
        assert!(mux.channels.is_empty());

        mux.add_channel(ChannelCategory::Telemetry, Some(&config));
        mux.add_channel(ChannelCategory::Telemetry, Some(&config));
        assert_eq!(mux.channels.len(), 1);
    }

    #[tokio::test]
    async fn operation_links_wait_for_authentication() {
        let mut mux = full_multiplexer();
        let handle = RecordingHandle::default();

        mux.open_channel_links(&handle).await.unwrap();
        assert!(handle.attached.lock().unwrap().is_empty());

        mux.mark_authenticated();
        mux.open_channel_links(&handle).await.unwrap();
        // three operation channels, sender + receiver each
        assert_eq!(handle.attached.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn open_gate_requires_every_link() {
        let mut mux = full_multiplexer();
        let handle = RecordingHandle::default();
        mux.open_authentication_links(&handle).await.unwrap();
        mux.mark_authenticated();
        mux.open_channel_links(&handle).await.unwrap();

        let receiver = mux.channels[0].receiver_link.clone();
        let mut confirmations = Vec::new();
        for channel in &mux.channels {
            confirmations.push(channel.sender_link.clone());
            confirmations.push(channel.receiver_link.clone());
        }
        // withhold the final confirmation
        let last = confirmations.pop().unwrap();
        for link in &confirmations {
            assert!(!mux.on_link_remote_open(link), "gate opened early");
        }
        assert!(mux.on_link_remote_open(&last));
        assert!(mux.is_link_found(&receiver));
        assert!(!mux.is_link_found("stranger-link"));
    }

    #[tokio::test]
    async fn send_routes_by_category_with_distinct_tags() {
        let mut mux = full_multiplexer();
        let handle = RecordingHandle::default();
        mux.mark_authenticated();
        mux.open_channel_links(&handle).await.unwrap();
        open_all(&mut mux);

        let telemetry = TransportMessage::telemetry("hot");
        let twin = TransportMessage::new(MessageCategory::DeviceTwin, "{}");
        let first = mux.send(&handle, &telemetry).await.unwrap();
        let second = mux.send(&handle, &twin).await.unwrap();
        assert_ne!(first, second);

        let transfers = handle.transfers.lock().unwrap();
        assert!(transfers[0].0.starts_with("telemetry-sender"));
        assert!(transfers[1].0.starts_with("twin-sender"));
    }

    #[tokio::test]
    async fn send_without_channel_is_an_error() {
        let config = config();
        let mut mux = Multiplexer::new(&config.device_id);
        mux.add_channel(ChannelCategory::Telemetry, Some(&config));
        let handle = RecordingHandle::default();

        let message = TransportMessage::new(MessageCategory::DeviceMethods, "payload");
        let error = mux.send(&handle, &message).await.unwrap_err();
        assert!(!error.is_retryable());
    }

    #[test]
    fn inbound_conversion_tags_category_and_delivery() {
        let mux = {
            let mut mux = full_multiplexer();
            mux.mark_authenticated();
            mux
        };
        let link = mux.receiver_link_for(MessageCategory::DeviceMethods).unwrap();
        let mut wire = EngineMessage {
            body: bytes::Bytes::from_static(b"reboot"),
            message_id: Some(Uuid::new_v4().to_string()),
            ..Default::default()
        };
        wire.application_properties
            .insert("method-name".to_owned(), "reboot".to_owned());

        let message = mux.convert_inbound(link, 42, &wire).unwrap();
        assert_eq!(message.category, MessageCategory::DeviceMethods);
        assert_eq!(message.delivery_tag, Some(42));
        assert!(message.message_id.is_some());
        assert_eq!(message.properties.get("method-name").unwrap(), "reboot");

        assert!(mux.convert_inbound("stranger-link", 1, &wire).is_none());
    }

    #[test]
    fn reset_clears_epoch_state() {
        let mut mux = full_multiplexer();
        mux.mark_authenticated();
        open_all(&mut mux);
        mux.reset();
        assert!(!mux.is_authenticated());
        assert!(mux.channels.iter().all(|c| c.state == ChannelState::Unknown));
    }
}
