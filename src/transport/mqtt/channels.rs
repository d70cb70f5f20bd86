//! Per-category MQTT channels.
//!
//! The hub multiplexes three kinds of traffic over one broker session:
//! cloud-to-device messaging, twin updates, and direct method calls. Each
//! gets a channel owning its topic pair and an inbound queue. Messaging
//! starts with the connection; twin and methods start lazily on first use.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rumqttc::{AsyncClient, QoS};
use tracing::debug;

use crate::transport::{MessageCategory, TransportMessage};

/// Property key carrying the request id a method response answers.
pub const METHOD_REQUEST_ID_PROPERTY: &str = "$rid";
/// Property key carrying the numeric status of a method response.
pub const METHOD_STATUS_PROPERTY: &str = "status";

const DEFAULT_METHOD_STATUS: &str = "200";

/// One category of hub traffic over the shared broker session.
#[derive(Debug)]
pub struct Channel {
    category: MessageCategory,
    subscribe_topic: String,
    /// Topic prefix inbound publishes are matched against.
    inbound_prefix: String,
    publish_prefix: String,
    started: AtomicBool,
    inbound: Mutex<VecDeque<TransportMessage>>,
}

impl Channel {
    fn new(
        category: MessageCategory,
        subscribe_topic: String,
        inbound_prefix: String,
        publish_prefix: String,
    ) -> Self {
        Self {
            category,
            subscribe_topic,
            inbound_prefix,
            publish_prefix,
            started: AtomicBool::new(false),
            inbound: Mutex::new(VecDeque::new()),
        }
    }

    fn messaging(device_id: &str) -> Self {
        Self::new(
            MessageCategory::Telemetry,
            format!("devices/{device_id}/messages/devicebound/#"),
            format!("devices/{device_id}/messages/devicebound"),
            format!("devices/{device_id}/messages/events/"),
        )
    }

    fn twin() -> Self {
        Self::new(
            MessageCategory::DeviceTwin,
            "$iothub/twin/res/#".to_owned(),
            "$iothub/twin/".to_owned(),
            "$iothub/twin/PATCH/properties/reported/".to_owned(),
        )
    }

    fn methods() -> Self {
        Self::new(
            MessageCategory::DeviceMethods,
            "$iothub/methods/POST/#".to_owned(),
            "$iothub/methods/".to_owned(),
            "$iothub/methods/res/".to_owned(),
        )
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Subscribe the channel's inbound topic. Idempotent.
    pub async fn start(&self, client: &AsyncClient) -> Result<(), rumqttc::ClientError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(topic = %self.subscribe_topic, "starting channel");
        match client.subscribe(&self.subscribe_topic, QoS::AtLeastOnce).await {
            Ok(()) => Ok(()),
            Err(subscribe_error) => {
                self.started.store(false, Ordering::SeqCst);
                Err(subscribe_error)
            }
        }
    }

    /// Unsubscribe and drop queued messages. Idempotent, best-effort.
    pub async fn stop(&self, client: &AsyncClient) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(unsubscribe_error) = client.unsubscribe(&self.subscribe_topic).await {
            debug!(%unsubscribe_error, topic = %self.subscribe_topic, "unsubscribe failed");
        }
        self.inbound.lock().unwrap().clear();
    }

    pub fn accepts_topic(&self, topic: &str) -> bool {
        topic.starts_with(&self.inbound_prefix)
    }

    /// Topic an outbound message publishes to.
    pub fn publish_topic(&self, message: &TransportMessage) -> String {
        match self.category {
            MessageCategory::DeviceMethods => {
                let status = message
                    .properties
                    .get(METHOD_STATUS_PROPERTY)
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_METHOD_STATUS);
                let request_id = message
                    .properties
                    .get(METHOD_REQUEST_ID_PROPERTY)
                    .map(String::as_str)
                    .unwrap_or("");
                format!("{}{status}/?$rid={request_id}", self.publish_prefix)
            }
            _ => {
                let bag = property_bag(message);
                format!("{}{bag}", self.publish_prefix)
            }
        }
    }

    pub fn enqueue(&self, message: TransportMessage) {
        self.inbound.lock().unwrap().push_back(message);
    }

    pub fn dequeue(&self) -> Option<TransportMessage> {
        self.inbound.lock().unwrap().pop_front()
    }
}

/// Encode application properties into the topic's trailing property bag.
fn property_bag(message: &TransportMessage) -> String {
    let mut pairs: Vec<String> = message
        .properties
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    pairs.sort();
    pairs.join("&")
}

/// The three traffic channels of one connection.
#[derive(Debug)]
pub struct ChannelSet {
    messaging: Channel,
    twin: Channel,
    methods: Channel,
}

impl ChannelSet {
    pub fn new(device_id: &str) -> Self {
        Self {
            messaging: Channel::messaging(device_id),
            twin: Channel::twin(),
            methods: Channel::methods(),
        }
    }

    pub fn channel(&self, category: MessageCategory) -> &Channel {
        match category {
            MessageCategory::Telemetry => &self.messaging,
            MessageCategory::DeviceTwin => &self.twin,
            MessageCategory::DeviceMethods => &self.methods,
        }
    }

    /// Route an inbound publish to the owning channel's queue. Returns a
    /// copy of the queued message for listener notification.
    pub fn route_inbound(&self, topic: &str, payload: bytes::Bytes) -> Option<TransportMessage> {
        for channel in [&self.methods, &self.twin, &self.messaging] {
            if channel.accepts_topic(topic) {
                let mut message = TransportMessage::new(channel.category, payload);
                if channel.category == MessageCategory::DeviceMethods {
                    decorate_method_call(&mut message, topic);
                }
                channel.enqueue(message.clone());
                return Some(message);
            }
        }
        None
    }

    /// Dequeue the next inbound message, method calls first, then twin
    /// responses, then cloud-to-device messages.
    pub fn next_inbound(&self) -> Option<TransportMessage> {
        self.methods
            .dequeue()
            .or_else(|| self.twin.dequeue())
            .or_else(|| self.messaging.dequeue())
    }

    /// Stop all started channels, in reverse start order.
    pub async fn stop_all(&self, client: &AsyncClient) {
        self.methods.stop(client).await;
        self.twin.stop(client).await;
        self.messaging.stop(client).await;
    }
}

/// Pull the method name and request id out of a method-call topic:
/// `$iothub/methods/POST/{name}/?$rid={id}`.
fn decorate_method_call(message: &mut TransportMessage, topic: &str) {
    let Some(rest) = topic.strip_prefix("$iothub/methods/POST/") else {
        return;
    };
    let mut parts = rest.splitn(2, '/');
    if let Some(name) = parts.next() {
        if !name.is_empty() {
            message
                .properties
                .insert("method-name".to_owned(), name.to_owned());
        }
    }
    if let Some(query) = parts.next() {
        if let Some(request_id) = query.strip_prefix("?$rid=") {
            message
                .properties
                .insert(METHOD_REQUEST_ID_PROPERTY.to_owned(), request_id.to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn channels() -> ChannelSet {
        ChannelSet::new("thermostat-01")
    }

    #[test]
    fn inbound_routing_by_topic_prefix() {
        let set = channels();
        assert_eq!(
            set.route_inbound(
                "devices/thermostat-01/messages/devicebound/alert",
                Bytes::from_static(b"{}"),
            )
            .map(|m| m.category),
            Some(MessageCategory::Telemetry)
        );
        assert_eq!(
            set.route_inbound("$iothub/twin/res/200/?$rid=7", Bytes::new())
                .map(|m| m.category),
            Some(MessageCategory::DeviceTwin)
        );
        assert_eq!(
            set.route_inbound("$iothub/methods/POST/reboot/?$rid=3", Bytes::new())
                .map(|m| m.category),
            Some(MessageCategory::DeviceMethods)
        );
        assert!(set.route_inbound("some/other/topic", Bytes::new()).is_none());
    }

    #[test]
    fn receive_prefers_methods_then_twin_then_messaging() {
        let set = channels();
        set.route_inbound(
            "devices/thermostat-01/messages/devicebound/alert",
            Bytes::from_static(b"c2d"),
        );
        set.route_inbound("$iothub/twin/res/200/?$rid=7", Bytes::from_static(b"twin"));
        set.route_inbound(
            "$iothub/methods/POST/reboot/?$rid=3",
            Bytes::from_static(b"method"),
        );

        let order: Vec<MessageCategory> = std::iter::from_fn(|| set.next_inbound())
            .map(|m| m.category)
            .collect();
        assert_eq!(
            order,
            vec![
                MessageCategory::DeviceMethods,
                MessageCategory::DeviceTwin,
                MessageCategory::Telemetry,
            ]
        );
    }

    #[test]
    fn method_calls_carry_name_and_request_id() {
        let set = channels();
        set.route_inbound("$iothub/methods/POST/reboot/?$rid=42", Bytes::new());
        let message = set.next_inbound().unwrap();
        assert_eq!(message.properties.get("method-name").unwrap(), "reboot");
        assert_eq!(message.properties.get(METHOD_REQUEST_ID_PROPERTY).unwrap(), "42");
    }

    #[test]
    fn telemetry_publish_topic_appends_property_bag() {
        let set = channels();
        let plain = TransportMessage::telemetry("21.5");
        assert_eq!(
            set.channel(MessageCategory::Telemetry).publish_topic(&plain),
            "devices/thermostat-01/messages/events/"
        );

        let tagged = TransportMessage::telemetry("21.5")
            .with_property("unit", "celsius")
            .with_property("room", "kitchen");
        assert_eq!(
            set.channel(MessageCategory::Telemetry).publish_topic(&tagged),
            "devices/thermostat-01/messages/events/room=kitchen&unit=celsius"
        );
    }

    proptest::proptest! {
        #[test]
        fn property_bag_is_sorted_and_complete(
            properties in proptest::collection::hash_map("[a-z]{1,8}", "[a-z0-9]{0,8}", 0..6)
        ) {
            let mut message = TransportMessage::telemetry("{}");
            for (key, value) in &properties {
                message = message.with_property(key, value);
            }

            let bag = property_bag(&message);
            let pairs: Vec<&str> = if bag.is_empty() {
                Vec::new()
            } else {
                bag.split('&').collect()
            };
            proptest::prop_assert_eq!(pairs.len(), properties.len());
            let mut sorted = pairs.clone();
            sorted.sort_unstable();
            proptest::prop_assert_eq!(&pairs, &sorted);
            for (key, value) in &properties {
                let pair = format!("{key}={value}");
                proptest::prop_assert!(pairs.contains(&pair.as_str()));
            }
        }
    }

    #[test]
    fn method_response_topic_carries_status_and_request_id() {
        let set = channels();
        let response = TransportMessage::new(MessageCategory::DeviceMethods, "done")
            .with_property(METHOD_STATUS_PROPERTY, "200")
            .with_property(METHOD_REQUEST_ID_PROPERTY, "42");
        assert_eq!(
            set.channel(MessageCategory::DeviceMethods).publish_topic(&response),
            "$iothub/methods/res/200/?$rid=42"
        );
    }
}
