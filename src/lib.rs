//! hublink - device-side transport layer for an IoT hub
//!
//! # Overview
//!
//! This crate implements the connection layer a device client builds on when
//! talking to a cloud hub:
//! - An AMQP connection with claims-based-security authentication, a
//!   session/link multiplexer, flow-control-aware sends, and automatic
//!   reconnection with exponential backoff
//! - A simpler MQTT connection with per-category channels for messaging,
//!   twin, and direct method traffic
//! - An error taxonomy that classifies every wire-level failure and
//!   annotates it with whether retrying can help
//! - A listener contract reporting connection and message lifecycle events
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use hublink::config::{AuthConfig, DeviceConfig};
//! use hublink::transport::mqtt::MqttConnection;
//! use hublink::transport::TransportMessage;
//!
//! # tokio_test::block_on(async {
//! let config = DeviceConfig::new(
//!     "contoso.azure-devices.net",
//!     "thermostat-01",
//!     "contoso",
//!     AuthConfig::SasToken {
//!         shared_access_key: String::new(),
//!         current_token: "SharedAccessSignature sr=contoso".to_string(),
//!         token_expiry: None,
//!     },
//! )?;
//!
//! let connection = MqttConnection::new(config);
//! connection.open().await?;
//! let status = connection
//!     .send_event(&TransportMessage::telemetry(r#"{"temperature": 21.5}"#))
//!     .await?;
//! println!("hub answered {status:?}");
//! connection.close().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod testing;
pub mod transport;

pub use config::{AuthConfig, DeviceConfig};
pub use error::{TransportError, TransportResult};
pub use transport::amqp::AmqpConnection;
pub use transport::mqtt::MqttConnection;
pub use transport::{
    AckOutcome, ConnectionStatusError, HubStatusCode, MessageCategory, State, TransportListener,
    TransportMessage,
};
