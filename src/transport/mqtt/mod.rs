//! MQTT transport: a closed/open connection over the hub's broker with
//! per-category channels for messaging, twin, and direct method traffic.
//!
//! # Usage
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
//! let status = connection.send_event(&TransportMessage::telemetry("21.5")).await?;
//! println!("hub answered {status:?}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod channels;
pub mod connection;

pub use channels::ChannelSet;
pub use connection::MqttConnection;
