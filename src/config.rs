//! Device configuration for the transport layer
//!
//! Collaborator-supplied settings: hub endpoint, device identity,
//! authentication material, and the websocket toggle. All validation is
//! fatal at construction time; a config that loads is a config the
//! transports can use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors, always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Authentication mode for the device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthConfig {
    /// Shared-access-signature tokens, either derived from a device key or
    /// supplied directly by the owner.
    SasToken {
        #[serde(default)]
        shared_access_key: String,
        #[serde(default)]
        current_token: String,
        /// When the supplied token stops being valid. Renewal itself is the
        /// owner's responsibility.
        token_expiry: Option<DateTime<Utc>>,
    },
    /// Client certificate authentication.
    X509,
}

/// Connection settings for one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Fully qualified hub hostname, e.g. `myhub.example.net`.
    pub hostname: String,
    /// Device identifier registered with the hub.
    pub device_id: String,
    /// Hub name (the hostname's first label).
    pub hub_name: String,
    pub auth: AuthConfig,
    /// Tunnel the protocol over websockets instead of a raw TLS socket.
    #[serde(default)]
    pub use_websocket: bool,
}

impl DeviceConfig {
    /// Build a validated configuration. Any missing required field is an
    /// immediate error, never a deferred runtime failure.
    pub fn new(
        hostname: impl Into<String>,
        device_id: impl Into<String>,
        hub_name: impl Into<String>,
        auth: AuthConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            hostname: hostname.into(),
            device_id: device_id.into(),
            hub_name: hub_name.into(),
            auth,
            use_websocket: false,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: DeviceConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_websocket(mut self, use_websocket: bool) -> Self {
        self.use_websocket = use_websocket;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.is_empty() {
            return Err(ConfigError::Invalid("hostname cannot be empty".to_string()));
        }
        if self.device_id.is_empty() {
            return Err(ConfigError::Invalid(
                "device id cannot be empty".to_string(),
            ));
        }
        if self.hub_name.is_empty() {
            return Err(ConfigError::Invalid("hub name cannot be empty".to_string()));
        }
        if let AuthConfig::SasToken {
            shared_access_key,
            current_token,
            ..
        } = &self.auth
        {
            if shared_access_key.is_empty() && current_token.is_empty() {
                return Err(ConfigError::Invalid(
                    "SAS authentication needs a shared access key or a current token".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn is_sas_auth(&self) -> bool {
        matches!(self.auth, AuthConfig::SasToken { .. })
    }

    pub fn is_x509_auth(&self) -> bool {
        matches!(self.auth, AuthConfig::X509)
    }

    /// The current SAS token, if token auth is configured and a token was
    /// supplied.
    pub fn sas_token(&self) -> Option<&str> {
        match &self.auth {
            AuthConfig::SasToken { current_token, .. } if !current_token.is_empty() => {
                Some(current_token)
            }
            _ => None,
        }
    }

    /// Whether the supplied SAS token has expired and needs renewal before
    /// the transport may send. Always false for certificate auth or when no
    /// expiry was supplied.
    pub fn token_renewal_due(&self) -> bool {
        match &self.auth {
            AuthConfig::SasToken {
                token_expiry: Some(expiry),
                ..
            } => *expiry <= Utc::now(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::io::Write;

    fn sas_auth() -> AuthConfig {
        AuthConfig::SasToken {
            shared_access_key: "device-key".to_string(),
            current_token: String::new(),
            token_expiry: None,
        }
    }

    #[test]
    fn test_valid_config() {
        let config =
            DeviceConfig::new("myhub.example.net", "device-1", "myhub", sas_auth()).unwrap();
        assert!(!config.use_websocket);
        assert!(config.is_sas_auth());
    }

    #[test]
    fn test_empty_fields_are_fatal() {
        assert!(DeviceConfig::new("", "device-1", "myhub", sas_auth()).is_err());
        assert!(DeviceConfig::new("h.example.net", "", "myhub", sas_auth()).is_err());
        assert!(DeviceConfig::new("h.example.net", "device-1", "", sas_auth()).is_err());
    }

    #[test]
    fn test_sas_auth_requires_key_or_token() {
        let auth = AuthConfig::SasToken {
            shared_access_key: String::new(),
            current_token: String::new(),
            token_expiry: None,
        };
        let result = DeviceConfig::new("h.example.net", "device-1", "myhub", auth);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let auth = AuthConfig::SasToken {
            shared_access_key: String::new(),
            current_token: "SharedAccessSignature sr=...".to_string(),
            token_expiry: None,
        };
        assert!(DeviceConfig::new("h.example.net", "device-1", "myhub", auth).is_ok());
    }

    #[test]
    fn test_x509_needs_no_token_material() {
        let config =
            DeviceConfig::new("h.example.net", "device-1", "myhub", AuthConfig::X509).unwrap();
        assert!(config.is_x509_auth());
        assert!(config.sas_token().is_none());
        assert!(!config.token_renewal_due());
    }

    #[test]
    fn test_token_renewal_due() {
        let expired = AuthConfig::SasToken {
            shared_access_key: String::new(),
            current_token: "token".to_string(),
            token_expiry: Some(Utc::now() - Duration::minutes(5)),
        };
        let config = DeviceConfig::new("h.example.net", "device-1", "myhub", expired).unwrap();
        assert!(config.token_renewal_due());

        let fresh = AuthConfig::SasToken {
            shared_access_key: String::new(),
            current_token: "token".to_string(),
            token_expiry: Some(Utc::now() + Duration::hours(1)),
        };
        let config = DeviceConfig::new("h.example.net", "device-1", "myhub", fresh).unwrap();
        assert!(!config.token_renewal_due());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
hostname = "myhub.example.net"
device_id = "device-1"
hub_name = "myhub"
use_websocket = true

[auth]
mode = "sas_token"
shared_access_key = "device-key"
"#
        )
        .unwrap();

        let config = DeviceConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.device_id, "device-1");
        assert!(config.use_websocket);
        assert!(config.is_sas_auth());
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
hostname = ""
device_id = "device-1"
hub_name = "myhub"

[auth]
mode = "x509"
"#
        )
        .unwrap();

        assert!(matches!(
            DeviceConfig::load_from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
