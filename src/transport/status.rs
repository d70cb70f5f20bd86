//! Service status codes returned by the hub
//!
//! The hub reports operation outcomes with HTTP-like status codes, carried
//! in AMQP application properties or returned by the MQTT send path. Each
//! non-success code maps to a member of the service branch of the error
//! taxonomy.

use crate::transport::error::{ConnectionStatusError, ServiceError};

/// Hub operation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubStatusCode {
    Ok,
    OkEmpty,
    BadFormat,
    Unauthorized,
    PreconditionFailed,
    HubOrDeviceIdNotFound,
    RequestEntityTooLarge,
    Throttled,
    InternalServerError,
    ServerBusy,
    TooManyDevices,
    /// Anything the table does not recognize.
    Error,
}

impl HubStatusCode {
    /// Map a numeric status code from the wire to a [`HubStatusCode`].
    pub fn from_u32(code: u32) -> Self {
        match code {
            200 => HubStatusCode::Ok,
            204 => HubStatusCode::OkEmpty,
            400 => HubStatusCode::BadFormat,
            401 => HubStatusCode::Unauthorized,
            403 => HubStatusCode::PreconditionFailed,
            404 => HubStatusCode::HubOrDeviceIdNotFound,
            413 => HubStatusCode::RequestEntityTooLarge,
            429 => HubStatusCode::Throttled,
            500 => HubStatusCode::InternalServerError,
            503 => HubStatusCode::ServerBusy,
            509 => HubStatusCode::TooManyDevices,
            _ => HubStatusCode::Error,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, HubStatusCode::Ok | HubStatusCode::OkEmpty)
    }

    /// Derive the taxonomy error for a non-success status, with the
    /// service-provided description as the message when present.
    ///
    /// Returns `None` for success codes.
    pub fn to_status_error(self, description: &str) -> Option<ConnectionStatusError> {
        let kind = match self {
            HubStatusCode::Ok | HubStatusCode::OkEmpty => return None,
            HubStatusCode::BadFormat => ServiceError::BadFormat,
            HubStatusCode::Unauthorized => ServiceError::Unauthorized,
            HubStatusCode::PreconditionFailed => ServiceError::PreconditionFailed,
            HubStatusCode::HubOrDeviceIdNotFound => ServiceError::HubOrDeviceIdNotFound,
            HubStatusCode::RequestEntityTooLarge => ServiceError::RequestEntityTooLarge,
            HubStatusCode::Throttled => ServiceError::Throttled,
            HubStatusCode::InternalServerError => ServiceError::InternalServerError,
            HubStatusCode::ServerBusy => ServiceError::ServerBusy,
            HubStatusCode::TooManyDevices => ServiceError::TooManyDevices,
            HubStatusCode::Error => ServiceError::Unknown,
        };

        let error = ConnectionStatusError::service(kind);
        if description.is_empty() {
            Some(error)
        } else {
            Some(error.with_message(description))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::error::ErrorCategory;

    #[test]
    fn test_numeric_mapping() {
        assert_eq!(HubStatusCode::from_u32(200), HubStatusCode::Ok);
        assert_eq!(HubStatusCode::from_u32(204), HubStatusCode::OkEmpty);
        assert_eq!(HubStatusCode::from_u32(400), HubStatusCode::BadFormat);
        assert_eq!(HubStatusCode::from_u32(429), HubStatusCode::Throttled);
        assert_eq!(HubStatusCode::from_u32(503), HubStatusCode::ServerBusy);
        assert_eq!(HubStatusCode::from_u32(509), HubStatusCode::TooManyDevices);
        assert_eq!(HubStatusCode::from_u32(418), HubStatusCode::Error);
    }

    #[test]
    fn test_success_codes_produce_no_error() {
        assert!(HubStatusCode::Ok.to_status_error("").is_none());
        assert!(HubStatusCode::OkEmpty.to_status_error("ignored").is_none());
    }

    #[test]
    fn test_retryable_statuses() {
        let throttled = HubStatusCode::Throttled.to_status_error("").unwrap();
        assert!(throttled.is_retryable());
        let busy = HubStatusCode::ServerBusy.to_status_error("").unwrap();
        assert!(busy.is_retryable());
        let unauthorized = HubStatusCode::Unauthorized.to_status_error("").unwrap();
        assert!(!unauthorized.is_retryable());
    }

    #[test]
    fn test_description_becomes_message() {
        let err = HubStatusCode::BadFormat
            .to_status_error("missing content type")
            .unwrap();
        assert_eq!(err.message(), "missing content type");
        assert_eq!(
            err.category(),
            ErrorCategory::Service(crate::transport::error::ServiceError::BadFormat)
        );

        let err = HubStatusCode::Error.to_status_error("").unwrap();
        assert_eq!(
            err.category(),
            ErrorCategory::Service(crate::transport::error::ServiceError::Unknown)
        );
    }
}
