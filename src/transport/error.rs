//! Typed connection error taxonomy shared by both transports
//!
//! Every failure surfaced to listeners is a [`ConnectionStatusError`]: a
//! category drawn from a closed two-branch hierarchy (protocol-layer faults
//! vs. service status faults), a human message, an optional lower-level
//! cause, and a retryable flag. The two classification functions in this
//! module are the single source of truth for mapping wire-level error codes
//! into that taxonomy.

use std::fmt;
use thiserror::Error;

/// Protocol-layer faults: wire, framing, link and session level errors.
///
/// The AMQP variants correspond one-to-one to AMQP error-condition
/// identifiers; the MQTT variants correspond to broker connect-return codes.
/// `Generic` is the fallback for anything the tables do not recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("peer forcibly closed the connection")]
    ConnectionForced,
    #[error("connection redirected by the peer")]
    ConnectionRedirect,
    #[error("received malformed or corrupt data")]
    DecodeError,
    #[error("link detached by the peer")]
    DetachForced,
    #[error("link attached to a session the peer does not own")]
    ErrantLink,
    #[error("negotiated frame size is too small")]
    FrameSizeTooSmall,
    #[error("framing error on the connection")]
    FramingError,
    #[error("link handle is already in use")]
    HandleInUse,
    #[error("peer performed an illegal protocol state transition")]
    IllegalState,
    #[error("peer suffered an internal error")]
    InternalError,
    #[error("invalid field in a protocol frame")]
    InvalidField,
    #[error("link redirected by the peer")]
    LinkRedirect,
    #[error("link stolen by a newer attachment")]
    LinkStolen,
    #[error("message exceeds the maximum link message size")]
    MessageSizeExceeded,
    #[error("operation not allowed by the peer")]
    NotAllowed,
    #[error("addressed node does not exist")]
    NotFound,
    #[error("peer does not implement the requested feature")]
    NotImplemented,
    #[error("protocol precondition failed")]
    PreconditionFailed,
    #[error("addressed resource was deleted")]
    ResourceDeleted,
    #[error("peer resource limit exceeded")]
    ResourceLimitExceeded,
    #[error("addressed resource is locked")]
    ResourceLocked,
    #[error("link transfer limit exceeded")]
    TransferLimitExceeded,
    #[error("frame referenced an unattached link handle")]
    UnattachedHandle,
    #[error("access to the addressed node was denied")]
    UnauthorizedAccess,
    #[error("session window violation")]
    WindowViolation,
    #[error("broker rejected the protocol version")]
    RejectedProtocolVersion,
    #[error("broker rejected the client identifier")]
    IdentifierRejected,
    #[error("broker unavailable")]
    ServerUnavailable,
    #[error("broker rejected the username or password")]
    BadUsernameOrPassword,
    #[error("client is not authorized to connect")]
    NotAuthorized,
    #[error("broker returned a reserved connect return code")]
    UnexpectedError,
    #[error("protocol-level connection error")]
    Generic,
}

impl ProtocolError {
    /// Default retryable flag for this fault, applied at construction.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectionForced
                | ProtocolError::HandleInUse
                | ProtocolError::InternalError
                | ProtocolError::LinkRedirect
                | ProtocolError::LinkStolen
                | ProtocolError::MessageSizeExceeded
                | ProtocolError::ResourceLocked
                | ProtocolError::TransferLimitExceeded
                | ProtocolError::UnattachedHandle
                | ProtocolError::WindowViolation
                | ProtocolError::ServerUnavailable
        )
    }
}

/// Service-status faults: HTTP-like status codes reported by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("request was badly formatted")]
    BadFormat,
    #[error("request was not authorized")]
    Unauthorized,
    #[error("service precondition failed")]
    PreconditionFailed,
    #[error("hub or device id not found")]
    HubOrDeviceIdNotFound,
    #[error("request entity too large")]
    RequestEntityTooLarge,
    #[error("request was throttled by the service")]
    Throttled,
    #[error("service suffered an internal error")]
    InternalServerError,
    #[error("service is busy")]
    ServerBusy,
    #[error("too many devices on this hub")]
    TooManyDevices,
    #[error("service returned an unknown status")]
    Unknown,
}

impl ServiceError {
    /// Default retryable flag for this fault, applied at construction.
    pub fn default_retryable(self) -> bool {
        matches!(self, ServiceError::Throttled | ServiceError::ServerBusy)
    }
}

/// The two branches of the taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Protocol(ProtocolError),
    Service(ServiceError),
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Protocol(e) => write!(f, "{e}"),
            ErrorCategory::Service(e) => write!(f, "{e}"),
        }
    }
}

/// A classified connection failure, immutable once constructed.
#[derive(Debug, Error)]
#[error("{category}: {message}")]
pub struct ConnectionStatusError {
    category: ErrorCategory,
    message: String,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    retryable: bool,
}

impl ConnectionStatusError {
    /// Build a protocol-layer error with its default retryable flag.
    pub fn protocol(kind: ProtocolError) -> Self {
        Self {
            category: ErrorCategory::Protocol(kind),
            message: kind.to_string(),
            cause: None,
            retryable: kind.default_retryable(),
        }
    }

    /// Build a service-status error with its default retryable flag.
    pub fn service(kind: ServiceError) -> Self {
        Self {
            category: ErrorCategory::Service(kind),
            message: kind.to_string(),
            cause: None,
            retryable: kind.default_retryable(),
        }
    }

    /// Replace the default human message (e.g. with a service-provided
    /// status description).
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach the lower-level cause this error was derived from.
    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Override the leaf's default retryable flag.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the failure is transient and the operation may reasonably be
    /// attempted again.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// AMQP error-condition identifiers recognized by the classification table.
pub mod amqp_condition {
    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
    pub const CONNECTION_REDIRECT: &str = "amqp:connection:redirect";
    pub const DECODE_ERROR: &str = "amqp:decode-error";
    pub const DETACH_FORCED: &str = "amqp:link:detach-forced";
    pub const ERRANT_LINK: &str = "amqp:session:errant-link";
    pub const FRAME_SIZE_TOO_SMALL: &str = "amqp:frame-size-too-small";
    pub const FRAMING_ERROR: &str = "amqp:connection:framing-error";
    pub const HANDLE_IN_USE: &str = "amqp:session:handle-in-use";
    pub const ILLEGAL_STATE: &str = "amqp:illegal-state";
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    pub const INVALID_FIELD: &str = "amqp:invalid-field";
    pub const LINK_REDIRECT: &str = "amqp:link:redirect";
    pub const LINK_STOLEN: &str = "amqp:link:stolen";
    pub const MESSAGE_SIZE_EXCEEDED: &str = "amqp:link:message-size-exceeded";
    pub const NOT_ALLOWED: &str = "amqp:not-allowed";
    pub const NOT_FOUND: &str = "amqp:not-found";
    pub const NOT_IMPLEMENTED: &str = "amqp:not-implemented";
    pub const PRECONDITION_FAILED: &str = "amqp:precondition-failed";
    pub const RESOURCE_DELETED: &str = "amqp:resource-deleted";
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    pub const RESOURCE_LOCKED: &str = "amqp:resource-locked";
    pub const TRANSFER_LIMIT_EXCEEDED: &str = "amqp:link:transfer-limit-exceeded";
    pub const UNATTACHED_HANDLE: &str = "amqp:session:unattached-handle";
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
    pub const WINDOW_VIOLATION: &str = "amqp:session:window-violation";
}

/// Map an AMQP error-condition identifier to its taxonomy member.
///
/// Exact string match; any unrecognized condition falls back to the generic
/// protocol error, which is non-retryable by default.
pub fn from_amqp_condition(condition: &str) -> ConnectionStatusError {
    use amqp_condition::*;

    let kind = match condition {
        CONNECTION_FORCED => ProtocolError::ConnectionForced,
        CONNECTION_REDIRECT => ProtocolError::ConnectionRedirect,
        DECODE_ERROR => ProtocolError::DecodeError,
        DETACH_FORCED => ProtocolError::DetachForced,
        ERRANT_LINK => ProtocolError::ErrantLink,
        FRAME_SIZE_TOO_SMALL => ProtocolError::FrameSizeTooSmall,
        FRAMING_ERROR => ProtocolError::FramingError,
        HANDLE_IN_USE => ProtocolError::HandleInUse,
        ILLEGAL_STATE => ProtocolError::IllegalState,
        INTERNAL_ERROR => ProtocolError::InternalError,
        INVALID_FIELD => ProtocolError::InvalidField,
        LINK_REDIRECT => ProtocolError::LinkRedirect,
        LINK_STOLEN => ProtocolError::LinkStolen,
        MESSAGE_SIZE_EXCEEDED => ProtocolError::MessageSizeExceeded,
        NOT_ALLOWED => ProtocolError::NotAllowed,
        NOT_FOUND => ProtocolError::NotFound,
        NOT_IMPLEMENTED => ProtocolError::NotImplemented,
        PRECONDITION_FAILED => ProtocolError::PreconditionFailed,
        RESOURCE_DELETED => ProtocolError::ResourceDeleted,
        RESOURCE_LIMIT_EXCEEDED => ProtocolError::ResourceLimitExceeded,
        RESOURCE_LOCKED => ProtocolError::ResourceLocked,
        TRANSFER_LIMIT_EXCEEDED => ProtocolError::TransferLimitExceeded,
        UNATTACHED_HANDLE => ProtocolError::UnattachedHandle,
        UNAUTHORIZED_ACCESS => ProtocolError::UnauthorizedAccess,
        WINDOW_VIOLATION => ProtocolError::WindowViolation,
        _ => ProtocolError::Generic,
    };

    ConnectionStatusError::protocol(kind)
}

/// Why a client-side MQTT fault occurred, when the library reports the
/// generic client-exception reason code and the real reason is in the cause.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientFaultCause {
    #[error("host could not be resolved: {0}")]
    UnknownHost(String),
    #[error("operation was interrupted")]
    Interrupted,
    #[error("{0}")]
    Other(String),
}

/// Connect/client reason codes reported by the MQTT client library.
pub mod mqtt_reason_code {
    /// Client-side fault with no connect code from the broker; the real
    /// reason is in the wrapped cause.
    pub const CLIENT_EXCEPTION: u32 = 0;
    pub const INVALID_PROTOCOL_VERSION: u32 = 1;
    pub const INVALID_CLIENT_ID: u32 = 2;
    pub const BROKER_UNAVAILABLE: u32 = 3;
    pub const FAILED_AUTHENTICATION: u32 = 4;
    pub const NOT_AUTHORIZED: u32 = 5;
    pub const SUBSCRIBE_FAILED: u32 = 128;
    pub const CLIENT_TIMEOUT: u32 = 32000;
    pub const WRITE_TIMEOUT: u32 = 32002;
    pub const SERVER_CONNECT_ERROR: u32 = 32103;
    pub const CLIENT_NOT_CONNECTED: u32 = 32104;
    pub const CONNECTION_LOST: u32 = 32109;
    pub const TOKEN_IN_USE: u32 = 32201;
    pub const MAX_INFLIGHT: u32 = 32202;

    /// Connect codes 6 through 255 are reserved for future standard codes.
    pub const UNDEFINED_LOWER_BOUND: u32 = 6;
    pub const UNDEFINED_UPPER_BOUND: u32 = 255;
}

/// Fault reported by the MQTT client library.
#[derive(Debug, Error)]
#[error("mqtt client fault (reason code {reason_code})")]
pub struct MqttClientFault {
    pub reason_code: u32,
    pub cause: Option<ClientFaultCause>,
}

impl MqttClientFault {
    pub fn new(reason_code: u32) -> Self {
        Self {
            reason_code,
            cause: None,
        }
    }

    pub fn with_cause(reason_code: u32, cause: ClientFaultCause) -> Self {
        Self {
            reason_code,
            cause: Some(cause),
        }
    }
}

/// Map an MQTT client fault to its taxonomy member.
///
/// The generic client-exception code is disambiguated by its wrapped cause:
/// an unresolved host or an interruption means the network hiccuped and is
/// worth retrying, anything else is not. A closed set of client codes that
/// signal transient connectivity loss always classifies as retryable.
pub fn from_mqtt_client_fault(fault: &MqttClientFault) -> ConnectionStatusError {
    use mqtt_reason_code::*;

    match fault.reason_code {
        CLIENT_EXCEPTION => {
            let retryable = matches!(
                fault.cause,
                Some(ClientFaultCause::UnknownHost(_)) | Some(ClientFaultCause::Interrupted)
            );
            ConnectionStatusError::protocol(ProtocolError::Generic).with_retryable(retryable)
        }
        INVALID_PROTOCOL_VERSION => {
            ConnectionStatusError::protocol(ProtocolError::RejectedProtocolVersion)
        }
        INVALID_CLIENT_ID => ConnectionStatusError::protocol(ProtocolError::IdentifierRejected),
        BROKER_UNAVAILABLE => ConnectionStatusError::protocol(ProtocolError::ServerUnavailable),
        FAILED_AUTHENTICATION => {
            ConnectionStatusError::protocol(ProtocolError::BadUsernameOrPassword)
        }
        NOT_AUTHORIZED => ConnectionStatusError::protocol(ProtocolError::NotAuthorized),
        SUBSCRIBE_FAILED | CLIENT_NOT_CONNECTED | TOKEN_IN_USE | CONNECTION_LOST
        | SERVER_CONNECT_ERROR | CLIENT_TIMEOUT | WRITE_TIMEOUT | MAX_INFLIGHT => {
            ConnectionStatusError::protocol(ProtocolError::Generic).with_retryable(true)
        }
        code if (UNDEFINED_LOWER_BOUND..=UNDEFINED_UPPER_BOUND).contains(&code) => {
            ConnectionStatusError::protocol(ProtocolError::UnexpectedError)
        }
        _ => ConnectionStatusError::protocol(ProtocolError::Generic),
    }
}
