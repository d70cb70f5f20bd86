//! Classification tables for wire-level failures
//!
//! Exercises the full mapping from AMQP error conditions and MQTT client
//! faults onto the taxonomy, including the retryability defaults callers
//! base their retry decisions on.

use hublink::transport::error::{
    amqp_condition, from_amqp_condition, from_mqtt_client_fault, mqtt_reason_code,
    ClientFaultCause, ErrorCategory, MqttClientFault, ProtocolError,
};

#[test]
fn amqp_condition_table_maps_every_condition() {
    // (condition, expected kind, retryable by default)
    let table: &[(&str, ProtocolError, bool)] = &[
        (amqp_condition::CONNECTION_FORCED, ProtocolError::ConnectionForced, true),
        (amqp_condition::CONNECTION_REDIRECT, ProtocolError::ConnectionRedirect, false),
        (amqp_condition::DECODE_ERROR, ProtocolError::DecodeError, false),
        (amqp_condition::DETACH_FORCED, ProtocolError::DetachForced, false),
        (amqp_condition::ERRANT_LINK, ProtocolError::ErrantLink, false),
        (amqp_condition::FRAME_SIZE_TOO_SMALL, ProtocolError::FrameSizeTooSmall, false),
        (amqp_condition::FRAMING_ERROR, ProtocolError::FramingError, false),
        (amqp_condition::HANDLE_IN_USE, ProtocolError::HandleInUse, true),
        (amqp_condition::ILLEGAL_STATE, ProtocolError::IllegalState, false),
        (amqp_condition::INTERNAL_ERROR, ProtocolError::InternalError, true),
        (amqp_condition::INVALID_FIELD, ProtocolError::InvalidField, false),
        (amqp_condition::LINK_REDIRECT, ProtocolError::LinkRedirect, true),
        (amqp_condition::LINK_STOLEN, ProtocolError::LinkStolen, true),
        (amqp_condition::MESSAGE_SIZE_EXCEEDED, ProtocolError::MessageSizeExceeded, true),
        (amqp_condition::NOT_ALLOWED, ProtocolError::NotAllowed, false),
        (amqp_condition::NOT_FOUND, ProtocolError::NotFound, false),
        (amqp_condition::NOT_IMPLEMENTED, ProtocolError::NotImplemented, false),
        (amqp_condition::PRECONDITION_FAILED, ProtocolError::PreconditionFailed, false),
        (amqp_condition::RESOURCE_DELETED, ProtocolError::ResourceDeleted, false),
        (amqp_condition::RESOURCE_LIMIT_EXCEEDED, ProtocolError::ResourceLimitExceeded, false),
        (amqp_condition::RESOURCE_LOCKED, ProtocolError::ResourceLocked, true),
        (amqp_condition::TRANSFER_LIMIT_EXCEEDED, ProtocolError::TransferLimitExceeded, true),
        (amqp_condition::UNATTACHED_HANDLE, ProtocolError::UnattachedHandle, true),
        (amqp_condition::UNAUTHORIZED_ACCESS, ProtocolError::UnauthorizedAccess, false),
        (amqp_condition::WINDOW_VIOLATION, ProtocolError::WindowViolation, true),
    ];

    for (condition, kind, retryable) in table {
        let error = from_amqp_condition(condition);
        assert_eq!(
            error.category(),
            ErrorCategory::Protocol(*kind),
            "wrong kind for {condition}"
        );
        assert_eq!(
            error.is_retryable(),
            *retryable,
            "wrong retryability for {condition}"
        );
    }
}

#[test]
fn unknown_amqp_condition_falls_back_to_generic() {
    let error = from_amqp_condition("amqp:completely-made-up");
    assert_eq!(error.category(), ErrorCategory::Protocol(ProtocolError::Generic));
    assert!(!error.is_retryable());
}

#[test]
fn mqtt_reason_code_table() {
    let table: &[(u32, ProtocolError, bool)] = &[
        (mqtt_reason_code::INVALID_PROTOCOL_VERSION, ProtocolError::RejectedProtocolVersion, false),
        (mqtt_reason_code::INVALID_CLIENT_ID, ProtocolError::IdentifierRejected, false),
        (mqtt_reason_code::BROKER_UNAVAILABLE, ProtocolError::ServerUnavailable, true),
        (mqtt_reason_code::FAILED_AUTHENTICATION, ProtocolError::BadUsernameOrPassword, false),
        (mqtt_reason_code::NOT_AUTHORIZED, ProtocolError::NotAuthorized, false),
    ];
    for (code, kind, retryable) in table {
        let error = from_mqtt_client_fault(&MqttClientFault::new(*code));
        assert_eq!(error.category(), ErrorCategory::Protocol(*kind), "code {code}");
        assert_eq!(error.is_retryable(), *retryable, "code {code}");
    }
}

#[test]
fn transient_mqtt_client_codes_are_retryable() {
    for code in [
        mqtt_reason_code::CLIENT_TIMEOUT,
        mqtt_reason_code::WRITE_TIMEOUT,
        mqtt_reason_code::SERVER_CONNECT_ERROR,
        mqtt_reason_code::CLIENT_NOT_CONNECTED,
        mqtt_reason_code::CONNECTION_LOST,
        mqtt_reason_code::TOKEN_IN_USE,
        mqtt_reason_code::MAX_INFLIGHT,
    ] {
        let error = from_mqtt_client_fault(&MqttClientFault::new(code));
        assert!(error.is_retryable(), "code {code} should be retryable");
    }
}

#[test]
fn client_exception_retryability_depends_on_cause() {
    let plain = from_mqtt_client_fault(&MqttClientFault::new(mqtt_reason_code::CLIENT_EXCEPTION));
    assert!(!plain.is_retryable());

    let unknown_host = from_mqtt_client_fault(&MqttClientFault::with_cause(
        mqtt_reason_code::CLIENT_EXCEPTION,
        ClientFaultCause::UnknownHost("no such host".to_string()),
    ));
    assert!(unknown_host.is_retryable());

    let interrupted = from_mqtt_client_fault(&MqttClientFault::with_cause(
        mqtt_reason_code::CLIENT_EXCEPTION,
        ClientFaultCause::Interrupted,
    ));
    assert!(interrupted.is_retryable());

    let other = from_mqtt_client_fault(&MqttClientFault::with_cause(
        mqtt_reason_code::CLIENT_EXCEPTION,
        ClientFaultCause::Other("broken pipe".to_string()),
    ));
    assert!(!other.is_retryable());
}

#[test]
fn reserved_reason_code_range_is_unexpected() {
    for code in [6, 100, 255] {
        let error = from_mqtt_client_fault(&MqttClientFault::new(code));
        assert_eq!(
            error.category(),
            ErrorCategory::Protocol(ProtocolError::UnexpectedError),
            "code {code}"
        );
        assert!(!error.is_retryable());
    }
    // 128 sits inside the reserved range but has its own meaning
    let subscribe_failed =
        from_mqtt_client_fault(&MqttClientFault::new(mqtt_reason_code::SUBSCRIBE_FAILED));
    assert_ne!(
        subscribe_failed.category(),
        ErrorCategory::Protocol(ProtocolError::UnexpectedError)
    );
}
