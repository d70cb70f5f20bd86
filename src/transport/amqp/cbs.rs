//! Claims-based-security token exchange.
//!
//! Authentication runs over a dedicated link pair targeting the `$cbs`
//! node: the device sends a `put-token` request carrying its shared access
//! signature and the service replies on the `cbs` reply node with a status
//! code. Status 200 means the connection is authenticated.

use uuid::Uuid;

use crate::config::DeviceConfig;
use crate::transport::amqp::engine::EngineMessage;
use crate::transport::error::ConnectionStatusError;
use crate::transport::status::HubStatusCode;

pub const CBS_TARGET: &str = "$cbs";
pub const CBS_REPLY_ADDRESS: &str = "cbs";

const OPERATION_KEY: &str = "operation";
const OPERATION_PUT_TOKEN: &str = "put-token";
const TOKEN_TYPE_KEY: &str = "type";
const TOKEN_TYPE_SAS: &str = "servicebus.windows.net:sastoken";
const AUDIENCE_KEY: &str = "name";

const STATUS_CODE_KEY: &str = "status-code";
const STATUS_DESCRIPTION_KEY: &str = "status-description";

/// Build the `put-token` request for the device's current token.
///
/// The returned message id is the correlation handle: the service echoes it
/// in the reply's correlation id.
pub fn build_put_token_request(config: &DeviceConfig) -> (EngineMessage, String) {
    let request_id = Uuid::new_v4().to_string();
    let audience = format!("{}/devices/{}", config.hostname, config.device_id);
    let token = config.sas_token().unwrap_or_default().to_owned();

    let mut message = EngineMessage {
        body: token.into_bytes().into(),
        message_id: Some(request_id.clone()),
        reply_to: Some(CBS_REPLY_ADDRESS.to_owned()),
        to: Some(CBS_TARGET.to_owned()),
        ..Default::default()
    };
    message
        .application_properties
        .insert(OPERATION_KEY.to_owned(), OPERATION_PUT_TOKEN.to_owned());
    message
        .application_properties
        .insert(TOKEN_TYPE_KEY.to_owned(), TOKEN_TYPE_SAS.to_owned());
    message
        .application_properties
        .insert(AUDIENCE_KEY.to_owned(), audience);

    (message, request_id)
}

/// Outcome of a `put-token` reply.
#[derive(Debug)]
pub enum PutTokenOutcome {
    /// Status 200: the connection is authenticated.
    Authenticated,
    /// The service rejected the token.
    Rejected(ConnectionStatusError),
    /// The reply correlates to a different request, or carries no status.
    Unrecognized,
}

/// Interpret a message received on the reply link against an in-flight
/// request id.
pub fn evaluate_put_token_reply(reply: &EngineMessage, request_id: &str) -> PutTokenOutcome {
    let correlated = reply
        .correlation_id
        .as_deref()
        .map(|id| id == request_id)
        .unwrap_or(false);
    if !correlated {
        return PutTokenOutcome::Unrecognized;
    }

    let status = reply
        .application_properties
        .get(STATUS_CODE_KEY)
        .and_then(|raw| raw.parse::<u32>().ok());
    let Some(status) = status else {
        return PutTokenOutcome::Unrecognized;
    };

    let code = HubStatusCode::from_u32(status);
    let description = reply
        .application_properties
        .get(STATUS_DESCRIPTION_KEY)
        .map(String::as_str)
        .unwrap_or("");
    match code.to_status_error(description) {
        None => PutTokenOutcome::Authenticated,
        Some(error) => PutTokenOutcome::Rejected(error),
    }
}
