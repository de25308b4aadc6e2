use serde_json::Value;
use thiserror::Error;

use crate::messaging::address::Address;

/// Failure conditions of an [crate::messaging::endpoint::Endpoint].
///
/// Public functions return `anyhow::Result` - callers that need to distinguish cases
///  `downcast_ref::<EndpointError>()` the error.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("endpoint address was not assigned")]
    AddressNotSet,
    #[error("endpoint address is already assigned as {0}")]
    AddressAlreadySet(Address),
    #[error("invalid message name {0:?}: must be non-empty and uppercase")]
    InvalidMessageName(String),
    #[error("unknown address {0}")]
    UnknownAddress(Address),
    #[error("connection {0} is already registered")]
    DuplicateConnection(Address),
    #[error("message {0} has no registered handlers")]
    UnknownMessage(String),
    #[error("message {0} is local-only and can not be sent over the network")]
    LocalOnlyMessage(String),
    #[error("packet {0} is already a response")]
    AlreadyResponse(String),
    #[error("duplicate transaction {0}")]
    DuplicateTransaction(String),
    #[error("connection {0} is not authorized")]
    NotAuthorized(Address),

    #[error("no handler for message {0}")]
    NoHandler(String),
    #[error("handler failed: {0}")]
    HandlerFailed(String),
    #[error("remote error: {0}")]
    Remote(Value),
    #[error("transaction {0} timed out")]
    Timeout(String),
    #[error("transaction {0} was dropped without a response")]
    Disconnected(String),
    #[error("request {0} already passed through this endpoint")]
    RoutingLoop(String),
}

impl EndpointError {
    /// The value sent back in the `error` field of a response payload when handling a
    ///  request failed on this endpoint.
    pub fn to_error_value(&self) -> Value {
        match self {
            EndpointError::Remote(v) => v.clone(),
            other => Value::String(other.to_string()),
        }
    }
}

/// Converts an arbitrary failure into the value carried in a response's `error` field,
///  preserving remote error values unchanged as they travel back along the path.
pub fn error_value(e: &anyhow::Error) -> Value {
    match e.downcast_ref::<EndpointError>() {
        Some(e) => e.to_error_value(),
        None => Value::String(format!("{:#}", e)),
    }
}
