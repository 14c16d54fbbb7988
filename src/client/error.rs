//! Client error types.

use crate::command::CommandError;
use crate::packet::{ConnectReturnCode, MqttError};
use thiserror::Error;

/// Errors surfaced by [`MqttClient`](super::MqttClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The engine operation did not succeed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Invalid packet or address.
    #[error(transparent)]
    Mqtt(#[from] MqttError),

    /// The broker answered CONNECT with a non-zero return code.
    #[error("connection refused: {0}")]
    ConnectionRefused(ConnectReturnCode),

    /// No answer within the blocking timeout.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The connection closed.
    #[error("connection closed: {0}")]
    Closed(String),

    /// The acknowledgment did not match the request.
    #[error("unexpected acknowledgment: {0}")]
    UnexpectedAck(String),
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
