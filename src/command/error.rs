//! Outcomes a waiting caller can observe besides success.

use crate::packet::MqttError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a pending operation did not produce a value.
///
/// `Cancelled` means the operation never ran (or was abandoned before it
/// finished); `Fault` and `Panicked` mean it ran and its own logic failed;
/// `Engine` means the reactor could not run it at all.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The caller stopped waiting. The reactor may still finish the work.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Cancelled explicitly, by `cancel_pending`, or by shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// The channel carrying the operation closed with this cause.
    #[error("channel closed: {0}")]
    Closed(Arc<MqttError>),

    /// The operation's own logic failed.
    #[error("command failed: {0}")]
    Fault(#[source] MqttError),

    /// The operation's own logic panicked.
    #[error("command panicked: {0}")]
    Panicked(String),

    /// The engine is not running or failed while holding the operation.
    #[error("engine failure: {0}")]
    Engine(String),
}

impl CommandError {
    /// Returns `true` for a cancellation outcome.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` when the caller timed out.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Result type for waited-on operations.
pub type CommandResult<T> = Result<T, CommandError>;
