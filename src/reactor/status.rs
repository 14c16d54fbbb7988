//! Engine lifecycle status.

/// Where a channel manager is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    /// Reactor thread starting.
    Initializing,

    /// Accepting commands.
    Running,

    /// Shutdown requested; no new commands accepted.
    Stopping,

    /// Reactor thread finished cleanly.
    Stopped,

    /// Reactor thread died.
    Failed {
        /// What went wrong.
        message: String,
    },
}

impl EngineStatus {
    /// Returns `true` while commands are accepted.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns `true` once the reactor thread has exited for any reason.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed { .. })
    }

    /// Returns `true` if the reactor thread died.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed { message } => write!(f, "failed: {message}"),
        }
    }
}
