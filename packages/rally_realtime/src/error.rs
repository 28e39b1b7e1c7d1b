//! Error taxonomy for the subscription core.
//!
//! Connection-level failures surface to the caller of `subscribe`. Bookkeeping
//! misuse is logged and returned but never corrupts state. Listener failures
//! are contained per listener and only ever logged.

use std::time::Duration;

use crate::handle::HandleId;
use crate::topic::Topic;

/// A transport channel could not be opened, or went away.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport failed to open {topic}: {message}")]
    Transport { topic: Topic, message: String },

    #[error("opening {topic} timed out after {after:?}")]
    Timeout { topic: Topic, after: Duration },

    #[error("channel {topic} was torn down before the open completed")]
    Cancelled { topic: Topic },

    #[error("channel {topic} dropped unexpectedly")]
    Dropped { topic: Topic },
}

impl ConnectionError {
    pub fn topic(&self) -> &Topic {
        match self {
            Self::Transport { topic, .. }
            | Self::Timeout { topic, .. }
            | Self::Cancelled { topic }
            | Self::Dropped { topic } => topic,
        }
    }

    /// Whether calling `subscribe` again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::Dropped { .. } => true,
            // Teardown is in progress; the caller is being unmounted anyway.
            Self::Cancelled { .. } => false,
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Dropped { .. } => "dropped",
        }
    }
}

/// Programming errors in calling code. Logged, never fatal (unless the
/// coordinator runs with [`MisusePolicy::Panic`](crate::MisusePolicy)).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MisuseError {
    #[error("handle {id} on {topic} was already released")]
    AlreadyReleased { id: HandleId, topic: Topic },

    #[error("handle {id} on {topic} was not issued by this coordinator")]
    UnknownHandle { id: HandleId, topic: Topic },

    #[error("reference count for {topic} is already zero")]
    CountUnderflow { topic: Topic },

    #[error("a process-wide teardown listener is already installed")]
    TeardownAlreadyInstalled,
}

impl MisuseError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::AlreadyReleased { .. } => "already_released",
            Self::UnknownHandle { .. } => "unknown_handle",
            Self::CountUnderflow { .. } => "count_underflow",
            Self::TeardownAlreadyInstalled => "teardown_already_installed",
        }
    }
}

/// A single listener failed while an event was being delivered.
#[derive(Debug, thiserror::Error)]
pub enum DispatchFailure {
    #[error("listener returned an error: {0:#}")]
    Error(anyhow::Error),

    #[error("listener panicked: {0}")]
    Panic(String),
}

/// Errors reported by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("refused: {0}")]
    Refused(String),

    #[error("transport closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub(crate) fn into_connection_error(self, topic: &Topic) -> ConnectionError {
        ConnectionError::Transport {
            topic: topic.clone(),
            message: self.to_string(),
        }
    }
}

/// A topic key could not be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic key must not be empty")]
    Empty,

    #[error("topic segment {0:?} contains a reserved character")]
    ReservedCharacter(String),
}
