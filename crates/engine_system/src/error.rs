//! System-layer error types.

use engine_messaging::MessagingError;

use crate::runner::SystemState;
use crate::services::ServiceKey;

/// Errors raised by the [`ServiceLocator`](crate::ServiceLocator) and its
/// registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Nothing is registered under the key.
    #[error("service not found: {key}")]
    NotFound {
        /// The key that was looked up.
        key: ServiceKey,
    },

    /// Something is registered under the key, but not of the requested type.
    #[error("service {key} is a `{registered}`, not a `{requested}`")]
    TypeMismatch {
        /// The key that was looked up.
        key: ServiceKey,
        /// Type name of the registered instance.
        registered: &'static str,
        /// Type name the caller asked for.
        requested: &'static str,
    },

    /// The key was registered twice during initialisation.
    #[error("service {key} is already registered")]
    Duplicate {
        /// The conflicting key.
        key: ServiceKey,
    },
}

/// A failure reported by a system's `on_start` or `on_tick` hook.
///
/// Only [`TickError::Fatal`] takes the system out of its tick loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TickError {
    /// Logged and reported; the loop continues with the next tick.
    #[error("recoverable tick error: {0}")]
    Recoverable(String),

    /// Logged and reported; the system stops.
    #[error("fatal system error: {0}")]
    Fatal(String),
}

impl TickError {
    /// A failure the system can tick past.
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable(message.into())
    }

    /// A failure that ends the system.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Returns `true` for [`TickError::Fatal`].
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// The description without the severity prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Recoverable(message) | Self::Fatal(message) => message,
        }
    }
}

/// A full queue or stream inside a tick is something to retry next tick.
impl From<MessagingError> for TickError {
    fn from(err: MessagingError) -> Self {
        Self::Recoverable(err.to_string())
    }
}

/// Errors raised by the system lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    /// A required service could not be resolved while configuring.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// A lifecycle call was made in a state that does not allow it.
    #[error("system `{system}` cannot {action} while {state}")]
    InvalidTransition {
        /// The system's name.
        system: String,
        /// The attempted operation (`"configure"`, `"start"`, `"stop"`).
        action: &'static str,
        /// The state the system was in.
        state: SystemState,
    },

    /// The OS refused to spawn the worker thread.
    #[error("failed to spawn worker thread for `{system}`: {source}")]
    Spawn {
        /// The system's name.
        system: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The worker thread died outside every contained region.
    #[error("worker thread of `{system}` panicked: {message}")]
    WorkerPanicked {
        /// The system's name.
        system: String,
        /// The panic payload, rendered as text.
        message: String,
    },

    /// The system's own `configure` hook rejected its context.
    #[error("system `{system}` failed to configure: {reason}")]
    Configure {
        /// The system's name.
        system: String,
        /// Why configuration failed.
        reason: String,
    },
}

impl SystemError {
    /// Convenience constructor for [`SystemError::Configure`].
    pub fn configure(system: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configure {
            system: system.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_error_classification() {
        assert!(!TickError::recoverable("late frame").is_fatal());
        assert!(TickError::fatal("device lost").is_fatal());
        assert_eq!(TickError::fatal("device lost").message(), "device lost");
    }

    #[test]
    fn test_messaging_error_is_recoverable() {
        let err: TickError = MessagingError::QueueFull { capacity: 8 }.into();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_not_found_message_names_key() {
        let err = ServiceError::NotFound {
            key: ServiceKey::named("audio.device"),
        };
        assert_eq!(err.to_string(), "service not found: `audio.device`");
    }
}
