//! Engine-level errors.

use std::path::PathBuf;

use engine_messaging::MessagingError;
use engine_system::{ServiceError, SystemError};

/// Errors raised while building, starting or driving the [`Engine`](crate::Engine).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Two systems share a name.
    #[error("a system named `{name}` is already registered")]
    DuplicateSystem {
        /// The conflicting name.
        name: String,
    },

    /// A system depends on a system that was never added.
    #[error("system `{system}` depends on unknown system `{dependency}`")]
    MissingDependency {
        /// The dependent system.
        system: String,
        /// The missing dependency.
        dependency: String,
    },

    /// System dependencies form a cycle.
    #[error("system dependency cycle: {}", cycle.join(" -> "))]
    DependencyCycle {
        /// The systems on the cycle, starting and ending with the same one.
        cycle: Vec<String>,
    },

    /// Registration was attempted after `start`.
    #[error("engine already started; services and systems must be registered before start")]
    AlreadyStarted,

    /// A frame was requested while the engine is not running.
    #[error("engine is not running")]
    NotRunning,

    /// Service registration or lookup failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// A system failed to configure, start or stop.
    #[error(transparent)]
    System(#[from] SystemError),

    /// Publishing an engine event failed.
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    /// The config file could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    ConfigIo {
        /// Path of the config file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`EngineConfig`](crate::EngineConfig).
    #[error("failed to parse config {}: {source}", path.display())]
    ConfigParse {
        /// Path of the config file.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },
}
