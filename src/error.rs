//! Error types for render tasks and engine backends

use thiserror::Error;

/// Result type alias for engine and task operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a render.
///
/// Errors are `Clone` and comparable because a task stores the first failure
/// it observes in its error slot and hands it back to the caller after the
/// task has reached a terminal phase.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Failed to initialize an engine backend
    #[error("Engine initialization failed: {0}")]
    InitializationError(String),

    /// Failed to start loading a URL
    #[error("Failed to load URL: {0}")]
    LoadError(String),

    /// The engine reported a navigation failure
    #[error("Navigation failed: {0}")]
    NavigationError(String),

    /// Failed to execute JavaScript
    #[error("Script execution failed: {0}")]
    ScriptError(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Network error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Another registrant already holds the engine's callback slot
    #[error("Engine callback slot is already registered")]
    HandlerSlotOccupied,

    /// The rendering engine was dropped while a task still needed it
    #[error("Rendering engine is no longer available")]
    EngineGone,

    /// The render queue worker has shut down
    #[error("Render queue is closed")]
    QueueClosed,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::NavigationError("connection refused".into());
        assert_eq!(err.to_string(), "Navigation failed: connection refused");
        assert_eq!(
            Error::HandlerSlotOccupied.to_string(),
            "Engine callback slot is already registered"
        );
    }
}
