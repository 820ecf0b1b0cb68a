//! Error types for the control plane.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::ports::PortId;

/// Result type alias for control plane operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors that can occur while starting, driving or stopping a session.
///
/// Startup errors (`Spawn`, `PortResolution`, `ReadinessTimeout`,
/// `HelperTimeout`, `HelperFailed`, `Path`) leave the session `Invalid`.
/// Steady-state errors (`Transport`, `Decode`) never tear the session down.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A process could not be created.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The discovery helper failed or produced an incomplete port set.
    #[error("port resolution failed: {0}")]
    PortResolution(String),

    /// A port role was asked for but is not part of this session.
    #[error("port {0} is not available")]
    PortUnavailable(PortId),

    /// The runtime did not acknowledge startup in time.
    #[error("runtime did not become ready within {0:?}")]
    ReadinessTimeout(Duration),

    /// The runtime process exited before acknowledging startup.
    #[error("runtime exited during startup (code {0:?})")]
    RuntimeExited(Option<i32>),

    /// A one-shot helper did not exit in time and was killed.
    #[error("helper '{command}' did not finish within {timeout:?}")]
    HelperTimeout { command: String, timeout: Duration },

    /// A one-shot helper exited unsuccessfully.
    #[error("helper '{command}' exited with code {code:?}")]
    HelperFailed { command: String, code: Option<i32> },

    /// Send or receive failure on the message channel.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed inbound message.
    #[error("decode error on '{addr}': {reason}")]
    Decode { addr: String, reason: String },

    /// The operation is not allowed in the current session state.
    #[error("operation '{operation}' not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::api::SessionState,
    },

    /// A required filesystem location is missing or unusable.
    #[error("path error for {path:?}: {reason}")]
    Path { path: PathBuf, reason: String },

    /// Settings file could not be read or written.
    #[error("settings error: {0}")]
    Settings(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub(crate) fn decode(addr: &str, reason: impl Into<String>) -> Self {
        Self::Decode {
            addr: addr.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<rosc::OscError> for ApiError {
    fn from(e: rosc::OscError) -> Self {
        ApiError::Transport(format!("OSC codec error: {:?}", e))
    }
}

impl From<toml::de::Error> for ApiError {
    fn from(e: toml::de::Error) -> Self {
        ApiError::Settings(e.to_string())
    }
}

impl From<toml::ser::Error> for ApiError {
    fn from(e: toml::ser::Error) -> Self {
        ApiError::Settings(e.to_string())
    }
}
