//! Error types for the reqscript sandbox.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sandbox host.
///
/// These are host-side faults (marshaling, bridge installation, engine
/// plumbing). Guest-visible run failures are reported separately as
/// [`crate::capture::ScriptFailure`].
#[derive(Error, Debug)]
pub enum Error {
    /// Boundary marshaling errors
    #[error("Marshal error: {0}")]
    Marshal(String),

    /// Capability bridge errors
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Engine orchestration errors
    #[error("Engine error: {0}")]
    Engine(String),

    /// Network executor errors
    #[error("Network error: {0}")]
    Network(String),

    /// Deliberately unimplemented capability
    #[error("Unsupported capability: {0}")]
    Unsupported(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] Box<serde_json::Error>),
}

impl Error {
    /// Create a marshaling error.
    pub fn marshal(message: impl Into<String>) -> Self {
        Self::Marshal(message.into())
    }

    /// Create a bridge error.
    pub fn bridge(message: impl Into<String>) -> Self {
        Self::Bridge(message.into())
    }

    /// Create an engine error.
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine(message.into())
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Create an unsupported-capability error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Box::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Box::new(value))
    }
}
