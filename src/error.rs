//! Error types
//!
//! Each subsystem has its own error enum; [`Error`] wraps them for code paths
//! that cross subsystem boundaries.

use std::time::Duration;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error from the listener or socket
    Io(std::io::Error),
    /// Transport (WebSocket) failure
    Transport(String),
    /// Write did not complete within the write deadline
    WriteTimeout(Duration),
    /// Codec failure
    Codec(CodecError),
    /// Bus failure
    Bus(BusError),
    /// Pipeline failure
    Pipeline(PipelineError),
}

impl Error {
    /// Build a transport error from any displayable error
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Error::Transport(err.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Transport(e) => write!(f, "Transport error: {}", e),
            Error::WriteTimeout(d) => write!(f, "Write timed out after {:?}", d),
            Error::Codec(e) => write!(f, "Codec error: {}", e),
            Error::Bus(e) => write!(f, "Bus error: {}", e),
            Error::Pipeline(e) => write!(f, "Pipeline error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Codec(e) => Some(e),
            Error::Bus(e) => Some(e),
            Error::Pipeline(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e)
    }
}

impl From<BusError> for Error {
    fn from(e: BusError) -> Self {
        Error::Bus(e)
    }
}

impl From<PipelineError> for Error {
    fn from(e: PipelineError) -> Self {
        Error::Pipeline(e)
    }
}

/// Codec errors
#[derive(Debug)]
pub enum CodecError {
    /// Incoming buffer exceeds the configured limit
    SizeLimitExceeded { size: usize, limit: usize },
    /// JSON could not be parsed
    Json(serde_json::Error),
    /// A known message type arrived without its payload
    MissingPayload { iid: String, kind: String },
}

impl CodecError {
    /// Request id of the offending message, if it could be parsed
    pub fn iid(&self) -> Option<&str> {
        match self {
            CodecError::MissingPayload { iid, .. } if !iid.is_empty() => Some(iid),
            _ => None,
        }
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::SizeLimitExceeded { size, limit } => write!(
                f,
                "Incoming message size limit exceeded ({} > {})",
                size, limit
            ),
            CodecError::Json(e) => write!(f, "Invalid JSON: {}", e),
            CodecError::MissingPayload { kind, .. } => {
                write!(f, "Message did not contain {}", kind)
            }
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Json(e)
    }
}

/// Bus errors
#[derive(Debug)]
pub enum BusError {
    /// The trigger queue is at capacity
    QueueFull,
    /// A request got no reply in time
    Timeout(Duration),
    /// Payload (de)serialization failed
    Json(serde_json::Error),
    /// Backend connection failure
    Backend(String),
    /// The sink was closed
    SinkClosed,
    /// No distributed backend is configured
    Disabled,
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::QueueFull => write!(f, "Bus trigger queue full"),
            BusError::Timeout(d) => write!(f, "Bus request timed out after {:?}", d),
            BusError::Json(e) => write!(f, "Bus payload error: {}", e),
            BusError::Backend(e) => write!(f, "Bus backend error: {}", e),
            BusError::SinkClosed => write!(f, "Sink closed"),
            BusError::Disabled => write!(f, "Bus disabled"),
        }
    }
}

impl std::error::Error for BusError {}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Json(e)
    }
}

impl From<redis::RedisError> for BusError {
    fn from(e: redis::RedisError) -> Self {
        BusError::Backend(e.to_string())
    }
}

/// Pipeline errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A sink is already attached to the pipeline
    AlreadyAttached(String),
    /// The pipeline was closed
    Closed(String),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::AlreadyAttached(id) => {
                write!(f, "Pipeline already attached to sink: {}", id)
            }
            PipelineError::Closed(id) => write!(f, "Pipeline closed: {}", id),
        }
    }
}

impl std::error::Error for PipelineError {}
