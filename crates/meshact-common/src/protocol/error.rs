use serde_json::Value;
use thiserror::Error;

use crate::protocol::envelope::WireError;

/// Wire code carried by a not-found error reply
pub const CODE_NOT_FOUND: &str = "act_not_found";
/// Wire code carried by a reply to an undecodable payload
pub const CODE_DECODE: &str = "decode";
pub const CODE_ROUTING: &str = "no_route";
pub const CODE_TIMEOUT: &str = "timeout";
pub const CODE_CLOSED: &str = "closed";
pub const CODE_TRANSPORT: &str = "transport";
pub const CODE_INVALID: &str = "invalid";

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("no destination for {pattern}: no pin matches and no catchall is registered")]
    Routing { pattern: String, tx: String },

    #[error("action {pattern} not found")]
    NotFound { pattern: String, tx: String },

    /// An action handler reported a failure, locally or at a peer
    #[error("action {pattern} failed: {message}.")]
    Remote {
        pattern: String,
        tx: String,
        message: String,
        code: Option<String>,
        details: Option<Value>,
    },

    #[error("action {pattern} timed out after {timeout_ms}ms")]
    Timeout {
        pattern: String,
        tx: String,
        timeout_ms: u64,
    },

    #[error("closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("cannot bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MeshError {
    /// True when the call ran into its deadline without any reply.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MeshError::Timeout { .. })
    }

    /// The transaction id of the failed call, when the error belongs to one.
    pub fn tx(&self) -> Option<&str> {
        match self {
            MeshError::Routing { tx, .. }
            | MeshError::NotFound { tx, .. }
            | MeshError::Remote { tx, .. }
            | MeshError::Timeout { tx, .. } => Some(tx),
            _ => None,
        }
    }

    /// The pattern of the failed call in its display form.
    pub fn pattern(&self) -> Option<&str> {
        match self {
            MeshError::Routing { pattern, .. }
            | MeshError::NotFound { pattern, .. }
            | MeshError::Remote { pattern, .. }
            | MeshError::Timeout { pattern, .. } => Some(pattern),
            _ => None,
        }
    }

    /// Short machine-readable code used when this error crosses the wire.
    pub fn code(&self) -> &str {
        match self {
            MeshError::Decode(_) => CODE_DECODE,
            MeshError::Routing { .. } => CODE_ROUTING,
            MeshError::NotFound { .. } => CODE_NOT_FOUND,
            MeshError::Remote { code, .. } => code.as_deref().unwrap_or("action_failed"),
            MeshError::Timeout { .. } => CODE_TIMEOUT,
            MeshError::Closed => CODE_CLOSED,
            MeshError::Config(_) => CODE_INVALID,
            _ => CODE_TRANSPORT,
        }
    }

    /// Converts the error into the body of an error reply.
    ///
    /// Handler failures keep their original message so the final caller
    /// formats it exactly once, however many hops the reply travelled.
    pub fn to_wire(&self) -> WireError {
        match self {
            MeshError::Remote {
                message,
                code,
                details,
                ..
            } => WireError {
                message: message.clone(),
                code: code.clone(),
                details: details.clone(),
            },
            other => WireError::new(other.to_string()).with_code(other.code()),
        }
    }

    /// Rebuilds a caller-side error from an error reply.
    pub fn from_wire(wire: WireError, pattern: impl Into<String>, tx: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let tx = tx.into();
        match wire.code.as_deref() {
            Some(CODE_NOT_FOUND) => MeshError::NotFound { pattern, tx },
            _ => MeshError::Remote {
                pattern,
                tx,
                message: wire.message,
                code: wire.code,
                details: wire.details,
            },
        }
    }
}

/// Failure reported by an action handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionError {
    pub message: String,
    pub code: Option<String>,
    pub details: Option<Value>,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        ActionError {
            message: message.into(),
            code: None,
            details: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn into_wire(self) -> WireError {
        WireError {
            message: self.message,
            code: self.code,
            details: self.details,
        }
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ActionError {}

impl From<&str> for ActionError {
    fn from(message: &str) -> Self {
        ActionError::new(message)
    }
}

impl From<String> for ActionError {
    fn from(message: String) -> Self {
        ActionError::new(message)
    }
}

// Lets handlers propagate failed nested calls with `?`.
impl From<MeshError> for ActionError {
    fn from(err: MeshError) -> Self {
        let code = err.code().to_string();
        ActionError::new(err.to_string()).with_code(code)
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
