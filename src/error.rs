//! # Session Error Handling
//!
//! [`McpError`] is the error returned by every session-level operation, and
//! [`ErrorCode`] holds the numeric codes written to the wire.
//!
//! Handler errors are converted to JSON-RPC error responses with
//! [`McpError::to_rpc_error`]. Errors the peer sends back arrive as
//! [`McpError::Remote`], and [`McpError::code`] lets callers tell the failure
//! kinds apart without matching on message text.
//!
//! ```rust
//! use mcp_duplex::error::{ErrorCode, McpError};
//!
//! let error = McpError::invalid_params("missing 'name'");
//! assert_eq!(error.code(), Some(ErrorCode::InvalidParams as i32));
//!
//! let wire = error.to_rpc_error();
//! assert_eq!(wire.code, -32602);
//! assert_eq!(wire.message, "missing 'name'");
//! ```

use crate::transport::{JsonRpcError, TransportError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error codes written to the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Standard JSON-RPC error codes
    /// Invalid JSON was received
    ParseError = -32700,
    /// The JSON sent is not a valid request object
    InvalidRequest = -32600,
    /// The method does not exist or is not available
    MethodNotFound = -32601,
    /// Invalid or missing method parameters
    InvalidParams = -32602,
    /// Internal error, the default for handler failures
    InternalError = -32603,

    // Session error codes
    /// The connection closed before the call completed
    ConnectionClosed = -32000,
    /// The call did not complete in time
    RequestTimeout = -32001,
    /// A tool, prompt or resource lookup missed
    NotFound = -32002,
    /// The capability backing the method was not declared
    CapabilityDisabled = -32003,
    /// A business method arrived before `initialize`
    NotInitialized = -32004,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::ParseError => write!(f, "Parse error"),
            ErrorCode::InvalidRequest => write!(f, "Invalid request"),
            ErrorCode::MethodNotFound => write!(f, "Method not found"),
            ErrorCode::InvalidParams => write!(f, "Invalid parameters"),
            ErrorCode::InternalError => write!(f, "Internal error"),
            ErrorCode::ConnectionClosed => write!(f, "Connection closed"),
            ErrorCode::RequestTimeout => write!(f, "Request timeout"),
            ErrorCode::NotFound => write!(f, "Not found"),
            ErrorCode::CapabilityDisabled => write!(f, "Capability disabled"),
            ErrorCode::NotInitialized => write!(f, "Session not initialized"),
        }
    }
}

impl TryFrom<i32> for ErrorCode {
    type Error = String;

    fn try_from(code: i32) -> std::result::Result<Self, Self::Error> {
        match code {
            -32700 => Ok(ErrorCode::ParseError),
            -32600 => Ok(ErrorCode::InvalidRequest),
            -32601 => Ok(ErrorCode::MethodNotFound),
            -32602 => Ok(ErrorCode::InvalidParams),
            -32603 => Ok(ErrorCode::InternalError),
            -32000 => Ok(ErrorCode::ConnectionClosed),
            -32001 => Ok(ErrorCode::RequestTimeout),
            -32002 => Ok(ErrorCode::NotFound),
            -32003 => Ok(ErrorCode::CapabilityDisabled),
            -32004 => Ok(ErrorCode::NotInitialized),
            _ => Err(format!("Invalid error code: {}", code)),
        }
    }
}

impl JsonRpcError {
    /// Creates an error object with a known code
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
            data: None,
        }
    }

    /// Creates an error object carrying structured data
    pub fn with_data(
        code: ErrorCode,
        message: impl Into<String>,
        data: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
            data: Some(data.into()),
        }
    }
}

/// Result alias for session operations
pub type Result<T> = std::result::Result<T, McpError>;

/// Errors surfaced by sessions, handlers and registries
#[derive(Error, Debug)]
pub enum McpError {
    /// A protocol error raised locally, sent to the peer with its code
    #[error("{message}")]
    Protocol {
        /// Wire code
        code: ErrorCode,
        /// Description
        message: String,
    },

    /// The peer answered with an error response
    #[error("remote error {}: {}", .0.code, .0.message)]
    Remote(JsonRpcError),

    /// Duplicate registration or undeclared capability. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The caller's cancellation token fired
    #[error("operation was cancelled")]
    Cancelled,

    /// The session was disposed while the operation was outstanding
    #[error("session has been disposed")]
    Disposed,

    /// The operation exceeded its timeout
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// No transport is attached
    #[error("session is not connected")]
    NotConnected,

    /// `connect` was called on a session with a live transport
    #[error("session is already connected")]
    AlreadyConnected,

    /// The transport failed or closed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A payload could not be serialized or deserialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An arbitrary failure raised by a user handler
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl McpError {
    /// A protocol error with an explicit code
    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    /// The method has no handler
    pub fn method_not_found(method: &str) -> Self {
        Self::protocol(
            ErrorCode::MethodNotFound,
            format!("Method '{method}' is not available"),
        )
    }

    /// Parameters are missing or ill-typed
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::protocol(ErrorCode::InvalidParams, message)
    }

    /// The capability backing a method was not declared
    pub fn capability_disabled(side: &str, capability: &str) -> Self {
        Self::protocol(
            ErrorCode::CapabilityDisabled,
            format!("{side} does not support {capability}"),
        )
    }

    /// A registry lookup missed
    pub fn not_found(kind: &str, key: &str) -> Self {
        Self::protocol(ErrorCode::NotFound, format!("{kind} '{key}' not found"))
    }

    /// A business method arrived before the handshake finished
    pub fn not_initialized(method: &str) -> Self {
        Self::protocol(
            ErrorCode::NotInitialized,
            format!("Cannot handle '{method}' before initialize"),
        )
    }

    /// An internal failure with a free-form message
    pub fn internal(message: impl Into<String>) -> Self {
        Self::protocol(ErrorCode::InternalError, message)
    }

    /// The numeric code for protocol and remote errors
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Protocol { code, .. } => Some(*code as i32),
            Self::Remote(e) => Some(e.code),
            _ => None,
        }
    }

    /// Whether the error carries `code`, locally or from the peer
    pub fn has_code(&self, code: ErrorCode) -> bool {
        self.code() == Some(code as i32)
    }

    /// Converts the error into the object written in an error response.
    ///
    /// Remote errors pass through unchanged. Everything that is not a protocol
    /// error becomes an internal error whose message is the error's text.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::Protocol { code, message } => JsonRpcError::new(*code, message.clone()),
            Self::Remote(e) => e.clone(),
            Self::Timeout(_) => JsonRpcError::new(ErrorCode::RequestTimeout, self.to_string()),
            other => JsonRpcError::new(ErrorCode::InternalError, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trip() {
        for code in [
            ErrorCode::MethodNotFound,
            ErrorCode::InvalidParams,
            ErrorCode::NotFound,
            ErrorCode::CapabilityDisabled,
            ErrorCode::NotInitialized,
        ] {
            assert_eq!(ErrorCode::try_from(code as i32), Ok(code));
        }
        assert!(ErrorCode::try_from(42).is_err());
    }

    #[test]
    fn test_method_not_found_message() {
        let error = McpError::method_not_found("tools/frobnicate");
        let wire = error.to_rpc_error();
        assert_eq!(wire.code, -32601);
        assert_eq!(wire.message, "Method 'tools/frobnicate' is not available");
    }

    #[test]
    fn test_handler_faults_become_internal_errors() {
        let error = McpError::from(anyhow::anyhow!("disk on fire"));
        let wire = error.to_rpc_error();
        assert_eq!(wire.code, ErrorCode::InternalError as i32);
        assert_eq!(wire.message, "disk on fire");
    }

    #[test]
    fn test_remote_errors_keep_their_code() {
        let error = McpError::Remote(JsonRpcError::new(ErrorCode::NotFound, "Tool 'x' not found"));
        assert!(error.has_code(ErrorCode::NotFound));
        assert_eq!(error.to_string(), "remote error -32002: Tool 'x' not found");
    }
}
