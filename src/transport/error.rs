use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Transport-specific error codes
///
/// Grouped by category:
///
/// - `-1000` to `-1099`: Connection errors
/// - `-1100` to `-1199`: Message errors
/// - `-1300` to `-1399`: Process errors
/// - `-1900` to `-1999`: Generic errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    // Connection errors
    /// Connection to transport failed
    ConnectionFailed = -1000,
    /// Connection was closed
    ConnectionClosed = -1001,

    // Message errors
    /// Message format is invalid
    InvalidMessage = -1101,
    /// Failed to send message
    MessageSendFailed = -1102,
    /// Failed to receive message
    MessageReceiveFailed = -1103,

    // Process errors
    /// Child process could not be spawned
    SpawnFailed = -1300,
    /// Child process exited abnormally
    ProcessExited = -1301,

    // Generic errors
    /// Internal transport error
    InternalError = -1900,
    /// The waiting call was cancelled
    Cancelled = -1901,
    /// Transport is in an invalid state
    InvalidState = -1902,
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed => write!(f, "Failed to establish connection"),
            Self::ConnectionClosed => write!(f, "Connection was closed"),

            Self::InvalidMessage => write!(f, "Invalid message format"),
            Self::MessageSendFailed => write!(f, "Failed to send message"),
            Self::MessageReceiveFailed => write!(f, "Failed to receive message"),

            Self::SpawnFailed => write!(f, "Failed to spawn process"),
            Self::ProcessExited => write!(f, "Process exited"),

            Self::InternalError => write!(f, "Internal error"),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::InvalidState => write!(f, "Invalid state"),
        }
    }
}

/// Transport-specific error type
///
/// Framing failures, stream faults and subprocess exits all surface as a
/// `TransportError`. A fault recorded by the read loop is handed to every
/// pending and future call on that connection (see [`TransportError::duplicate`]).
///
/// # Examples
///
/// ```
/// use mcp_duplex::transport::{TransportError, TransportErrorCode};
///
/// let error = TransportError::new(
///     TransportErrorCode::ConnectionClosed,
///     "peer went away"
/// );
/// assert_eq!(error.code(), Some(TransportErrorCode::ConnectionClosed));
///
/// let exited = TransportError::Process { exit_code: 2, stderr: vec!["boom".into()] };
/// assert_eq!(exited.code(), Some(TransportErrorCode::ProcessExited));
/// ```
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{code}: {message}")]
    /// Transport-specific error
    Transport {
        /// The error code
        code: TransportErrorCode,
        /// Error message
        message: String,
        #[source]
        /// Optional error source
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    #[error("process exited with code {exit_code}{}", format_stderr(.stderr))]
    /// The child process exited with a non-zero code or wrote to stderr
    Process {
        /// Exit code of the child, `-1` when killed by a signal
        exit_code: i32,
        /// Captured stderr lines, in the order they were written
        stderr: Vec<String>,
    },

    #[error("JSON error: {0}")]
    /// JSON serialization/deserialization error
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    /// I/O error
    Io(#[from] std::io::Error),

    #[error("Channel error: {0}")]
    /// Channel communication error
    Channel(String),
}

fn format_stderr(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!(": {}", lines.join("\n"))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TransportError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel(err.to_string())
    }
}

impl TransportError {
    /// Create a new transport error
    pub fn new(code: TransportErrorCode, message: impl Into<String>) -> Self {
        Self::Transport {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a new transport error with source
    pub fn with_source(
        code: TransportErrorCode,
        message: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self::Transport {
            code,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Error returned to calls made on a connection that has closed cleanly
    pub fn closed() -> Self {
        Self::new(TransportErrorCode::ConnectionClosed, "connection closed")
    }

    /// Get the error code, if the variant carries one
    ///
    /// `Json`, `Io` and `Channel` errors have no code.
    pub fn code(&self) -> Option<TransportErrorCode> {
        match self {
            Self::Transport { code, .. } => Some(*code),
            Self::Process { .. } => Some(TransportErrorCode::ProcessExited),
            _ => None,
        }
    }

    /// Produce an equivalent error for another waiter.
    ///
    /// Process faults are copied exactly. Other variants keep their code and
    /// message but lose the source chain, which is not cloneable.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Process { exit_code, stderr } => Self::Process {
                exit_code: *exit_code,
                stderr: stderr.clone(),
            },
            Self::Transport { code, message, .. } => Self::new(*code, message.clone()),
            Self::Channel(message) => Self::Channel(message.clone()),
            other => Self::new(TransportErrorCode::ConnectionClosed, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(TransportErrorCode::ConnectionFailed as i32, -1000);
        assert_eq!(TransportErrorCode::InvalidMessage as i32, -1101);
        assert_eq!(TransportErrorCode::SpawnFailed as i32, -1300);
        assert_eq!(TransportErrorCode::InvalidState as i32, -1902);
    }

    #[test]
    fn test_error_display() {
        let error = TransportError::new(TransportErrorCode::ConnectionFailed, "Failed to connect");
        assert_eq!(error.to_string(), "Failed to establish connection: Failed to connect");

        let error = TransportError::Process {
            exit_code: 3,
            stderr: vec!["first".into(), "second".into()],
        };
        assert_eq!(error.to_string(), "process exited with code 3: first\nsecond");

        let error = TransportError::Process { exit_code: 1, stderr: vec![] };
        assert_eq!(error.to_string(), "process exited with code 1");
    }

    #[test]
    fn test_duplicate_keeps_process_details() {
        let error = TransportError::Process {
            exit_code: 7,
            stderr: vec!["oops".into()],
        };
        match error.duplicate() {
            TransportError::Process { exit_code, stderr } => {
                assert_eq!(exit_code, 7);
                assert_eq!(stderr, vec!["oops".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let io = TransportError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"));
        assert_eq!(io.duplicate().code(), Some(TransportErrorCode::ConnectionClosed));
    }
}
