//! # Transport Layer
//!
//! A transport supplies an ordered, line-delimited byte stream to a
//! [`Protocol`](crate::protocol::Protocol) correlator and owns that correlator for
//! its whole connected lifetime.
//!
//! ## Transport Types
//!
//! * **Client Stdio Transport**: spawns a child process and talks to it over its
//!   standard input/output. Standard error is captured and reported when the child
//!   exits abnormally. Disposal tears down the whole process tree.
//! * **Stream Transport**: reads and writes newline-delimited JSON over any async
//!   reader/writer pair. [`ServerStdioTransport`] is the variant bound to the
//!   current process's own stdin/stdout.
//! * **In-Memory Transport**: two correlators joined by two unbounded queues, for
//!   embedding and deterministic tests.
//!
//! ## Message Types
//!
//! Each line is one JSON-RPC 2.0 object:
//!
//! * **Requests** carry an `id` and a `method`.
//! * **Responses** carry an `id` and exactly one of `result` or `error`.
//! * **Notifications** carry a `method` and no `id`.
//!
//! Lines that do not classify as one of the three are framing errors. They fail
//! that single line and never the connection.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mcp_duplex::transport::{InMemoryTransport, Transport};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (left, right) = InMemoryTransport::linked_pair();
//! let lifetime = CancellationToken::new();
//! left.start(&lifetime).await?;
//! right.start(&lifetime).await?;
//!
//! let response = left
//!     .send_request("ping", None, &lifetime)
//!     .await?;
//! // Nobody registered "ping" on the right side.
//! assert_eq!(response.error.map(|e| e.code), Some(-32601));
//!
//! left.dispose().await?;
//! right.dispose().await?;
//! # Ok(())
//! # }
//! ```

use crate::protocol::{lock, NotificationHandlerFn, Protocol, RequestHandlerFn};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

mod error;
pub use error::{TransportError, TransportErrorCode};

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

mod stdio_transport;
pub use stdio_transport::*;
mod inmemory_transport;
pub use inmemory_transport::*;
mod process_tree;

/// Message type alias used throughout the crate
pub type Message = JsonRpcMessage;

/// Core trait for all transports
///
/// Every transport owns a [`Protocol`] and delegates message traffic and handler
/// registration to it. Implementors supply the lifecycle: `start` begins the read
/// loop, `dispose` tears it down and must be safe to call more than once.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The correlator bound to this transport's byte stream
    fn protocol(&self) -> &Arc<Protocol>;

    /// Whether the read loop is currently running
    fn is_connected(&self) -> bool;

    /// Opens the underlying stream and spawns the read loop.
    ///
    /// The read loop stops when `cancel` fires, when [`Transport::dispose`] is
    /// called, or when the stream ends.
    async fn start(&self, cancel: &CancellationToken) -> Result<()>;

    /// Stops the read loop and releases the underlying stream. Idempotent.
    async fn dispose(&self) -> Result<()>;

    /// Writes one message
    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        self.protocol().send(message).await
    }

    /// Sends a request and waits for the correlated response
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse> {
        self.protocol().send_request(method, params, cancel).await
    }

    /// Registers the handler for inbound requests of `method`
    fn set_request_handler(&self, method: &str, handler: RequestHandlerFn) {
        self.protocol().handlers().set_request_handler(method, handler);
    }

    /// Registers the handler for inbound notifications of `method`
    fn set_notification_handler(&self, method: &str, handler: NotificationHandlerFn) {
        self.protocol().handlers().set_notification_handler(method, handler);
    }
}

/// Spawns and stops a protocol read loop on behalf of a transport.
pub(crate) struct Listener {
    name: &'static str,
    protocol: Arc<Protocol>,
    connected: Arc<AtomicBool>,
    token: Mutex<Option<CancellationToken>>,
}

impl Listener {
    pub(crate) fn new(name: &'static str, protocol: Arc<Protocol>) -> Self {
        Self {
            name,
            protocol,
            connected: Arc::new(AtomicBool::new(false)),
            token: Mutex::new(None),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Fails with `InvalidState` if the loop was already started once.
    pub(crate) fn ensure_unstarted(&self) -> Result<()> {
        if lock(&self.token).is_some() {
            return Err(TransportError::new(
                TransportErrorCode::InvalidState,
                format!("{} transport already started", self.name),
            ));
        }
        Ok(())
    }

    pub(crate) fn spawn(&self, parent: &CancellationToken) -> Result<()> {
        let token = {
            let mut slot = lock(&self.token);
            if slot.is_some() {
                return Err(TransportError::new(
                    TransportErrorCode::InvalidState,
                    format!("{} transport already started", self.name),
                ));
            }
            let token = parent.child_token();
            *slot = Some(token.clone());
            token
        };

        self.connected.store(true, Ordering::SeqCst);
        let protocol = self.protocol.clone();
        let connected = self.connected.clone();
        let name = self.name;
        tokio::spawn(async move {
            match protocol.listen(token).await {
                Ok(()) => debug!(transport = name, "read loop finished"),
                Err(e) => error!(transport = name, error = %e, "read loop failed"),
            }
            connected.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    pub(crate) fn stop(&self) {
        if let Some(token) = lock(&self.token).as_ref() {
            token.cancel();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// A JSON-RPC correlation identifier: either an integer or a string.
///
/// Ids issued by this crate are always integers. Ids chosen by the remote party
/// are opaque and echoed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id
    Number(i64),
    /// String id
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// The `jsonrpc` member, always `"2.0"` on messages this crate writes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct JsonRpcVersion(String);

impl Default for JsonRpcVersion {
    fn default() -> Self {
        JsonRpcVersion("2.0".to_owned())
    }
}

impl JsonRpcVersion {
    /// The version string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One decoded wire message
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// A request expecting a response
    Request(JsonRpcRequest),
    /// A response to an earlier request
    Response(JsonRpcResponse),
    /// A one-way notification
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Decodes and classifies a single line.
    ///
    /// # Examples
    ///
    /// ```
    /// use mcp_duplex::transport::JsonRpcMessage;
    ///
    /// let msg = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","method":"ping","id":"a"}"#).unwrap();
    /// assert!(matches!(msg, JsonRpcMessage::Request(_)));
    ///
    /// // A response may not carry both a result and an error.
    /// let bad = r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"x"}}"#;
    /// assert!(JsonRpcMessage::parse(bad).is_err());
    /// ```
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)?;
        Self::from_value(value)
    }

    /// Classifies an already-decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(invalid("message is not a JSON object"));
        };

        match map.get("jsonrpc") {
            Some(Value::String(version)) if version == "2.0" => {}
            _ => return Err(invalid("missing or unsupported jsonrpc version")),
        }

        let id = match map.remove("id") {
            None | Some(Value::Null) => None,
            Some(id) => Some(
                serde_json::from_value::<RequestId>(id)
                    .map_err(|_| invalid("id must be an integer or a string"))?,
            ),
        };
        let method = match map.remove("method") {
            None => None,
            Some(Value::String(method)) => Some(method),
            Some(_) => return Err(invalid("method must be a string")),
        };
        let params = map.remove("params");

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request(JsonRpcRequest {
                id,
                method,
                params,
                ..Default::default()
            })),
            (None, Some(method)) => Ok(Self::Notification(JsonRpcNotification {
                method,
                params,
                ..Default::default()
            })),
            (Some(id), None) => Ok(Self::Response(response_from_map(id, map)?)),
            (None, None) => Err(invalid("message has neither id nor method")),
        }
    }

    /// Encodes the message as a single line without the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn response_from_map(id: RequestId, mut map: Map<String, Value>) -> Result<JsonRpcResponse> {
    let result = map.remove("result");
    let error = map.remove("error");
    match (result, error) {
        (Some(_), Some(_)) => Err(invalid("response carries both result and error")),
        (None, None) => Err(invalid("response carries neither result nor error")),
        (Some(result), None) => Ok(JsonRpcResponse::success(id, result)),
        (None, Some(error)) => {
            let error: JsonRpcError = serde_json::from_value(error)
                .map_err(|e| TransportError::with_source(TransportErrorCode::InvalidMessage, "malformed error object", e))?;
            Ok(JsonRpcResponse::failure(id, error))
        }
    }
}

fn invalid(message: &str) -> TransportError {
    TransportError::new(TransportErrorCode::InvalidMessage, message)
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// A request message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    /// Correlation id
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Protocol version marker
    pub jsonrpc: JsonRpcVersion,
}

impl Default for JsonRpcRequest {
    fn default() -> Self {
        Self {
            id: RequestId::Number(0),
            method: String::new(),
            params: None,
            jsonrpc: JsonRpcVersion::default(),
        }
    }
}

/// A notification message
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct JsonRpcNotification {
    /// Method name
    pub method: String,
    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Protocol version marker
    pub jsonrpc: JsonRpcVersion,
}

impl JsonRpcNotification {
    /// Builds a notification for `method`
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            jsonrpc: JsonRpcVersion::default(),
        }
    }
}

/// A response message. Exactly one of `result` or `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    /// Id of the request being answered
    pub id: RequestId,
    /// Success payload; `Some(Value::Null)` is a valid success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Protocol version marker
    pub jsonrpc: JsonRpcVersion,
}

impl JsonRpcResponse {
    /// A successful response
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
            jsonrpc: JsonRpcVersion::default(),
        }
    }

    /// An error response
    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
            jsonrpc: JsonRpcVersion::default(),
        }
    }
}

/// The error member of a failed response
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcError {
    /// Numeric error code
    pub code: i32,
    /// Human-readable description
    pub message: String,
    /// Optional structured detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}
