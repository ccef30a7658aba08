//! # Message Correlator
//!
//! [`Protocol`] turns a line-oriented byte stream into typed JSON-RPC traffic:
//!
//! - Outbound requests get a fresh correlation id and wait on a pending-call slot.
//! - The read loop ([`Protocol::listen`]) routes responses to pending calls and
//!   dispatches requests and notifications to the registered handlers.
//! - Handler failures and panics become error responses or log lines. They never
//!   stop the read loop.
//!
//! The byte stream itself is abstracted by [`LineStream`]. Transports implement it
//! and own the resulting `Protocol`.
//!
//! ## Handlers
//!
//! ```rust
//! use mcp_duplex::protocol::{typed_request_handler, HandlerTable};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Add { a: i64, b: i64 }
//!
//! let table = HandlerTable::default();
//! table.set_request_handler(
//!     "math/add",
//!     typed_request_handler(|params: Option<Add>, _cancel| async move {
//!         let Add { a, b } = params.ok_or_else(|| {
//!             mcp_duplex::error::McpError::invalid_params("missing params")
//!         })?;
//!         Ok(a + b)
//!     }),
//! );
//! assert!(table.request_handler("math/add").is_some());
//! ```

use crate::error::{ErrorCode, McpError};
use crate::transport::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    TransportError, TransportErrorCode,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Result type for protocol operations
type Result<T> = std::result::Result<T, TransportError>;

/// Future returned by request and notification handlers
pub type HandlerFuture<T> = BoxFuture<'static, std::result::Result<T, McpError>>;

/// A handler for inbound requests. The returned value becomes the response `result`.
pub type RequestHandlerFn =
    Arc<dyn Fn(JsonRpcRequest, CancellationToken) -> HandlerFuture<Value> + Send + Sync>;

/// A handler for inbound notifications
pub type NotificationHandlerFn =
    Arc<dyn Fn(JsonRpcNotification, CancellationToken) -> HandlerFuture<()> + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Wraps an async closure over the raw request as a [`RequestHandlerFn`].
pub fn request_handler<F, Fut>(f: F) -> RequestHandlerFn
where
    F: Fn(JsonRpcRequest, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, McpError>> + Send + 'static,
{
    Arc::new(move |request, cancel| f(request, cancel).boxed())
}

/// Wraps an async closure over the raw notification as a [`NotificationHandlerFn`].
pub fn notification_handler<F, Fut>(f: F) -> NotificationHandlerFn
where
    F: Fn(JsonRpcNotification, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), McpError>> + Send + 'static,
{
    Arc::new(move |notification, cancel| f(notification, cancel).boxed())
}

/// Builds a request handler that decodes `params` into `P` and encodes the
/// handler's output as the response result.
///
/// Absent or `null` params are passed as `None`. Params that fail to decode are
/// answered with an invalid-params error without calling `f`.
pub fn typed_request_handler<P, R, F, Fut>(f: F) -> RequestHandlerFn
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(Option<P>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, McpError>> + Send + 'static,
{
    Arc::new(move |request: JsonRpcRequest, cancel| {
        match decode_params::<P>(request.params) {
            Ok(params) => {
                let fut = f(params, cancel);
                async move {
                    let value = fut.await?;
                    Ok::<_, McpError>(serde_json::to_value(value)?)
                }
                .boxed()
            }
            Err(e) => futures::future::ready(Err(e)).boxed(),
        }
    })
}

/// Builds a notification handler that decodes `params` into `P`.
pub fn typed_notification_handler<P, F, Fut>(f: F) -> NotificationHandlerFn
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(Option<P>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), McpError>> + Send + 'static,
{
    Arc::new(move |notification: JsonRpcNotification, cancel| {
        match decode_params::<P>(notification.params) {
            Ok(params) => f(params, cancel).boxed(),
            Err(e) => futures::future::ready(Err(e)).boxed(),
        }
    })
}

/// Decodes optional params, treating `null` as absent.
pub fn decode_params<P: DeserializeOwned>(params: Option<Value>) -> std::result::Result<Option<P>, McpError> {
    match params {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| McpError::invalid_params(format!("Invalid parameters: {e}"))),
    }
}

/// Method name → handler maps for requests and notifications.
///
/// Registration may happen at any time, including while a read loop is running.
/// Re-registering a method replaces the previous handler.
#[derive(Default)]
pub struct HandlerTable {
    requests: RwLock<HashMap<String, RequestHandlerFn>>,
    notifications: RwLock<HashMap<String, NotificationHandlerFn>>,
}

impl HandlerTable {
    /// Registers the request handler for `method`
    pub fn set_request_handler(&self, method: &str, handler: RequestHandlerFn) {
        write(&self.requests).insert(method.to_owned(), handler);
    }

    /// Registers the notification handler for `method`
    pub fn set_notification_handler(&self, method: &str, handler: NotificationHandlerFn) {
        write(&self.notifications).insert(method.to_owned(), handler);
    }

    /// Looks up the request handler for `method`
    pub fn request_handler(&self, method: &str) -> Option<RequestHandlerFn> {
        read(&self.requests).get(method).cloned()
    }

    /// Looks up the notification handler for `method`
    pub fn notification_handler(&self, method: &str) -> Option<NotificationHandlerFn> {
        read(&self.notifications).get(method).cloned()
    }

    /// Copies every registration into `other`
    pub fn copy_into(&self, other: &HandlerTable) {
        for (method, handler) in read(&self.requests).iter() {
            other.set_request_handler(method, handler.clone());
        }
        for (method, handler) in read(&self.notifications).iter() {
            other.set_notification_handler(method, handler.clone());
        }
    }
}

/// An ordered, line-delimited duplex stream.
///
/// `read_line` returns `Ok(None)` at a clean end of stream. An `Err` ends the
/// read loop and is reported to every pending and future call.
#[async_trait]
pub trait LineStream: Send + Sync + 'static {
    /// Reads the next line without its terminator
    async fn read_line(&self) -> Result<Option<String>>;

    /// Writes one line; the implementation appends the terminator
    async fn write_line(&self, line: &str) -> Result<()>;
}

/// The correlator bound to one byte stream
pub struct Protocol {
    stream: Arc<dyn LineStream>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>,
    handlers: HandlerTable,
    write_lock: tokio::sync::Mutex<()>,
    backlog: Mutex<VecDeque<String>>,
    closed: Mutex<Option<TransportError>>,
}

impl Protocol {
    /// Creates a correlator over `stream`. Ids start at 1.
    pub fn new(stream: Arc<dyn LineStream>) -> Self {
        Self {
            stream,
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            handlers: HandlerTable::default(),
            write_lock: tokio::sync::Mutex::new(()),
            backlog: Mutex::new(VecDeque::new()),
            closed: Mutex::new(None),
        }
    }

    /// The handler table consulted by the read loop
    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Whether the read loop has ended
    pub fn is_closed(&self) -> bool {
        lock(&self.closed).is_some()
    }

    /// Writes one message. Concurrent writers are serialized.
    ///
    /// Notifications queued with [`queue_notification`](Self::queue_notification)
    /// are written first.
    pub async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        self.check_open()?;
        let line = message.to_line()?;
        let _guard = self.write_lock.lock().await;
        self.write_backlog().await?;
        debug!(line = %line, "sending message");
        self.stream.write_line(&line).await
    }

    /// Queues a notification without waiting for the stream.
    ///
    /// The line goes out ahead of every message sent after this returns. It is
    /// written by the next [`send`](Self::send) or [`flush`](Self::flush).
    pub fn queue_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.check_open()?;
        let notification = JsonRpcNotification::new(method, params);
        let line = JsonRpcMessage::Notification(notification).to_line()?;
        lock(&self.backlog).push_back(line);
        Ok(())
    }

    /// Writes every queued notification
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_backlog().await
    }

    /// Drains the backlog. The caller holds the write lock.
    async fn write_backlog(&self) -> Result<()> {
        loop {
            let next = lock(&self.backlog).pop_front();
            let Some(line) = next else {
                return Ok(());
            };
            debug!(line = %line, "sending queued message");
            self.stream.write_line(&line).await?;
        }
    }

    /// Sends a notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        self.send(&JsonRpcMessage::Notification(notification)).await
    }

    /// Sends a request under a fresh id and waits for the matching response.
    ///
    /// An error response from the peer is returned as `Ok` with `error` set.
    /// `Err` means no response will arrive: the connection closed (the recorded
    /// fault is returned), the write failed, or `cancel` fired.
    ///
    /// Dropping the returned future abandons the pending call.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);
        let _pending = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        // A close that raced the insert has already drained the table.
        self.check_open()?;

        let request = JsonRpcRequest {
            id: id.clone(),
            method: method.to_owned(),
            params,
            ..Default::default()
        };
        self.send(&JsonRpcMessage::Request(request)).await?;

        tokio::select! {
            response = rx => response.map_err(|_| self.closed_error()),
            _ = cancel.cancelled() => Err(TransportError::new(
                TransportErrorCode::Cancelled,
                format!("request {id} ({method}) was cancelled"),
            )),
        }
    }

    /// Runs the read loop until `cancel` fires or the stream ends.
    ///
    /// On exit every pending call is failed with the close reason. A stream
    /// error is also returned to the caller.
    pub async fn listen(&self, cancel: CancellationToken) -> Result<()> {
        debug!("read loop started");
        let outcome = loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                line = self.stream.read_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        _ = self.dispatch(&line, &cancel) => {}
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        let reason = match &outcome {
            Ok(()) => TransportError::closed(),
            Err(e) => e.duplicate(),
        };
        self.close(reason);
        outcome
    }

    fn check_open(&self) -> Result<()> {
        match lock(&self.closed).as_ref() {
            Some(reason) => Err(reason.duplicate()),
            None => Ok(()),
        }
    }

    fn closed_error(&self) -> TransportError {
        lock(&self.closed)
            .as_ref()
            .map(TransportError::duplicate)
            .unwrap_or_else(TransportError::closed)
    }

    fn close(&self, reason: TransportError) {
        {
            let mut closed = lock(&self.closed);
            if closed.is_none() {
                debug!(reason = %reason, "connection closed");
                *closed = Some(reason);
            }
        }
        // Dropping the senders wakes every waiter with the close reason.
        let abandoned: Vec<_> = lock(&self.pending).drain().collect();
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "abandoning pending calls");
        }
    }

    async fn dispatch(&self, line: &str, cancel: &CancellationToken) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if !(line.starts_with('{') && line.ends_with('}')) {
            debug!(line, "skipping non-protocol output");
            return;
        }

        let message = match JsonRpcMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, line, "dropping malformed message");
                if let Some(id) = request_id_of(line) {
                    let error = McpError::protocol(ErrorCode::InvalidRequest, e.to_string());
                    let response = JsonRpcResponse::failure(id, error.to_rpc_error());
                    if let Err(e) = self.send(&JsonRpcMessage::Response(response)).await {
                        warn!(error = %e, "failed to reject malformed request");
                    }
                }
                return;
            }
        };

        match message {
            JsonRpcMessage::Request(request) => self.handle_request(request, cancel).await,
            JsonRpcMessage::Response(response) => self.handle_response(response),
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(notification, cancel)
            }
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest, cancel: &CancellationToken) {
        let id = request.id.clone();
        let method = request.method.clone();

        let response = match self.handlers.request_handler(&method) {
            None => {
                debug!(method = %method, "no handler registered");
                JsonRpcResponse::failure(id, McpError::method_not_found(&method).to_rpc_error())
            }
            Some(handler) => {
                let outcome = AssertUnwindSafe(handler(request, cancel.child_token()))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(result)) => JsonRpcResponse::success(id, result),
                    Ok(Err(e)) => {
                        debug!(method = %method, error = %e, "request handler failed");
                        JsonRpcResponse::failure(id, e.to_rpc_error())
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(method = %method, panic = %message, "request handler panicked");
                        JsonRpcResponse::failure(id, McpError::internal(message).to_rpc_error())
                    }
                }
            }
        };

        if let Err(e) = self.send(&JsonRpcMessage::Response(response)).await {
            warn!(method = %method, error = %e, "failed to write response");
        }
    }

    fn handle_response(&self, response: JsonRpcResponse) {
        let waiter = lock(&self.pending).remove(&response.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(id = %response.id, "dropping unmatched response"),
        }
    }

    fn handle_notification(&self, notification: JsonRpcNotification, cancel: &CancellationToken) {
        let Some(handler) = self.handlers.notification_handler(&notification.method) else {
            debug!(method = %notification.method, "ignoring unhandled notification");
            return;
        };

        let method = notification.method.clone();
        let fut = handler(notification, cancel.child_token());
        tokio::spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(method = %method, error = %e, "notification handler failed"),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(method = %method, panic = %message, "notification handler panicked");
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }
}

/// The id of a line that failed to classify but still looks like a request.
fn request_id_of(line: &str) -> Option<RequestId> {
    let value: Value = serde_json::from_str(line).ok()?;
    let object = value.as_object()?;
    if !object.contains_key("method") {
        return None;
    }
    serde_json::from_value(object.get("id")?.clone()).ok()
}

/// Removes the pending entry when the waiting call goes away.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelStream;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// A protocol wired to channels the test drives directly.
    struct Wire {
        protocol: Arc<Protocol>,
        to_protocol: mpsc::UnboundedSender<String>,
        from_protocol: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    }

    impl Wire {
        fn new() -> Self {
            let (to_protocol, inbound) = mpsc::unbounded_channel();
            let (outbound, from_protocol) = mpsc::unbounded_channel();
            let protocol = Arc::new(Protocol::new(Arc::new(ChannelStream::new(outbound, inbound))));
            Self {
                protocol,
                to_protocol,
                from_protocol,
                cancel: CancellationToken::new(),
            }
        }

        fn listen(&self) -> tokio::task::JoinHandle<Result<()>> {
            let protocol = self.protocol.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move { protocol.listen(cancel).await })
        }

        fn push(&self, value: Value) {
            self.to_protocol.send(value.to_string()).unwrap();
        }

        async fn next(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.from_protocol.recv())
                .await
                .expect("timed out waiting for a line")
                .expect("protocol closed its output");
            serde_json::from_str(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let mut wire = Wire::new();
        wire.listen();

        let calls: Vec<_> = (0..3)
            .map(|n| {
                let protocol = wire.protocol.clone();
                tokio::spawn(async move {
                    protocol
                        .send_request("echo", Some(json!({ "n": n })), &CancellationToken::new())
                        .await
                })
            })
            .collect();

        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(wire.next().await);
        }
        for request in requests.iter().rev() {
            wire.push(json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": { "n": request["params"]["n"] },
            }));
        }

        for (n, call) in calls.into_iter().enumerate() {
            let response = call.await.unwrap().unwrap();
            assert_eq!(response.result, Some(json!({ "n": n })));
        }
        assert_eq!(wire.protocol.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_from_one() {
        let mut wire = Wire::new();
        wire.listen();
        let protocol = wire.protocol.clone();
        let first = tokio::spawn(async move {
            protocol.send_request("a", None, &CancellationToken::new()).await
        });
        let request = wire.next().await;
        assert_eq!(request["id"], 1);
        wire.push(json!({ "jsonrpc": "2.0", "id": 1, "result": {} }));
        first.await.unwrap().unwrap();

        let protocol = wire.protocol.clone();
        let second = tokio::spawn(async move {
            protocol.send_request("b", None, &CancellationToken::new()).await
        });
        assert_eq!(wire.next().await["id"], 2);
        wire.push(json!({ "jsonrpc": "2.0", "id": 2, "result": {} }));
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_and_unmatched_responses_are_ignored() {
        let mut wire = Wire::new();
        let listener = wire.listen();

        let protocol = wire.protocol.clone();
        let call = tokio::spawn(async move {
            protocol.send_request("first", None, &CancellationToken::new()).await
        });
        let request = wire.next().await;

        wire.push(json!({ "jsonrpc": "2.0", "id": 999, "result": "stray" }));
        wire.push(json!({ "jsonrpc": "2.0", "id": request["id"], "result": "one" }));
        wire.push(json!({ "jsonrpc": "2.0", "id": request["id"], "result": "two" }));

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.result, Some(json!("one")));

        // The loop is still alive and correlating.
        let protocol = wire.protocol.clone();
        let call = tokio::spawn(async move {
            protocol.send_request("second", None, &CancellationToken::new()).await
        });
        let request = wire.next().await;
        wire.push(json!({ "jsonrpc": "2.0", "id": request["id"], "result": "three" }));
        assert_eq!(call.await.unwrap().unwrap().result, Some(json!("three")));
        assert!(!listener.is_finished());
    }

    #[tokio::test]
    async fn test_unknown_method_gets_method_not_found() {
        let mut wire = Wire::new();
        wire.listen();

        wire.push(json!({ "jsonrpc": "2.0", "id": "req-7", "method": "nope/nothing" }));
        let response = wire.next().await;
        assert_eq!(response["id"], "req-7");
        assert_eq!(response["error"]["code"], -32601);
        assert_eq!(response["error"]["message"], "Method 'nope/nothing' is not available");
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics_become_responses() {
        let mut wire = Wire::new();
        wire.protocol.handlers().set_request_handler(
            "fails",
            request_handler(|_, _| async { Err(McpError::invalid_params("missing 'name'")) }),
        );
        wire.protocol.handlers().set_request_handler(
            "explodes",
            request_handler(|_, _| async {
                if true {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            }),
        );
        wire.protocol.handlers().set_request_handler(
            "works",
            request_handler(|request, _| async move { Ok(json!({ "got": request.params })) }),
        );
        let listener = wire.listen();

        wire.push(json!({ "jsonrpc": "2.0", "id": 1, "method": "fails" }));
        let response = wire.next().await;
        assert_eq!(response["error"]["code"], ErrorCode::InvalidParams as i32);
        assert_eq!(response["error"]["message"], "missing 'name'");

        wire.push(json!({ "jsonrpc": "2.0", "id": 2, "method": "explodes" }));
        let response = wire.next().await;
        assert_eq!(response["error"]["code"], ErrorCode::InternalError as i32);
        assert!(response["error"]["message"].as_str().unwrap().contains("kaboom"));

        wire.push(json!({ "jsonrpc": "2.0", "id": 3, "method": "works", "params": [1] }));
        let response = wire.next().await;
        assert_eq!(response["result"], json!({ "got": [1] }));
        assert!(!listener.is_finished());
    }

    #[tokio::test]
    async fn test_noise_and_malformed_lines_are_skipped() {
        let mut wire = Wire::new();
        wire.listen();

        for noise in ["", "   ", "Starting server...", "[1,2]", "{not json}", r#"{"jsonrpc":"2.0","id":5}"#] {
            wire.to_protocol.send(noise.to_owned()).unwrap();
        }
        wire.push(json!({ "jsonrpc": "2.0", "id": 9, "method": "missing" }));

        let response = wire.next().await;
        assert_eq!(response["id"], 9);
        assert!(wire.from_protocol.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_ill_typed_params() {
        #[derive(serde::Deserialize)]
        struct Params {
            count: u32,
        }

        let mut wire = Wire::new();
        wire.protocol.handlers().set_request_handler(
            "count",
            typed_request_handler(|params: Option<Params>, _| async move {
                Ok(params.map(|p| p.count * 2))
            }),
        );
        wire.listen();

        wire.push(json!({ "jsonrpc": "2.0", "id": 1, "method": "count", "params": { "count": 21 } }));
        assert_eq!(wire.next().await["result"], 42);

        wire.push(json!({ "jsonrpc": "2.0", "id": 2, "method": "count", "params": { "count": "many" } }));
        assert_eq!(wire.next().await["error"]["code"], ErrorCode::InvalidParams as i32);

        wire.push(json!({ "jsonrpc": "2.0", "id": 3, "method": "count" }));
        assert_eq!(wire.next().await["result"], Value::Null);
    }

    #[tokio::test]
    async fn test_notifications_reach_handlers() {
        let wire = Wire::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        wire.protocol.handlers().set_notification_handler(
            "notifications/progress",
            notification_handler(move |notification, _| {
                let tx = tx.clone();
                async move {
                    tx.send(notification.params).unwrap();
                    Ok(())
                }
            }),
        );
        wire.listen();

        wire.push(json!({ "jsonrpc": "2.0", "method": "notifications/unknown" }));
        wire.push(json!({ "jsonrpc": "2.0", "method": "notifications/progress", "params": { "progress": 1 } }));

        let params = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(params, Some(json!({ "progress": 1 })));
    }

    #[tokio::test]
    async fn test_end_of_stream_fails_pending_and_future_calls() {
        let mut wire = Wire::new();
        let listener = wire.listen();

        let protocol = wire.protocol.clone();
        let call = tokio::spawn(async move {
            protocol.send_request("slow", None, &CancellationToken::new()).await
        });
        wire.next().await;
        drop(wire.to_protocol);

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), Some(TransportErrorCode::ConnectionClosed));
        listener.await.unwrap().unwrap();

        let err = wire
            .protocol
            .send_request("later", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(TransportErrorCode::ConnectionClosed));
        assert_eq!(wire.protocol.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_call_releases_its_slot() {
        let mut wire = Wire::new();
        wire.listen();

        let cancel = CancellationToken::new();
        let protocol = wire.protocol.clone();
        let call_cancel = cancel.clone();
        let call = tokio::spawn(async move { protocol.send_request("slow", None, &call_cancel).await });

        let request = wire.next().await;
        assert_eq!(wire.protocol.pending_len(), 1);
        cancel.cancel();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), Some(TransportErrorCode::Cancelled));
        assert_eq!(wire.protocol.pending_len(), 0);

        // A late response for the abandoned id is harmless.
        wire.push(json!({ "jsonrpc": "2.0", "id": request["id"], "result": {} }));
    }

    #[tokio::test]
    async fn test_malformed_request_with_an_id_is_rejected() {
        let mut wire = Wire::new();
        wire.listen();

        wire.push(json!({ "jsonrpc": "1.0", "id": 7, "method": "ping" }));
        let response = wire.next().await;
        assert_eq!(response["id"], 7);
        assert_eq!(response["error"]["code"], ErrorCode::InvalidRequest as i32);

        wire.push(json!({ "jsonrpc": "2.0", "id": "x", "method": 42 }));
        let response = wire.next().await;
        assert_eq!(response["id"], "x");
        assert_eq!(response["error"]["code"], -32600);

        // Malformed responses get no reply.
        wire.push(json!({ "jsonrpc": "2.0", "id": 8, "result": {}, "error": { "code": 1, "message": "both" } }));
        wire.push(json!({ "jsonrpc": "2.0", "id": 9, "method": "missing" }));
        assert_eq!(wire.next().await["id"], 9);
    }

    #[tokio::test]
    async fn test_queued_notifications_precede_later_sends() {
        let mut wire = Wire::new();
        wire.protocol
            .queue_notification("notifications/tools/list_changed", None)
            .unwrap();
        assert!(wire.from_protocol.try_recv().is_err());

        wire.protocol.notify("notifications/progress", None).await.unwrap();
        assert_eq!(wire.next().await["method"], "notifications/tools/list_changed");
        assert_eq!(wire.next().await["method"], "notifications/progress");

        wire.protocol.queue_notification("a", None).unwrap();
        wire.protocol.queue_notification("b", None).unwrap();
        wire.protocol.flush().await.unwrap();
        assert_eq!(wire.next().await["method"], "a");
        assert_eq!(wire.next().await["method"], "b");
    }
}
