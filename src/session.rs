//! State shared by the client and server roles.
//!
//! A [`SessionCore`] owns the handler table that is installed on each new
//! transport, the transport itself while connected, and the lifetime token
//! whose cancellation tears everything down. Every outbound call runs under
//! [`SessionCore::guard`], which races the caller's token, the lifetime token
//! and the request timeout.

use crate::error::{McpError, Result};
use crate::protocol::{lock, read, write, HandlerTable, NotificationHandlerFn, RequestHandlerFn};
use crate::transport::Transport;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default bound for requests and the handshake
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport attached
    Disconnected,
    /// Transport started, handshake in progress
    Connecting,
    /// Handshake finished
    Connected,
    /// Disposed; the session cannot be reused
    Closed,
}

pub(crate) struct SessionCore {
    role: &'static str,
    handlers: HandlerTable,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    lifetime: CancellationToken,
    state: Mutex<SessionState>,
    timeout: Duration,
}

impl SessionCore {
    pub(crate) fn new(role: &'static str, timeout: Duration) -> Self {
        Self {
            role,
            handlers: HandlerTable::default(),
            transport: RwLock::new(None),
            lifetime: CancellationToken::new(),
            state: Mutex::new(SessionState::Disconnected),
            timeout,
        }
    }

    /// The stored state, reported as `Disconnected` once a connected
    /// transport's read loop has ended.
    pub(crate) fn state(&self) -> SessionState {
        let state = *lock(&self.state);
        if state == SessionState::Connected && !self.transport_alive() {
            return SessionState::Disconnected;
        }
        state
    }

    fn transport_alive(&self) -> bool {
        read(&self.transport).as_ref().is_some_and(|t| t.is_connected())
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the handshake finished and the read loop is still running
    pub(crate) fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Registers a request handler now and on every transport attached later.
    pub(crate) fn set_request_handler(&self, method: &str, handler: RequestHandlerFn) {
        self.handlers.set_request_handler(method, handler.clone());
        if let Some(transport) = read(&self.transport).as_ref() {
            transport.set_request_handler(method, handler);
        }
    }

    pub(crate) fn set_notification_handler(&self, method: &str, handler: NotificationHandlerFn) {
        self.handlers.set_notification_handler(method, handler.clone());
        if let Some(transport) = read(&self.transport).as_ref() {
            transport.set_notification_handler(method, handler);
        }
    }

    /// Installs the handlers on `transport` and starts it under the lifetime token.
    ///
    /// A session whose previous transport has died may attach again; the dead
    /// transport is disposed first. `reset` runs once the session is committed
    /// to the new transport and clears per-connection state.
    ///
    /// Leaves the session in `Connecting`; the caller finishes with
    /// [`mark_connected`](Self::mark_connected) or [`abort_connect`](Self::abort_connect).
    pub(crate) async fn attach(
        &self,
        transport: Arc<dyn Transport>,
        cancel: &CancellationToken,
        deadline: Instant,
        reset: impl FnOnce(),
    ) -> Result<()> {
        let stale = {
            let mut state = lock(&self.state);
            match *state {
                SessionState::Closed => return Err(McpError::Disposed),
                SessionState::Connecting => return Err(McpError::AlreadyConnected),
                SessionState::Connected if self.transport_alive() => {
                    return Err(McpError::AlreadyConnected)
                }
                SessionState::Connected | SessionState::Disconnected => {
                    *state = SessionState::Connecting;
                    write(&self.transport).take()
                }
            }
        };
        if let Some(stale) = stale {
            debug!(role = self.role, "replacing dead transport");
            if let Err(e) = stale.dispose().await {
                debug!(role = self.role, error = %e, "dead transport dispose failed");
            }
        }
        reset();

        self.handlers.copy_into(transport.protocol().handlers());
        *write(&self.transport) = Some(transport.clone());
        debug!(role = self.role, "starting transport");

        let started = self
            .guard_until(cancel, deadline, async { Ok(transport.start(&self.lifetime).await?) })
            .await;
        if let Err(e) = started {
            self.abort_connect().await;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn mark_connected(&self) {
        let mut state = lock(&self.state);
        if *state == SessionState::Connecting {
            *state = SessionState::Connected;
        }
    }

    /// Drops a half-connected transport and returns to `Disconnected`.
    pub(crate) async fn abort_connect(&self) {
        let transport = write(&self.transport).take();
        if let Some(transport) = transport {
            if let Err(e) = transport.dispose().await {
                debug!(role = self.role, error = %e, "transport dispose failed");
            }
        }
        let mut state = lock(&self.state);
        if *state != SessionState::Closed {
            *state = SessionState::Disconnected;
        }
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        if self.lifetime.is_cancelled() {
            return Err(McpError::Disposed);
        }
        read(&self.transport).clone().ok_or(McpError::NotConnected)
    }

    /// Runs `fut` until it completes or a cancellation source fires.
    ///
    /// When several sources are ready at once the outcome is reported in the
    /// order: caller cancellation, session disposal, timeout. A transport
    /// failure caused by disposal is reported as disposal.
    pub(crate) async fn guard<T, F>(&self, cancel: &CancellationToken, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.guard_until(cancel, Instant::now() + self.timeout, fut).await
    }

    /// [`guard`](Self::guard) against a fixed deadline shared by several steps.
    pub(crate) async fn guard_until<T, F>(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = tokio::time::sleep_until(deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(McpError::Cancelled),
            _ = self.lifetime.cancelled() => Err(McpError::Disposed),
            _ = deadline => Err(McpError::Timeout(self.timeout)),
            outcome = fut => match outcome {
                Err(McpError::Transport(_)) if self.lifetime.is_cancelled() => Err(McpError::Disposed),
                other => other,
            },
        }
    }

    /// Sends a request without a guard and decodes its result.
    pub(crate) async fn call<R: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<R> {
        let transport = self.transport()?;
        debug!(role = self.role, method, "sending request");
        let response = transport.send_request(method, params, &self.lifetime).await?;
        if let Some(error) = response.error {
            return Err(McpError::Remote(error));
        }
        Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
    }

    /// Sends a request under [`guard`](Self::guard)
    pub(crate) async fn request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<R> {
        self.guard(cancel, self.call(method, params)).await
    }

    pub(crate) async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let transport = self.transport()?;
        transport.protocol().notify(method, params).await?;
        Ok(())
    }

    /// Queues a notification if the session is connected and flushes it in
    /// the background.
    ///
    /// Used from synchronous registry mutations. The notification is written
    /// before any message sent after this returns. Before the handshake this
    /// is a no-op; outside a runtime it waits for the next send.
    pub(crate) fn try_notify(&self, method: &'static str, params: Option<Value>) {
        if self.state() != SessionState::Connected {
            return;
        }
        let Ok(transport) = self.transport() else {
            return;
        };
        if let Err(e) = transport.protocol().queue_notification(method, params) {
            debug!(role = self.role, method, error = %e, "notification not queued");
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(method, "no runtime, notification waits for the next send");
            return;
        };
        let role = self.role;
        runtime.spawn(async move {
            if let Err(e) = transport.protocol().flush().await {
                debug!(role, method, error = %e, "notification not delivered");
            }
        });
    }

    /// Cancels in-flight work, disposes the transport and closes the session. Idempotent.
    pub(crate) async fn dispose(&self) -> Result<()> {
        self.lifetime.cancel();
        *lock(&self.state) = SessionState::Closed;
        let transport = write(&self.transport).take();
        if let Some(transport) = transport {
            debug!(role = self.role, "disposing session");
            transport.dispose().await?;
        }
        Ok(())
    }
}
