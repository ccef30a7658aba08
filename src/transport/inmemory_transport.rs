//! In-memory transport implementation
//!
//! Two [`InMemoryTransport`]s created by [`InMemoryTransport::linked_pair`] are
//! joined by two unbounded queues: lines written by one side are read by the
//! other. No process or real I/O is involved, which makes the pair suitable for
//! embedding a server in the same process as its client and for deterministic
//! tests.
//!
//! # Examples
//!
//! ```
//! use mcp_duplex::transport::{InMemoryTransport, Transport};
//! use mcp_duplex::protocol::request_handler;
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (client, server) = InMemoryTransport::linked_pair();
//! server.set_request_handler(
//!     "echo",
//!     request_handler(|request, _| async move { Ok(request.params.unwrap_or_default()) }),
//! );
//!
//! let lifetime = CancellationToken::new();
//! client.start(&lifetime).await?;
//! server.start(&lifetime).await?;
//!
//! let response = client.send_request("echo", Some(json!({"hello": "world"})), &lifetime).await?;
//! assert_eq!(response.result, Some(json!({"hello": "world"})));
//!
//! client.dispose().await?;
//! server.dispose().await?;
//! # Ok(())
//! # }
//! ```

use super::error::{TransportError, TransportErrorCode};
use super::{Listener, Result, Transport};
use crate::protocol::{lock, LineStream, Protocol};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A [`LineStream`] over a pair of unbounded channels.
///
/// Closing the sending half makes the peer's reader observe end of stream.
pub(crate) struct ChannelStream {
    tx: Mutex<Option<UnboundedSender<String>>>,
    rx: tokio::sync::Mutex<UnboundedReceiver<String>>,
}

impl ChannelStream {
    pub(crate) fn new(tx: UnboundedSender<String>, rx: UnboundedReceiver<String>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub(crate) fn close_outbound(&self) {
        lock(&self.tx).take();
    }
}

#[async_trait]
impl LineStream for ChannelStream {
    async fn read_line(&self) -> Result<Option<String>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let guard = lock(&self.tx);
        let tx = guard.as_ref().ok_or_else(|| {
            TransportError::new(TransportErrorCode::ConnectionClosed, "in-memory channel closed")
        })?;
        tx.send(line.to_owned()).map_err(|e| {
            TransportError::with_source(
                TransportErrorCode::MessageSendFailed,
                "peer dropped its receiving queue",
                e,
            )
        })
    }
}

/// One side of an in-process transport pair
pub struct InMemoryTransport {
    stream: Arc<ChannelStream>,
    protocol: Arc<Protocol>,
    listener: Listener,
}

impl InMemoryTransport {
    /// Creates two transports connected back to back.
    pub fn linked_pair() -> (Self, Self) {
        let (a_to_b, b_from_a) = mpsc::unbounded_channel();
        let (b_to_a, a_from_b) = mpsc::unbounded_channel();
        (
            Self::new(ChannelStream::new(a_to_b, a_from_b)),
            Self::new(ChannelStream::new(b_to_a, b_from_a)),
        )
    }

    fn new(stream: ChannelStream) -> Self {
        let stream = Arc::new(stream);
        let protocol = Arc::new(Protocol::new(stream.clone()));
        Self {
            listener: Listener::new("in-memory", protocol.clone()),
            stream,
            protocol,
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    fn is_connected(&self) -> bool {
        self.listener.is_connected()
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        self.listener.spawn(cancel)
    }

    async fn dispose(&self) -> Result<()> {
        debug!("disposing in-memory transport");
        self.listener.stop();
        self.stream.close_outbound();
        Ok(())
    }
}
