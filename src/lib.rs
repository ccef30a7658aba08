//! # mcp_duplex
//!
//! `mcp_duplex` is a JSON-RPC 2.0 session engine for the Model Context Protocol (MCP).
//! Both ends of a connection can issue requests and notifications and answer
//! the other side's, over any ordered line-delimited stream.
//!
//! ## Features
//!
//! - A correlator that matches responses to requests by id and dispatches
//!   inbound requests and notifications to registered handlers
//! - Transports over a child process's stdio, over any async reader/writer
//!   pair, and in memory
//! - Client and server sessions with the initialize handshake, capability
//!   gating, timeouts and cancellation
//! - Server registries for tools, resources, resource templates and prompts
//!
//! ## Main Components
//!
//! - `protocol`: the correlator and handler plumbing
//! - `transport`: transport implementations and JSON-RPC message types
//! - `client`: MCP client session
//! - `server`: MCP server session and its registries
//! - `types`: MCP payload types
//! - `error`: error type and wire error codes
//!
//! ## Example
//!
//! ```rust
//! use mcp_duplex::server::ToolBuilder;
//! use mcp_duplex::transport::InMemoryTransport;
//! use mcp_duplex::types::{CallToolResponse, Content, ServerCapabilities, ToolCapabilities};
//! use mcp_duplex::{Client, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::builder("adder")
//!     .capabilities(ServerCapabilities {
//!         tools: Some(ToolCapabilities::default()),
//!         ..Default::default()
//!     })
//!     .build();
//! server.tools().add(ToolBuilder::new("add").build(|args, _| async move {
//!     let args = args.unwrap_or_default();
//!     let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
//!     Ok(CallToolResponse {
//!         content: vec![Content::text(sum.to_string())],
//!         is_error: false,
//!     })
//! }))?;
//!
//! let (client_side, server_side) = InMemoryTransport::linked_pair();
//! let cancel = CancellationToken::new();
//! server.connect(server_side, &cancel).await?;
//!
//! let client = Client::builder("calculator").build();
//! client.connect(client_side, &cancel).await?;
//! let result = client
//!     .tools()
//!     .call("add", Some(serde_json::json!({ "a": 2, "b": 3 })), &cancel)
//!     .await?;
//! assert_eq!(result.content, vec![Content::text("5")]);
//!
//! client.dispose().await?;
//! server.dispose().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Client session for talking to MCP servers
pub mod client;

/// Error type and JSON-RPC error codes
pub mod error;

/// Well-known MCP method names
pub mod methods;

/// Request/response correlation and handler dispatch
pub mod protocol;

/// Keyed registries backing the server's tools, resources and prompts
pub mod registry;

/// Server session answering MCP requests
pub mod server;

mod session;
pub use session::{SessionState, DEFAULT_REQUEST_TIMEOUT};

/// Transport layer implementations
pub mod transport;

/// MCP payload types
pub mod types;

pub use client::{Client, ClientBuilder};
pub use error::{McpError, Result};
pub use server::{Server, ServerBuilder};
