//! Tools a server exposes to clients
//!
//! A [`ToolDescriptor`] pairs the [`Tool`] metadata listed by `tools/list` with
//! the callback run by `tools/call`. Callbacks receive the raw `arguments`
//! value, or a typed struct when built with [`ToolDescriptor::typed`].
//!
//! # Examples
//!
//! ```
//! use mcp_duplex::server::tool::ToolBuilder;
//! use mcp_duplex::types::{CallToolResponse, Content};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct GreetingArgs {
//!     name: String,
//!     formal: Option<bool>,
//! }
//!
//! let descriptor = ToolBuilder::new("greet")
//!     .description("Greets someone")
//!     .input_schema(serde_json::json!({
//!         "type": "object",
//!         "properties": { "name": { "type": "string" } },
//!         "required": ["name"]
//!     }))
//!     .build_typed(|args: GreetingArgs, _cancel| async move {
//!         let prefix = if args.formal.unwrap_or(false) { "Hello, " } else { "Hi, " };
//!         Ok(CallToolResponse {
//!             content: vec![Content::text(format!("{prefix}{}", args.name))],
//!             is_error: false,
//!         })
//!     });
//! assert_eq!(descriptor.metadata.name, "greet");
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{McpError, Result};
use crate::registry::Keyed;
use crate::server::Server;
use crate::types::{CallToolResponse, Tool, ToolAnnotations};

/// Future returned by tool callbacks
pub type ToolFuture = BoxFuture<'static, Result<CallToolResponse>>;

type ToolCallbackFn = Arc<dyn Fn(Option<Value>, CancellationToken) -> ToolFuture + Send + Sync>;

/// A tool's metadata together with its callback
pub struct ToolDescriptor {
    /// What `tools/list` reports
    pub metadata: Tool,
    callback: ToolCallbackFn,
}

impl ToolDescriptor {
    /// A tool whose callback receives the raw `arguments` value
    pub fn new<F, Fut>(metadata: Tool, callback: F) -> Self
    where
        F: Fn(Option<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResponse>> + Send + 'static,
    {
        Self {
            metadata,
            callback: Arc::new(move |args, cancel| callback(args, cancel).boxed()),
        }
    }

    /// A tool whose arguments are decoded into `A` before the callback runs.
    ///
    /// Missing arguments decode from an empty object. Arguments that do not
    /// decode fail the call with invalid params.
    pub fn typed<A, F, Fut>(metadata: Tool, callback: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResponse>> + Send + 'static,
    {
        let name = metadata.name.clone();
        Self::new(metadata, move |args, cancel| {
            let decoded = serde_json::from_value::<A>(args.unwrap_or_else(|| json!({})))
                .map_err(|e| McpError::invalid_params(format!("Invalid arguments for tool '{name}': {e}")));
            let fut = decoded.map(|args| callback(args, cancel));
            async move { fut?.await }
        })
    }

    pub(crate) fn call(&self, args: Option<Value>, cancel: CancellationToken) -> ToolFuture {
        (self.callback)(args, cancel)
    }
}

impl Keyed for ToolDescriptor {
    fn key(&self) -> &str {
        &self.metadata.name
    }
}

/// Builder for [`ToolDescriptor`]s
pub struct ToolBuilder {
    name: String,
    description: Option<String>,
    input_schema: Option<Value>,
    annotations: Option<ToolAnnotations>,
}

impl ToolBuilder {
    /// Starts a tool called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: None,
            annotations: None,
        }
    }

    /// Add a description to the tool
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// JSON schema of the arguments. Defaults to `{"type": "object"}`.
    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Side-effect hints
    pub fn annotations(mut self, annotations: ToolAnnotations) -> Self {
        self.annotations = Some(annotations);
        self
    }

    fn metadata(self) -> Tool {
        Tool {
            name: self.name,
            description: self.description,
            input_schema: self.input_schema.unwrap_or_else(|| json!({ "type": "object" })),
            annotations: self.annotations,
        }
    }

    /// Build the tool with a callback over raw arguments
    pub fn build<F, Fut>(self, callback: F) -> ToolDescriptor
    where
        F: Fn(Option<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResponse>> + Send + 'static,
    {
        ToolDescriptor::new(self.metadata(), callback)
    }

    /// Build the tool with a typed callback
    pub fn build_typed<A, F, Fut>(self, callback: F) -> ToolDescriptor
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResponse>> + Send + 'static,
    {
        ToolDescriptor::typed(self.metadata(), callback)
    }
}

/// Tool registration on a [`Server`]
pub struct Tools<'a> {
    pub(crate) server: &'a Server,
}

impl Tools<'_> {
    /// Registers a tool.
    ///
    /// Fails with a configuration error if the server did not declare the
    /// tools capability or a tool of the same name exists. Emits
    /// `notifications/tools/list_changed` when that flag was declared.
    pub fn add(&self, descriptor: ToolDescriptor) -> Result<()> {
        let state = &self.server.state;
        let Some(capability) = &state.capabilities.tools else {
            return Err(McpError::Configuration(
                "Server does not declare the tools capability".to_owned(),
            ));
        };
        state.tools.insert(descriptor)?;
        if capability.list_changed == Some(true) {
            self.server.notify_changed(crate::methods::NOTIFICATION_TOOLS_LIST_CHANGED, None);
        }
        Ok(())
    }

    /// Every registered tool in registration order
    pub fn list(&self) -> Vec<Tool> {
        self.server.state.tools.list().iter().map(|d| d.metadata.clone()).collect()
    }
}
