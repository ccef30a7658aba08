//! # MCP Server Implementation
//!
//! A [`Server`] answers the protocol's well-known requests from its registries
//! of tools, resources and prompts, and offers sub-APIs for talking back to the
//! client (roots, sampling, logging).
//!
//! ## Request checks
//!
//! Every default handler checks, in order:
//! 1. the capability backing the method was declared (`-32003` otherwise),
//! 2. `initialize` has been handled (`-32004` otherwise; `ping` is exempt),
//! 3. required params are present and well-typed (`-32602` otherwise).
//!
//! ## Submodules
//!
//! * **tool**: tool descriptors and registration
//! * **resource**: resources, templates and URI matching
//! * **prompt**: prompt descriptors and argument validation
//! * **roots**: asking the client for its roots
//! * **sampling**: asking the client to sample a model
//! * **logging**: log messages to the client
//! * **completion**: argument completion
//!
//! ## Examples
//!
//! ```rust,no_run
//! use mcp_duplex::server::{Server, ToolBuilder};
//! use mcp_duplex::transport::ServerStdioTransport;
//! use mcp_duplex::types::{CallToolResponse, Content, ServerCapabilities, ToolCapabilities};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::builder("example-server")
//!     .capabilities(ServerCapabilities {
//!         tools: Some(ToolCapabilities { list_changed: Some(true) }),
//!         ..Default::default()
//!     })
//!     .build();
//!
//! server.tools().add(ToolBuilder::new("echo").build(|args, _| async move {
//!     Ok(CallToolResponse {
//!         content: vec![Content::text(args.unwrap_or_default().to_string())],
//!         is_error: false,
//!     })
//! }))?;
//!
//! server.connect(ServerStdioTransport::default(), &CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

/// Argument completion
pub mod completion;
/// Log messages to the client
pub mod logging;
/// Prompt descriptors and registration
pub mod prompt;
/// Resources, resource templates and URI matching
pub mod resource;
/// Client roots
pub mod roots;
/// Model sampling through the client
pub mod sampling;
/// Tool descriptors and registration
pub mod tool;

pub use completion::Completion;
pub use logging::Logging;
pub use prompt::{PromptBuilder, PromptDescriptor, Prompts};
pub use resource::{ResourceDescriptor, ResourceTemplateDescriptor, Resources, UriTemplate};
pub use roots::Roots;
pub use sampling::Sampling;
pub use tool::{ToolBuilder, ToolDescriptor, Tools};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{McpError, Result};
use crate::methods;
use crate::protocol::{
    decode_params, notification_handler, read, request_handler, write, NotificationHandlerFn,
    RequestHandlerFn,
};
use crate::registry::{Registry, TemplateSet};
use crate::session::{SessionCore, SessionState, DEFAULT_REQUEST_TIMEOUT};
use crate::transport::Transport;
use crate::types::{
    CallToolRequest, ClientCapabilities, CompleteRequest, EmptyResult, GetPromptRequest,
    Implementation, InitializeRequest, InitializeResponse, ListRequest, LoggingLevel,
    PromptsListResponse, ReadResourceRequest, ReadResourceResponse, ResourceTemplatesListResponse,
    ResourcesListResponse, ServerCapabilities, SetLevelRequest, SubscribeRequest,
    ToolsListResponse, LATEST_PROTOCOL_VERSION,
};

use completion::CompletionHandlerFn;
use resource::Subscriptions;

/// Version reported when the builder is not given one
pub const DEFAULT_SERVER_VERSION: &str = "0.0.1";

pub(crate) struct ServerState {
    info: Implementation,
    pub(crate) capabilities: ServerCapabilities,
    instructions: Option<String>,
    page_size: Option<usize>,
    pub(crate) tools: Registry<ToolDescriptor>,
    pub(crate) resources: Registry<ResourceDescriptor>,
    pub(crate) templates: TemplateSet<ResourceTemplateDescriptor>,
    pub(crate) prompts: Registry<PromptDescriptor>,
    pub(crate) subscriptions: Subscriptions,
    pub(crate) log_level: RwLock<Option<LoggingLevel>>,
    pub(crate) completion: RwLock<Option<CompletionHandlerFn>>,
    initialized: AtomicBool,
    client: RwLock<Option<InitializeRequest>>,
}

/// Which declaration a default handler requires
#[derive(Debug, Clone, Copy)]
enum Gate {
    Open,
    Tools,
    Prompts,
    Resources,
    Subscriptions,
    Logging,
    Completions,
}

impl ServerState {
    /// Forgets everything learned from the previous client.
    fn reset(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        *write(&self.client) = None;
        *write(&self.log_level) = None;
        self.subscriptions.clear();
    }

    fn check(&self, gate: Gate, method: &str) -> Result<()> {
        let caps = &self.capabilities;
        let (declared, capability) = match gate {
            Gate::Open => return Ok(()),
            Gate::Tools => (caps.tools.is_some(), "tools"),
            Gate::Prompts => (caps.prompts.is_some(), "prompts"),
            Gate::Resources => (caps.resources.is_some(), "resources"),
            Gate::Subscriptions => (
                caps.resources.as_ref().is_some_and(|r| r.subscribe == Some(true)),
                "resource subscriptions",
            ),
            Gate::Logging => (caps.logging.is_some(), "logging"),
            Gate::Completions => (caps.completions.is_some(), "completions"),
        };
        if !declared {
            return Err(McpError::capability_disabled("Server", capability));
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(McpError::not_initialized(method));
        }
        Ok(())
    }
}

/// An MCP server session
///
/// Cloning is cheap and every clone drives the same session.
#[derive(Clone)]
pub struct Server {
    pub(crate) core: Arc<SessionCore>,
    pub(crate) state: Arc<ServerState>,
}

impl Server {
    /// Starts configuring a server called `name`
    pub fn builder(name: impl Into<String>) -> ServerBuilder {
        ServerBuilder::new(name)
    }

    /// Server name and version
    pub fn info(&self) -> &Implementation {
        &self.state.info
    }

    /// The declared capabilities
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.state.capabilities
    }

    /// Client identity, once `initialize` was handled
    pub fn client_info(&self) -> Option<Implementation> {
        read(&self.state.client).as_ref().map(|c| c.client_info.clone())
    }

    /// Client capabilities, once `initialize` was handled
    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        read(&self.state.client).as_ref().map(|c| c.capabilities.clone())
    }

    /// Whether the client's `initialize` was handled
    pub fn is_initialized(&self) -> bool {
        self.state.initialized.load(Ordering::SeqCst)
    }

    /// Connection state
    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// Whether the transport is attached and running
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// Installs the handlers on `transport` and starts it.
    ///
    /// The server then waits for the client's `initialize`. A server whose
    /// previous transport has closed may connect again; it then waits for a
    /// fresh handshake.
    pub async fn connect<T: Transport>(&self, transport: T, cancel: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + self.core.timeout();
        let state = &self.state;
        self.core
            .attach(Arc::new(transport), cancel, deadline, || state.reset())
            .await?;
        self.core.mark_connected();
        debug!(server = %self.state.info.name, "server connected");
        Ok(())
    }

    /// Cancels in-flight calls and closes the transport. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        self.core.dispose().await
    }

    /// Registers a custom request handler, replacing any default for `method`
    pub fn set_request_handler(&self, method: &str, handler: RequestHandlerFn) {
        self.core.set_request_handler(method, handler);
    }

    /// Registers a notification handler
    pub fn set_notification_handler(&self, method: &str, handler: NotificationHandlerFn) {
        self.core.set_notification_handler(method, handler);
    }

    /// Pings the client
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        let _: EmptyResult = self.core.request(methods::PING, None, cancel).await?;
        Ok(())
    }

    /// Tool registration
    pub fn tools(&self) -> Tools<'_> {
        Tools { server: self }
    }

    /// Resource and template registration
    pub fn resources(&self) -> Resources<'_> {
        Resources { server: self }
    }

    /// Prompt registration
    pub fn prompts(&self) -> Prompts<'_> {
        Prompts { server: self }
    }

    /// The client's roots
    pub fn roots(&self) -> Roots<'_> {
        Roots { server: self }
    }

    /// Sampling through the client
    pub fn sampling(&self) -> Sampling<'_> {
        Sampling { server: self }
    }

    /// Log messages to the client
    pub fn logging(&self) -> Logging<'_> {
        Logging { server: self }
    }

    /// Argument completion
    pub fn completion(&self) -> Completion<'_> {
        Completion { server: self }
    }

    /// Sends a list-changed style notification once the client is initialized.
    pub(crate) fn notify_changed(&self, method: &'static str, params: Option<serde_json::Value>) {
        if self.is_initialized() {
            self.core.try_notify(method, params);
        }
    }
}

/// Builder for [`Server`]
pub struct ServerBuilder {
    info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
    page_size: Option<usize>,
    timeout: Duration,
}

impl ServerBuilder {
    /// Starts a builder for a server called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            info: Implementation {
                name: name.into(),
                version: DEFAULT_SERVER_VERSION.to_owned(),
            },
            capabilities: ServerCapabilities::default(),
            instructions: None,
            page_size: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Server version
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.info.version = version.into();
        self
    }

    /// Declared capabilities. Fixed for the server's lifetime.
    pub fn capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Usage hints returned from `initialize`
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Splits list results into pages of `size` entries
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    /// Bound for requests the server sends to the client
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builds the server and installs its default handlers
    pub fn build(self) -> Server {
        let state = Arc::new(ServerState {
            info: self.info,
            capabilities: self.capabilities,
            instructions: self.instructions,
            page_size: self.page_size,
            tools: Registry::new("Tool"),
            resources: Registry::new("Resource"),
            templates: TemplateSet::default(),
            prompts: Registry::new("Prompt"),
            subscriptions: Subscriptions::default(),
            log_level: RwLock::new(None),
            completion: RwLock::new(None),
            initialized: AtomicBool::new(false),
            client: RwLock::new(None),
        });
        let core = Arc::new(SessionCore::new("server", self.timeout));
        install_default_handlers(&core, &state);
        Server { core, state }
    }
}

/// Registers a request handler that runs the gate checks, then decodes params.
fn route<P, R, F, Fut>(core: &SessionCore, state: &Arc<ServerState>, method: &'static str, gate: Gate, f: F)
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(Arc<ServerState>, Option<P>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let state = state.clone();
    core.set_request_handler(
        method,
        request_handler(move |request, cancel| {
            let checked = state
                .check(gate, method)
                .and_then(|()| decode_params::<P>(request.params));
            let fut = checked.map(|params| f(state.clone(), params, cancel));
            async move {
                let value = fut?.await?;
                Ok::<_, McpError>(serde_json::to_value(value)?)
            }
        }),
    );
}

fn required<P>(params: Option<P>) -> Result<P> {
    params.ok_or_else(|| McpError::invalid_params("Missing params"))
}

fn cursor(params: Option<ListRequest>) -> Option<String> {
    params.and_then(|p| p.cursor)
}

/// Cuts one page out of `items`. The cursor is the decimal offset of the page.
fn paginate<T>(items: Vec<T>, cursor: Option<String>, page_size: Option<usize>) -> Result<(Vec<T>, Option<String>)> {
    let start = match cursor {
        None => 0,
        Some(cursor) => match cursor.parse::<usize>() {
            Ok(offset) if offset <= items.len() => offset,
            _ => return Err(McpError::invalid_params(format!("Invalid cursor '{cursor}'"))),
        },
    };
    let Some(size) = page_size else {
        return Ok((items.into_iter().skip(start).collect(), None));
    };
    let end = start.saturating_add(size).min(items.len());
    let next = (end < items.len()).then(|| end.to_string());
    Ok((items.into_iter().skip(start).take(end - start).collect(), next))
}

fn install_default_handlers(core: &SessionCore, state: &Arc<ServerState>) {
    route(core, state, methods::INITIALIZE, Gate::Open, |state, params: Option<InitializeRequest>, _| async move {
        let request = required(params)?;
        debug!(
            client = %request.client_info.name,
            protocol_version = %request.protocol_version,
            "client initializing"
        );
        let protocol_version = if request.protocol_version.is_empty() {
            LATEST_PROTOCOL_VERSION.to_owned()
        } else {
            request.protocol_version.clone()
        };
        *write(&state.client) = Some(request);
        state.initialized.store(true, Ordering::SeqCst);
        Ok(InitializeResponse {
            protocol_version,
            capabilities: state.capabilities.clone(),
            server_info: state.info.clone(),
            instructions: state.instructions.clone(),
        })
    });

    core.set_notification_handler(
        methods::NOTIFICATION_INITIALIZED,
        notification_handler(|_, _| async {
            debug!("client finished initialization");
            Ok(())
        }),
    );

    route(core, state, methods::PING, Gate::Open, |_, _: Option<serde_json::Value>, _| async {
        Ok(EmptyResult {})
    });

    route(core, state, methods::TOOLS_LIST, Gate::Tools, |state, params: Option<ListRequest>, _| async move {
        let tools = state.tools.list().iter().map(|d| d.metadata.clone()).collect();
        let (tools, next_cursor) = paginate(tools, cursor(params), state.page_size)?;
        Ok(ToolsListResponse { tools, next_cursor })
    });

    route(core, state, methods::TOOLS_CALL, Gate::Tools, |state, params: Option<CallToolRequest>, cancel| async move {
        let request = required(params)?;
        let tool = state
            .tools
            .get(&request.name)
            .ok_or_else(|| McpError::not_found("Tool", &request.name))?;
        debug!(tool = %request.name, "calling tool");
        tool.call(request.arguments, cancel).await
    });

    route(core, state, methods::PROMPTS_LIST, Gate::Prompts, |state, params: Option<ListRequest>, _| async move {
        let prompts = state.prompts.list().iter().map(|d| d.metadata.clone()).collect();
        let (prompts, next_cursor) = paginate(prompts, cursor(params), state.page_size)?;
        Ok(PromptsListResponse { prompts, next_cursor })
    });

    route(core, state, methods::PROMPTS_GET, Gate::Prompts, |state, params: Option<GetPromptRequest>, cancel| async move {
        let request = required(params)?;
        let prompt = state
            .prompts
            .get(&request.name)
            .ok_or_else(|| McpError::not_found("Prompt", &request.name))?;
        prompt.get(request.arguments, cancel)?.await
    });

    route(core, state, methods::RESOURCES_LIST, Gate::Resources, |state, params: Option<ListRequest>, _| async move {
        let resources = state.resources.list().iter().map(|d| d.metadata.clone()).collect();
        let (resources, next_cursor) = paginate(resources, cursor(params), state.page_size)?;
        Ok(ResourcesListResponse { resources, next_cursor })
    });

    route(
        core,
        state,
        methods::RESOURCES_TEMPLATES_LIST,
        Gate::Resources,
        |state, params: Option<ListRequest>, _| async move {
            let templates = state.templates.list().iter().map(|d| d.metadata.clone()).collect();
            let (resource_templates, next_cursor) = paginate(templates, cursor(params), state.page_size)?;
            Ok(ResourceTemplatesListResponse {
                resource_templates,
                next_cursor,
            })
        },
    );

    route(core, state, methods::RESOURCES_READ, Gate::Resources, |state, params: Option<ReadResourceRequest>, cancel| async move {
        let ReadResourceRequest { uri } = required(params)?;
        let contents = if let Some(resource) = state.resources.get(&uri) {
            resource.read(uri, cancel).await?
        } else {
            let template = state
                .templates
                .find(|t| t.pattern().matches(&uri))
                .ok_or_else(|| McpError::not_found("Resource", &uri))?;
            debug!(uri = %uri, template = %template.metadata.uri_template, "reading through template");
            let read = template
                .read(uri.clone(), cancel)
                .ok_or_else(|| McpError::not_found("Resource", &uri))?;
            read.await?
        };
        Ok(ReadResourceResponse { contents })
    });

    route(core, state, methods::RESOURCES_SUBSCRIBE, Gate::Subscriptions, |state, params: Option<SubscribeRequest>, _| async move {
        let request = required(params)?;
        state.subscriptions.subscribe(request.uri);
        Ok(EmptyResult {})
    });

    route(core, state, methods::RESOURCES_UNSUBSCRIBE, Gate::Subscriptions, |state, params: Option<SubscribeRequest>, _| async move {
        let request = required(params)?;
        state.subscriptions.unsubscribe(&request.uri);
        Ok(EmptyResult {})
    });

    route(core, state, methods::LOGGING_SET_LEVEL, Gate::Logging, |state, params: Option<SetLevelRequest>, _| async move {
        let request = required(params)?;
        *write(&state.log_level) = Some(request.level);
        Ok(EmptyResult {})
    });

    route(core, state, methods::COMPLETION_COMPLETE, Gate::Completions, |state, params: Option<CompleteRequest>, cancel| async move {
        let request = required(params)?;
        completion::complete(&state, request, cancel).await
    });
}
