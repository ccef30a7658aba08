//! # MCP Client
//!
//! A [`Client`] drives the handshake with a server and wraps the server's
//! methods in typed calls. Calls against a capability the server did not
//! declare fail locally without touching the wire.
//!
//! The client also answers the server's own requests: `roots/list` from the
//! roots it was given and `sampling/createMessage` through an installed
//! handler. Log messages pushed by the server go to a sink that discards them
//! until [`ClientLogging::set_logger`] installs one.
//!
//! ```rust,no_run
//! use mcp_duplex::client::Client;
//! use mcp_duplex::transport::ClientStdioTransport;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::builder("example-client").version("1.0.0").build();
//! let cancel = CancellationToken::new();
//! let server = client
//!     .connect(ClientStdioTransport::new("my-mcp-server", &[]), &cancel)
//!     .await?;
//! println!("connected to {}", server.server_info.name);
//!
//! for tool in client.tools().list_all(&cancel).await? {
//!     println!("{}", tool.name);
//! }
//! client.dispose().await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{McpError, Result};
use crate::methods;
use crate::protocol::{
    read, typed_notification_handler, typed_request_handler, write, NotificationHandlerFn,
    RequestHandlerFn,
};
use crate::session::{SessionCore, SessionState, DEFAULT_REQUEST_TIMEOUT};
use crate::transport::Transport;
use crate::types::{
    CallToolRequest, CallToolResponse, ClientCapabilities, CompleteRequest, CompleteResponse,
    CreateMessageRequest, CreateMessageResponse, EmptyResult, GetPromptRequest, GetPromptResponse,
    Implementation, InitializeRequest, InitializeResponse, ListRequest, LoggingLevel,
    LoggingMessageNotification, Prompt, PromptsListResponse, ReadResourceRequest,
    ReadResourceResponse, Resource, ResourceTemplatesListResponse, ResourcesListResponse, Root,
    RootsListResponse, ServerCapabilities, SetLevelRequest, SubscribeRequest, Tool,
    ToolsListResponse, LATEST_PROTOCOL_VERSION,
};

/// Receives `notifications/message` payloads
pub type LogSinkFn = Arc<dyn Fn(LoggingMessageNotification) + Send + Sync>;

/// Answers `sampling/createMessage`
pub type SamplingHandlerFn = Arc<
    dyn Fn(CreateMessageRequest, CancellationToken) -> BoxFuture<'static, Result<CreateMessageResponse>>
        + Send
        + Sync,
>;

/// Version reported when the builder is not given one
pub const DEFAULT_CLIENT_VERSION: &str = "0.0.1";

struct ClientState {
    info: Implementation,
    capabilities: ClientCapabilities,
    protocol_version: String,
    server: RwLock<Option<InitializeResponse>>,
    roots: RwLock<Vec<Root>>,
    log_sink: RwLock<LogSinkFn>,
    sampling: RwLock<Option<SamplingHandlerFn>>,
}

/// An MCP client session
///
/// Cloning is cheap and every clone drives the same session.
#[derive(Clone)]
pub struct Client {
    core: Arc<SessionCore>,
    state: Arc<ClientState>,
}

impl Client {
    /// Starts configuring a client called `name`
    pub fn builder(name: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(name)
    }

    /// Client name and version
    pub fn info(&self) -> &Implementation {
        &self.state.info
    }

    /// The declared capabilities
    pub fn capabilities(&self) -> &ClientCapabilities {
        &self.state.capabilities
    }

    /// The server's `initialize` response, once connected
    pub fn server_info(&self) -> Option<InitializeResponse> {
        read(&self.state.server).clone()
    }

    /// Connection state
    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// Whether the handshake finished and the transport is still running
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// Starts `transport` and performs the handshake.
    ///
    /// Sends `initialize`, waits for the response, then sends
    /// `notifications/initialized`. Starting the transport and the exchange
    /// share one deadline of the request timeout and are bounded by `cancel`.
    /// On failure, or once the transport has closed, the client can connect
    /// again.
    pub async fn connect<T: Transport>(
        &self,
        transport: T,
        cancel: &CancellationToken,
    ) -> Result<InitializeResponse> {
        let deadline = Instant::now() + self.core.timeout();
        let server = &self.state.server;
        self.core
            .attach(Arc::new(transport), cancel, deadline, || *write(server) = None)
            .await?;
        match self.core.guard_until(cancel, deadline, self.handshake()).await {
            Ok(response) => {
                *write(&self.state.server) = Some(response.clone());
                self.core.mark_connected();
                debug!(
                    server = %response.server_info.name,
                    protocol_version = %response.protocol_version,
                    "client connected"
                );
                Ok(response)
            }
            Err(e) => {
                self.core.abort_connect().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<InitializeResponse> {
        let request = InitializeRequest {
            protocol_version: self.state.protocol_version.clone(),
            capabilities: self.state.capabilities.clone(),
            client_info: self.state.info.clone(),
        };
        let response: InitializeResponse = self
            .core
            .call(methods::INITIALIZE, Some(serde_json::to_value(request)?))
            .await?;
        if response.protocol_version != self.state.protocol_version {
            warn!(
                requested = %self.state.protocol_version,
                negotiated = %response.protocol_version,
                "server answered with a different protocol version"
            );
        }
        self.core.notify(methods::NOTIFICATION_INITIALIZED, None).await?;
        Ok(response)
    }

    /// Cancels in-flight calls and closes the transport. Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        self.core.dispose().await
    }

    /// Pings the server
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        let _: EmptyResult = self.core.request(methods::PING, None, cancel).await?;
        Ok(())
    }

    /// Registers a custom request handler, replacing any default for `method`
    pub fn set_request_handler(&self, method: &str, handler: RequestHandlerFn) {
        self.core.set_request_handler(method, handler);
    }

    /// Registers a notification handler, e.g. for list-changed notifications
    pub fn set_notification_handler(&self, method: &str, handler: NotificationHandlerFn) {
        self.core.set_notification_handler(method, handler);
    }

    /// Server tools
    pub fn tools(&self) -> ClientTools<'_> {
        ClientTools { client: self }
    }

    /// Server resources
    pub fn resources(&self) -> ClientResources<'_> {
        ClientResources { client: self }
    }

    /// Server prompts
    pub fn prompts(&self) -> ClientPrompts<'_> {
        ClientPrompts { client: self }
    }

    /// Server logging
    pub fn logging(&self) -> ClientLogging<'_> {
        ClientLogging { client: self }
    }

    /// Server argument completion
    pub fn completion(&self) -> ClientCompletion<'_> {
        ClientCompletion { client: self }
    }

    /// Roots offered to the server
    pub fn roots(&self) -> ClientRoots<'_> {
        ClientRoots { client: self }
    }

    /// Sampling on behalf of the server
    pub fn sampling(&self) -> ClientSampling<'_> {
        ClientSampling { client: self }
    }

    /// Fails if the connected server did not declare `capability`.
    fn require(&self, capability: &str, declared: impl Fn(&ServerCapabilities) -> bool) -> Result<()> {
        match read(&self.state.server).as_ref() {
            Some(server) if !declared(&server.capabilities) => {
                Err(McpError::capability_disabled("Server", capability))
            }
            _ => Ok(()),
        }
    }

    async fn request<R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: impl serde::Serialize,
        cancel: &CancellationToken,
    ) -> Result<R> {
        self.core
            .request(method, Some(serde_json::to_value(params)?), cancel)
            .await
    }
}

/// Builder for [`Client`]
pub struct ClientBuilder {
    info: Implementation,
    capabilities: ClientCapabilities,
    protocol_version: String,
    timeout: Duration,
}

impl ClientBuilder {
    /// Starts a builder for a client called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            info: Implementation {
                name: name.into(),
                version: DEFAULT_CLIENT_VERSION.to_owned(),
            },
            capabilities: ClientCapabilities::default(),
            protocol_version: LATEST_PROTOCOL_VERSION.to_owned(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Client version
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.info.version = version.into();
        self
    }

    /// Protocol version requested in `initialize`
    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    /// Declared capabilities. Fixed for the client's lifetime.
    pub fn capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Bound for every request, the handshake included
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builds the client and installs its default handlers
    pub fn build(self) -> Client {
        let discard: LogSinkFn = Arc::new(|_| {});
        let state = Arc::new(ClientState {
            info: self.info,
            capabilities: self.capabilities,
            protocol_version: self.protocol_version,
            server: RwLock::new(None),
            roots: RwLock::new(Vec::new()),
            log_sink: RwLock::new(discard),
            sampling: RwLock::new(None),
        });
        let core = Arc::new(SessionCore::new("client", self.timeout));
        install_default_handlers(&core, &state);
        Client { core, state }
    }
}

fn install_default_handlers(core: &SessionCore, state: &Arc<ClientState>) {
    let roots_state = state.clone();
    core.set_request_handler(
        methods::ROOTS_LIST,
        typed_request_handler(move |_: Option<Value>, _| {
            let state = roots_state.clone();
            async move {
                if state.capabilities.roots.is_none() {
                    return Err(McpError::capability_disabled("Client", "roots"));
                }
                let roots = read(&state.roots).clone();
                Ok(RootsListResponse { roots })
            }
        }),
    );

    let sampling_state = state.clone();
    core.set_request_handler(
        methods::SAMPLING_CREATE_MESSAGE,
        typed_request_handler(move |params: Option<CreateMessageRequest>, cancel| {
            let state = sampling_state.clone();
            async move {
                if state.capabilities.sampling.is_none() {
                    return Err(McpError::capability_disabled("Client", "sampling"));
                }
                let handler = read(&state.sampling)
                    .clone()
                    .ok_or_else(|| McpError::method_not_found(methods::SAMPLING_CREATE_MESSAGE))?;
                let request = params.ok_or_else(|| McpError::invalid_params("Missing params"))?;
                handler(request, cancel).await
            }
        }),
    );

    let log_state = state.clone();
    core.set_notification_handler(
        methods::NOTIFICATION_MESSAGE,
        typed_notification_handler(move |params: Option<LoggingMessageNotification>, _| {
            if let Some(message) = params {
                let sink = read(&log_state.log_sink).clone();
                sink(message);
            }
            futures::future::ready(Ok(()))
        }),
    );
}

/// Tools exposed by the server
pub struct ClientTools<'a> {
    client: &'a Client,
}

impl ClientTools<'_> {
    fn require(&self) -> Result<()> {
        self.client.require("tools", |c| c.tools.is_some())
    }

    /// One page of `tools/list`
    pub async fn list(&self, cursor: Option<String>, cancel: &CancellationToken) -> Result<ToolsListResponse> {
        self.require()?;
        self.client.request(methods::TOOLS_LIST, ListRequest::at(cursor), cancel).await
    }

    /// Every tool, following `nextCursor` until the last page
    pub async fn list_all(&self, cancel: &CancellationToken) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.list(cursor, cancel).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
    }

    /// Invokes tool `name`
    pub async fn call(
        &self,
        name: &str,
        arguments: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<CallToolResponse> {
        self.require()?;
        let request = CallToolRequest {
            name: name.to_owned(),
            arguments,
        };
        self.client.request(methods::TOOLS_CALL, request, cancel).await
    }
}

/// Resources exposed by the server
pub struct ClientResources<'a> {
    client: &'a Client,
}

impl ClientResources<'_> {
    fn require(&self) -> Result<()> {
        self.client.require("resources", |c| c.resources.is_some())
    }

    /// One page of `resources/list`
    pub async fn list(&self, cursor: Option<String>, cancel: &CancellationToken) -> Result<ResourcesListResponse> {
        self.require()?;
        self.client
            .request(methods::RESOURCES_LIST, ListRequest::at(cursor), cancel)
            .await
    }

    /// Every resource, following `nextCursor` until the last page
    pub async fn list_all(&self, cancel: &CancellationToken) -> Result<Vec<Resource>> {
        let mut resources = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.list(cursor, cancel).await?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(resources),
            }
        }
    }

    /// One page of `resources/templates/list`
    pub async fn list_templates(
        &self,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ResourceTemplatesListResponse> {
        self.require()?;
        self.client
            .request(methods::RESOURCES_TEMPLATES_LIST, ListRequest::at(cursor), cancel)
            .await
    }

    /// Reads `uri`
    pub async fn read(&self, uri: &str, cancel: &CancellationToken) -> Result<ReadResourceResponse> {
        self.require()?;
        let request = ReadResourceRequest { uri: uri.to_owned() };
        self.client.request(methods::RESOURCES_READ, request, cancel).await
    }

    /// Asks for `notifications/resources/updated` on `uri`
    pub async fn subscribe(&self, uri: &str, cancel: &CancellationToken) -> Result<()> {
        self.client.require("resource subscriptions", |c| {
            c.resources.as_ref().is_some_and(|r| r.subscribe == Some(true))
        })?;
        let _: EmptyResult = self
            .client
            .request(methods::RESOURCES_SUBSCRIBE, SubscribeRequest { uri: uri.to_owned() }, cancel)
            .await?;
        Ok(())
    }

    /// Stops updates for `uri`
    pub async fn unsubscribe(&self, uri: &str, cancel: &CancellationToken) -> Result<()> {
        self.client.require("resource subscriptions", |c| {
            c.resources.as_ref().is_some_and(|r| r.subscribe == Some(true))
        })?;
        let _: EmptyResult = self
            .client
            .request(methods::RESOURCES_UNSUBSCRIBE, SubscribeRequest { uri: uri.to_owned() }, cancel)
            .await?;
        Ok(())
    }
}

/// Prompts exposed by the server
pub struct ClientPrompts<'a> {
    client: &'a Client,
}

impl ClientPrompts<'_> {
    fn require(&self) -> Result<()> {
        self.client.require("prompts", |c| c.prompts.is_some())
    }

    /// One page of `prompts/list`
    pub async fn list(&self, cursor: Option<String>, cancel: &CancellationToken) -> Result<PromptsListResponse> {
        self.require()?;
        self.client
            .request(methods::PROMPTS_LIST, ListRequest::at(cursor), cancel)
            .await
    }

    /// Every prompt, following `nextCursor` until the last page
    pub async fn list_all(&self, cancel: &CancellationToken) -> Result<Vec<Prompt>> {
        let mut prompts = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.list(cursor, cancel).await?;
            prompts.extend(page.prompts);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(prompts),
            }
        }
    }

    /// Renders prompt `name` with `arguments`, an object of strings
    pub async fn get(
        &self,
        name: &str,
        arguments: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<GetPromptResponse> {
        self.require()?;
        let request = GetPromptRequest {
            name: name.to_owned(),
            arguments,
        };
        self.client.request(methods::PROMPTS_GET, request, cancel).await
    }
}

/// Server logging
pub struct ClientLogging<'a> {
    client: &'a Client,
}

impl ClientLogging<'_> {
    /// Sets the minimum level of messages the server sends
    pub async fn set_level(&self, level: LoggingLevel, cancel: &CancellationToken) -> Result<()> {
        self.client.require("logging", |c| c.logging.is_some())?;
        let _: EmptyResult = self
            .client
            .request(methods::LOGGING_SET_LEVEL, SetLevelRequest { level }, cancel)
            .await?;
        Ok(())
    }

    /// Routes `notifications/message` to `sink`
    pub fn set_logger<F>(&self, sink: F)
    where
        F: Fn(LoggingMessageNotification) + Send + Sync + 'static,
    {
        *write(&self.client.state.log_sink) = Arc::new(sink);
    }
}

/// Server argument completion
pub struct ClientCompletion<'a> {
    client: &'a Client,
}

impl ClientCompletion<'_> {
    /// Asks for values completing `request.argument`
    pub async fn complete(&self, request: CompleteRequest, cancel: &CancellationToken) -> Result<CompleteResponse> {
        self.client.require("completions", |c| c.completions.is_some())?;
        self.client
            .request(methods::COMPLETION_COMPLETE, request, cancel)
            .await
    }
}

/// Roots offered to the server
pub struct ClientRoots<'a> {
    client: &'a Client,
}

impl ClientRoots<'_> {
    /// Adds a root, announcing the change if the roots capability asks for it.
    ///
    /// Fails with a configuration error if roots are not declared.
    pub fn add(&self, root: Root) -> Result<()> {
        let Some(capability) = &self.client.state.capabilities.roots else {
            return Err(McpError::Configuration(
                "Client does not declare the roots capability".to_owned(),
            ));
        };
        write(&self.client.state.roots).push(root);
        if capability.list_changed == Some(true) {
            self.client
                .core
                .try_notify(methods::NOTIFICATION_ROOTS_LIST_CHANGED, None);
        }
        Ok(())
    }

    /// The current roots
    pub fn list(&self) -> Vec<Root> {
        read(&self.client.state.roots).clone()
    }
}

/// Sampling on behalf of the server
pub struct ClientSampling<'a> {
    client: &'a Client,
}

impl ClientSampling<'_> {
    /// Installs the handler for `sampling/createMessage`.
    ///
    /// Fails with a configuration error if sampling is not declared.
    pub fn set_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(CreateMessageRequest, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CreateMessageResponse>> + Send + 'static,
    {
        if self.client.state.capabilities.sampling.is_none() {
            return Err(McpError::Configuration(
                "Client does not declare the sampling capability".to_owned(),
            ));
        }
        let handler: SamplingHandlerFn = Arc::new(move |request, cancel| handler(request, cancel).boxed());
        *write(&self.client.state.sampling) = Some(handler);
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("info", &self.state.info)
            .field("state", &self.core.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::protocol::request_handler;
    use crate::transport::{InMemoryTransport, JsonRpcRequest};
    use crate::types::{RootCapabilities, SamplingCapabilities};
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Answers `initialize` like a server that declares nothing, and records
    /// every method it sees.
    async fn scripted_server(seen: mpsc::UnboundedSender<String>) -> InMemoryTransport {
        let (client_side, server_side) = InMemoryTransport::linked_pair();
        let init_seen = seen.clone();
        server_side.set_request_handler(
            methods::INITIALIZE,
            request_handler(move |request: JsonRpcRequest, _| {
                let seen = init_seen.clone();
                async move {
                    seen.send(request.method).unwrap();
                    let version = request.params.unwrap()["protocolVersion"].clone();
                    Ok(json!({
                        "protocolVersion": version,
                        "capabilities": {},
                        "serverInfo": { "name": "scripted", "version": "0" }
                    }))
                }
            }),
        );
        server_side.set_notification_handler(
            methods::NOTIFICATION_INITIALIZED,
            crate::protocol::notification_handler(move |notification, _| {
                let seen = seen.clone();
                async move {
                    seen.send(notification.method).unwrap();
                    Ok(())
                }
            }),
        );
        server_side.start(&CancellationToken::new()).await.unwrap();
        client_side
    }

    #[tokio::test]
    async fn test_handshake_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = scripted_server(tx).await;
        let client = Client::builder("c").build();
        assert_eq!(client.state(), SessionState::Disconnected);

        let response = client.connect(transport, &CancellationToken::new()).await.unwrap();
        assert_eq!(response.protocol_version, LATEST_PROTOCOL_VERSION);
        assert_eq!(client.state(), SessionState::Connected);
        assert!(client.is_connected());

        assert_eq!(rx.recv().await.as_deref(), Some(methods::INITIALIZE));
        assert_eq!(rx.recv().await.as_deref(), Some(methods::NOTIFICATION_INITIALIZED));
    }

    #[tokio::test]
    async fn test_undeclared_server_capabilities_fail_locally() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = scripted_server(tx).await;
        let client = Client::builder("c").build();
        client.connect(transport, &CancellationToken::new()).await.unwrap();
        rx.recv().await;
        rx.recv().await;

        let cancel = CancellationToken::new();
        let err = client.tools().list(None, &cancel).await.unwrap_err();
        assert!(err.has_code(ErrorCode::CapabilityDisabled));
        let err = client.resources().read("x", &cancel).await.unwrap_err();
        assert!(err.has_code(ErrorCode::CapabilityDisabled));
        let err = client.logging().set_level(LoggingLevel::Info, &cancel).await.unwrap_err();
        assert!(err.has_code(ErrorCode::CapabilityDisabled));

        // Nothing reached the wire.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handshake_timeout_allows_reconnect() {
        let (client_side, server_side) = InMemoryTransport::linked_pair();
        server_side.set_request_handler(
            methods::INITIALIZE,
            request_handler(|_, _| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }),
        );
        server_side.start(&CancellationToken::new()).await.unwrap();

        let client = Client::builder("c").timeout(Duration::from_millis(100)).build();
        let err = client.connect(client_side, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout(_)));
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(client.server_info().is_none());

        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = scripted_server(tx).await;
        client.connect(transport, &CancellationToken::new()).await.unwrap();
        assert_eq!(client.state(), SessionState::Connected);
    }

    /// Takes a while to start, then behaves like the wrapped transport.
    struct SlowStart(InMemoryTransport, Duration);

    #[async_trait::async_trait]
    impl Transport for SlowStart {
        fn protocol(&self) -> &Arc<crate::protocol::Protocol> {
            self.0.protocol()
        }

        fn is_connected(&self) -> bool {
            self.0.is_connected()
        }

        async fn start(&self, cancel: &CancellationToken) -> crate::transport::Result<()> {
            tokio::time::sleep(self.1).await;
            self.0.start(cancel).await
        }

        async fn dispose(&self) -> crate::transport::Result<()> {
            self.0.dispose().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_handshake_share_one_deadline() {
        let (client_side, server_side) = InMemoryTransport::linked_pair();
        server_side.set_request_handler(
            methods::INITIALIZE,
            request_handler(|_, _| std::future::pending()),
        );
        server_side.start(&CancellationToken::new()).await.unwrap();

        let client = Client::builder("c").timeout(Duration::from_millis(100)).build();
        let started = tokio::time::Instant::now();
        let err = client
            .connect(
                SlowStart(client_side, Duration::from_millis(80)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout(d) if d == Duration::from_millis(100)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(150));
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_local_configuration_errors() {
        let client = Client::builder("c").build();
        let err = client
            .roots()
            .add(Root {
                uri: "file:///tmp".into(),
                name: None,
            })
            .unwrap_err();
        assert!(matches!(err, McpError::Configuration(_)));
        assert!(client.roots().list().is_empty());

        let err = client
            .sampling()
            .set_handler(|_, _| async { Err(McpError::internal("unused")) })
            .unwrap_err();
        assert!(matches!(err, McpError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_roots_and_sampling_requests_from_the_server() {
        let (client_side, server_side) = InMemoryTransport::linked_pair();
        let client = Client::builder("c")
            .capabilities(ClientCapabilities {
                roots: Some(RootCapabilities { list_changed: None }),
                sampling: Some(SamplingCapabilities {}),
                ..Default::default()
            })
            .build();
        client
            .roots()
            .add(Root {
                uri: "file:///srv".into(),
                name: None,
            })
            .unwrap();

        let lifetime = CancellationToken::new();
        server_side.start(&lifetime).await.unwrap();
        client
            .core
            .attach(Arc::new(client_side), &lifetime, Instant::now() + Duration::from_secs(5), || {})
            .await
            .unwrap();

        let roots = server_side
            .send_request(methods::ROOTS_LIST, None, &lifetime)
            .await
            .unwrap();
        assert_eq!(roots.result.unwrap()["roots"][0]["uri"], "file:///srv");

        // Declared but no handler installed yet.
        let sampling = server_side
            .send_request(
                methods::SAMPLING_CREATE_MESSAGE,
                Some(json!({ "messages": [] })),
                &lifetime,
            )
            .await
            .unwrap();
        assert_eq!(sampling.error.unwrap().code, ErrorCode::MethodNotFound as i32);
    }

    #[tokio::test]
    async fn test_log_sink_receives_messages() {
        let (client_side, server_side) = InMemoryTransport::linked_pair();
        let client = Client::builder("c").build();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        client.logging().set_logger(move |message| sink.lock().unwrap().push(message));

        let lifetime = CancellationToken::new();
        server_side.start(&lifetime).await.unwrap();
        client
            .core
            .attach(Arc::new(client_side), &lifetime, Instant::now() + Duration::from_secs(5), || {})
            .await
            .unwrap();

        server_side
            .protocol()
            .notify(
                methods::NOTIFICATION_MESSAGE,
                Some(json!({ "level": "warning", "data": "disk almost full" })),
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while received.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let messages = received.lock().unwrap();
        assert_eq!(messages[0].level, LoggingLevel::Warning);
        assert_eq!(messages[0].data, Some(json!("disk almost full")));
    }
}
