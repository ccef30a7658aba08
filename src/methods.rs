//! Well-known method names

/// Handshake request sent by the client
pub const INITIALIZE: &str = "initialize";
/// Liveness check, answered with an empty result
pub const PING: &str = "ping";
/// Server asks the client for its roots
pub const ROOTS_LIST: &str = "roots/list";
/// List tools
pub const TOOLS_LIST: &str = "tools/list";
/// Invoke a tool
pub const TOOLS_CALL: &str = "tools/call";
/// List prompts
pub const PROMPTS_LIST: &str = "prompts/list";
/// Render a prompt
pub const PROMPTS_GET: &str = "prompts/get";
/// List resources
pub const RESOURCES_LIST: &str = "resources/list";
/// Read a resource
pub const RESOURCES_READ: &str = "resources/read";
/// Ask for `notifications/resources/updated` on one URI
pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
/// Stop updates for one URI
pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
/// List resource templates
pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
/// Argument completion
pub const COMPLETION_COMPLETE: &str = "completion/complete";
/// Set the minimum level of `notifications/message`
pub const LOGGING_SET_LEVEL: &str = "logging/setlevel";
/// Server asks the client to sample from a model
pub const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";

/// Sent by the client once the `initialize` response arrived
pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
/// The tool registry changed
pub const NOTIFICATION_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
/// The prompt registry changed
pub const NOTIFICATION_PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
/// The resource registry changed
pub const NOTIFICATION_RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
/// A resource's contents changed
pub const NOTIFICATION_RESOURCES_UPDATED: &str = "notifications/resources/updated";
/// The client's roots changed
pub const NOTIFICATION_ROOTS_LIST_CHANGED: &str = "notifications/roots/list_changed";
/// A request was abandoned by its sender
pub const NOTIFICATION_CANCELLED: &str = "notifications/cancelled";
/// Progress of a long-running request
pub const NOTIFICATION_PROGRESS: &str = "notifications/progress";
/// A log message from the server
pub const NOTIFICATION_MESSAGE: &str = "notifications/message";
