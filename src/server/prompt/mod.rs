//! # Prompts
//!
//! Servers publish reusable prompt templates. `prompts/get` checks that every
//! required argument was supplied before calling the prompt's callback.
//!
//! ```rust
//! use mcp_duplex::server::prompt::PromptBuilder;
//! use mcp_duplex::types::{Content, GetPromptResponse, PromptMessage, Role};
//!
//! let prompt = PromptBuilder::new("greeting")
//!     .description("A friendly greeting prompt")
//!     .required_arg("name", Some("Person's name"))
//!     .with_completion("name", |input: &str| {
//!         ["Alice", "Bob", "Charlie"]
//!             .into_iter()
//!             .filter(|name| name.to_lowercase().starts_with(&input.to_lowercase()))
//!             .map(str::to_owned)
//!             .collect()
//!     })
//!     .build(|args, _cancel| async move {
//!         Ok(GetPromptResponse {
//!             description: None,
//!             messages: vec![PromptMessage {
//!                 role: Role::User,
//!                 content: Content::text(format!("Hello, {}!", args["name"])),
//!             }],
//!         })
//!     });
//! assert_eq!(prompt.metadata.arguments.as_ref().map(Vec::len), Some(1));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{McpError, Result};
use crate::methods;
use crate::registry::Keyed;
use crate::server::Server;
use crate::types::{GetPromptResponse, Prompt, PromptArgument};

/// Future returned by prompt callbacks
pub type PromptFuture = BoxFuture<'static, Result<GetPromptResponse>>;

type PromptCallbackFn =
    Arc<dyn Fn(HashMap<String, String>, CancellationToken) -> PromptFuture + Send + Sync>;

/// Suggests values for a partially typed argument
pub type ArgumentCompleter = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// A prompt's metadata together with its callback
pub struct PromptDescriptor {
    /// What `prompts/list` reports
    pub metadata: Prompt,
    completions: HashMap<String, ArgumentCompleter>,
    callback: PromptCallbackFn,
}

impl PromptDescriptor {
    /// Pairs `metadata` with a callback over the supplied arguments
    pub fn new<F, Fut>(metadata: Prompt, callback: F) -> Self
    where
        F: Fn(HashMap<String, String>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GetPromptResponse>> + Send + 'static,
    {
        Self {
            metadata,
            completions: HashMap::new(),
            callback: Arc::new(move |args, cancel| callback(args, cancel).boxed()),
        }
    }

    /// Renders the prompt after checking required arguments
    pub(crate) fn get(&self, arguments: Option<Value>, cancel: CancellationToken) -> Result<PromptFuture> {
        let arguments = string_map(arguments)?;
        for argument in self.metadata.arguments.iter().flatten() {
            if argument.required == Some(true) && !arguments.contains_key(&argument.name) {
                return Err(McpError::invalid_params(format!(
                    "Missing required argument '{}' for prompt '{}'",
                    argument.name, self.metadata.name
                )));
            }
        }
        Ok((self.callback)(arguments, cancel))
    }

    pub(crate) fn complete(&self, argument: &str, value: &str) -> Option<Vec<String>> {
        self.completions.get(argument).map(|completer| completer(value))
    }
}

impl Keyed for PromptDescriptor {
    fn key(&self) -> &str {
        &self.metadata.name
    }
}

/// Flattens a JSON object into string values. Non-string values keep their JSON text.
fn string_map(arguments: Option<Value>) -> Result<HashMap<String, String>> {
    match arguments {
        None | Some(Value::Null) => Ok(HashMap::new()),
        Some(Value::Object(map)) => Ok(map
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(s) => (key, s),
                other => (key, other.to_string()),
            })
            .collect()),
        Some(_) => Err(McpError::invalid_params("Prompt arguments must be an object")),
    }
}

/// Builder for [`PromptDescriptor`]s
pub struct PromptBuilder {
    name: String,
    description: Option<String>,
    arguments: Vec<PromptArgument>,
    completions: HashMap<String, ArgumentCompleter>,
}

impl PromptBuilder {
    /// Create a new prompt builder with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            arguments: Vec::new(),
            completions: HashMap::new(),
        }
    }

    /// Add a description to the prompt
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a required argument to the prompt
    pub fn required_arg(mut self, name: impl Into<String>, description: Option<&str>) -> Self {
        self.arguments.push(PromptArgument {
            name: name.into(),
            description: description.map(str::to_owned),
            required: Some(true),
        });
        self
    }

    /// Add an optional argument to the prompt
    pub fn optional_arg(mut self, name: impl Into<String>, description: Option<&str>) -> Self {
        self.arguments.push(PromptArgument {
            name: name.into(),
            description: description.map(str::to_owned),
            required: Some(false),
        });
        self
    }

    /// Suggestions for `completion/complete` on one argument
    pub fn with_completion<F>(mut self, argument: impl Into<String>, completer: F) -> Self
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        self.completions.insert(argument.into(), Arc::new(completer));
        self
    }

    /// Build the prompt with the given callback
    pub fn build<F, Fut>(self, callback: F) -> PromptDescriptor
    where
        F: Fn(HashMap<String, String>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GetPromptResponse>> + Send + 'static,
    {
        let metadata = Prompt {
            name: self.name,
            description: self.description,
            arguments: (!self.arguments.is_empty()).then_some(self.arguments),
        };
        let mut descriptor = PromptDescriptor::new(metadata, callback);
        descriptor.completions = self.completions;
        descriptor
    }
}

/// Prompt registration on a [`Server`]
pub struct Prompts<'a> {
    pub(crate) server: &'a Server,
}

impl Prompts<'_> {
    /// Registers a prompt.
    ///
    /// Fails with a configuration error if the prompts capability is not
    /// declared or the name is taken.
    pub fn add(&self, descriptor: PromptDescriptor) -> Result<()> {
        let state = &self.server.state;
        let Some(capability) = &state.capabilities.prompts else {
            return Err(McpError::Configuration(
                "Server does not declare the prompts capability".to_owned(),
            ));
        };
        state.prompts.insert(descriptor)?;
        if capability.list_changed == Some(true) {
            self.server.notify_changed(methods::NOTIFICATION_PROMPTS_LIST_CHANGED, None);
        }
        Ok(())
    }

    /// Every registered prompt in registration order
    pub fn list(&self) -> Vec<Prompt> {
        self.server.state.prompts.list().iter().map(|d| d.metadata.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::types::{Content, PromptMessage, Role};
    use serde_json::json;

    fn echo_prompt() -> PromptDescriptor {
        PromptBuilder::new("test")
            .description("A test prompt")
            .required_arg("arg1", Some("First argument"))
            .optional_arg("arg2", None)
            .with_completion("arg1", |input: &str| vec![format!("{input}_completed")])
            .build(|args, _| async move {
                let mut keys: Vec<_> = args.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
                keys.sort();
                Ok(GetPromptResponse {
                    description: None,
                    messages: vec![PromptMessage {
                        role: Role::Assistant,
                        content: Content::text(keys.join(",")),
                    }],
                })
            })
    }

    #[tokio::test]
    async fn test_prompt_builder() {
        let registered = echo_prompt();
        assert_eq!(registered.metadata.name, "test");
        assert_eq!(registered.metadata.description, Some("A test prompt".to_string()));
        assert_eq!(registered.metadata.arguments.as_ref().unwrap().len(), 2);

        assert_eq!(registered.complete("arg1", "ab"), Some(vec!["ab_completed".to_owned()]));
        assert_eq!(registered.complete("arg2", "ab"), None);

        let result = registered
            .get(Some(json!({ "arg1": "x", "arg2": 3 })), CancellationToken::new())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result.messages[0].content, Content::text("arg1=x,arg2=3"));
    }

    #[test]
    fn test_missing_required_argument_is_named() {
        let registered = echo_prompt();
        let err = match registered.get(Some(json!({ "arg2": "y" })), CancellationToken::new()) {
            Err(e) => e,
            Ok(_) => panic!("expected a missing argument error"),
        };
        assert!(err.has_code(ErrorCode::InvalidParams));
        assert_eq!(err.to_string(), "Missing required argument 'arg1' for prompt 'test'");

        let err = match registered.get(Some(json!(["arg1"])), CancellationToken::new()) {
            Err(e) => e,
            Ok(_) => panic!("expected a shape error"),
        };
        assert!(err.has_code(ErrorCode::InvalidParams));
    }
}
