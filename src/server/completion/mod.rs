//! # Completion
//!
//! `completion/complete` suggests values for a prompt argument or a resource
//! template variable. An installed handler answers every request. Without
//! one, prompt arguments use the completers given to
//! [`PromptBuilder::with_completion`](crate::server::prompt::PromptBuilder::with_completion)
//! and anything else gets an empty list.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::{McpError, Result};
use crate::protocol::{read, write};
use crate::server::{Server, ServerState};
use crate::types::{CompleteRequest, CompleteResponse, Completion as CompletionValues};

/// At most this many values are returned
pub const MAX_COMPLETION_VALUES: usize = 100;

/// Handler for `completion/complete`
pub type CompletionHandlerFn =
    Arc<dyn Fn(CompleteRequest, CancellationToken) -> BoxFuture<'static, Result<CompleteResponse>> + Send + Sync>;

/// Completion configuration on a [`Server`]
pub struct Completion<'a> {
    pub(crate) server: &'a Server,
}

impl Completion<'_> {
    /// Installs the handler for `completion/complete`, replacing any previous one.
    ///
    /// Fails with a configuration error if completions are not declared.
    pub fn set_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(CompleteRequest, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CompleteResponse>> + Send + 'static,
    {
        let state = &self.server.state;
        if state.capabilities.completions.is_none() {
            return Err(McpError::Configuration(
                "Server does not declare the completions capability".to_owned(),
            ));
        }
        let handler: CompletionHandlerFn = Arc::new(move |request, cancel| handler(request, cancel).boxed());
        *write(&state.completion) = Some(handler);
        Ok(())
    }
}

pub(crate) async fn complete(
    state: &ServerState,
    request: CompleteRequest,
    cancel: CancellationToken,
) -> Result<CompleteResponse> {
    let handler = read(&state.completion).clone();
    if let Some(handler) = handler {
        return handler(request, cancel).await;
    }

    let values = match (request.reference.kind.as_str(), &request.reference.name) {
        ("ref/prompt", Some(name)) => state
            .prompts
            .get(name)
            .and_then(|prompt| prompt.complete(&request.argument.name, &request.argument.value))
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    Ok(truncate(values))
}

fn truncate(mut values: Vec<String>) -> CompleteResponse {
    let total = values.len();
    let has_more = total > MAX_COMPLETION_VALUES;
    values.truncate(MAX_COMPLETION_VALUES);
    CompleteResponse {
        completion: CompletionValues {
            values,
            total: u32::try_from(total).ok(),
            has_more: Some(has_more),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_are_capped() {
        let response = truncate((0..150).map(|n| n.to_string()).collect());
        assert_eq!(response.completion.values.len(), MAX_COMPLETION_VALUES);
        assert_eq!(response.completion.total, Some(150));
        assert_eq!(response.completion.has_more, Some(true));

        let response = truncate(vec!["a".to_owned()]);
        assert_eq!(response.completion.has_more, Some(false));
    }
}
