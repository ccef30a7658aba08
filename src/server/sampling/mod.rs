//! Model sampling requested by the server and performed by the client

use tokio_util::sync::CancellationToken;

use crate::error::{McpError, Result};
use crate::methods;
use crate::server::Server;
use crate::types::{CreateMessageRequest, CreateMessageResponse};

/// Sampling as seen from a [`Server`]
pub struct Sampling<'a> {
    pub(crate) server: &'a Server,
}

impl Sampling<'_> {
    /// Sends `sampling/createMessage` to the client.
    ///
    /// Fails with capability disabled, without sending anything, if the
    /// client did not declare sampling.
    pub async fn create_message(
        &self,
        request: CreateMessageRequest,
        cancel: &CancellationToken,
    ) -> Result<CreateMessageResponse> {
        if let Some(capabilities) = self.server.client_capabilities() {
            if capabilities.sampling.is_none() {
                return Err(McpError::capability_disabled("Client", "sampling"));
            }
        }
        let params = serde_json::to_value(request)?;
        self.server
            .core
            .request(methods::SAMPLING_CREATE_MESSAGE, Some(params), cancel)
            .await
    }
}
