//! Log messages sent from the server to the client

use serde_json::Value;
use tracing::debug;

use crate::error::{McpError, Result};
use crate::methods;
use crate::protocol::read;
use crate::server::Server;
use crate::types::{LoggingLevel, LoggingMessageNotification};

/// Logging as seen from a [`Server`]
pub struct Logging<'a> {
    pub(crate) server: &'a Server,
}

impl Logging<'_> {
    /// The minimum level set by the client's `logging/setlevel`, if any
    pub fn level(&self) -> Option<LoggingLevel> {
        *read(&self.server.state.log_level)
    }

    /// Sends `notifications/message` if `level` passes the client's threshold.
    ///
    /// Messages below the threshold are dropped. Fails with a configuration
    /// error if the server did not declare logging.
    pub async fn log(&self, level: LoggingLevel, logger: Option<&str>, data: Value) -> Result<()> {
        if self.server.state.capabilities.logging.is_none() {
            return Err(McpError::Configuration(
                "Server does not declare the logging capability".to_owned(),
            ));
        }
        if self.level().is_some_and(|threshold| level < threshold) {
            debug!(?level, "log message below client threshold");
            return Ok(());
        }
        let params = LoggingMessageNotification {
            level,
            logger: logger.map(str::to_owned),
            data: Some(data),
        };
        self.server
            .core
            .notify(methods::NOTIFICATION_MESSAGE, Some(serde_json::to_value(params)?))
            .await
    }
}
