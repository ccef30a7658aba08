//! # Roots
//!
//! Roots are the filesystem or URI boundaries a client exposes. A server asks
//! for them with `roots/list` and can check whether a URI falls inside one.
//!
//! ```rust
//! use mcp_duplex::server::roots::is_within_roots;
//! use mcp_duplex::types::Root;
//!
//! let roots = vec![Root {
//!     uri: "file:///home/user/projects".to_string(),
//!     name: Some("Projects".to_string()),
//! }];
//! assert!(is_within_roots("file:///home/user/projects/app/src/main.rs", &roots));
//! assert!(!is_within_roots("file:///home/user/projects-old/x", &roots));
//! ```

use tokio_util::sync::CancellationToken;

use crate::error::{McpError, Result};
use crate::methods;
use crate::server::Server;
use crate::types::{Root, RootsListResponse};

/// Whether `uri` equals a root or lies below one
pub fn is_within_roots(uri: &str, roots: &[Root]) -> bool {
    roots.iter().any(|root| {
        let base = root.uri.trim_end_matches('/');
        uri == base
            || uri
                .strip_prefix(base)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Client roots as seen from a [`Server`]
pub struct Roots<'a> {
    pub(crate) server: &'a Server,
}

impl Roots<'_> {
    /// Asks the client for its roots.
    ///
    /// Fails with capability disabled, without sending anything, if the
    /// client's `initialize` did not declare the roots capability.
    pub async fn list(&self, cancel: &CancellationToken) -> Result<Vec<Root>> {
        if let Some(capabilities) = self.server.client_capabilities() {
            if capabilities.roots.is_none() {
                return Err(McpError::capability_disabled("Client", "roots"));
            }
        }
        let response: RootsListResponse = self
            .server
            .core
            .request(methods::ROOTS_LIST, None, cancel)
            .await?;
        Ok(response.roots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_within_roots() {
        let roots = vec![
            Root {
                uri: "file:///home/user/projects/".to_string(),
                name: None,
            },
            Root {
                uri: "https://api.example.com".to_string(),
                name: Some("API Endpoint".to_string()),
            },
        ];
        assert!(is_within_roots("file:///home/user/projects", &roots));
        assert!(is_within_roots("file:///home/user/projects/a", &roots));
        assert!(is_within_roots("https://api.example.com/v1/users", &roots));
        assert!(!is_within_roots("https://api.example.community", &roots));
        assert!(!is_within_roots("file:///etc/passwd", &roots));
    }
}
