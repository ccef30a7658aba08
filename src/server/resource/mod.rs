//! # Resources
//!
//! Servers expose data through resources. A read first looks for a resource
//! registered under the exact URI, then tries each [`ResourceTemplateDescriptor`]
//! in registration order and uses the first whose [`UriTemplate`] matches.
//!
//! ```rust
//! use mcp_duplex::server::resource::UriTemplate;
//!
//! let template = UriTemplate::new("file:///logs/{date}/{level}");
//! assert!(template.matches("file:///logs/2024-01-01/error"));
//! assert!(!template.matches("file:///logs/2024-01-01"));
//!
//! let captures = template.captures("file:///LOGS/today/warn").unwrap();
//! assert_eq!(captures["date"], "today");
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::{McpError, Result};
use crate::methods;
use crate::protocol::{read, write};
use crate::registry::Keyed;
use crate::server::Server;
use crate::types::{Resource, ResourceContents, ResourceTemplate};

/// Future returned by resource read callbacks
pub type ReadResourceFuture = BoxFuture<'static, Result<Vec<ResourceContents>>>;

type ReadResourceFn = Arc<dyn Fn(String, CancellationToken) -> ReadResourceFuture + Send + Sync>;
type ReadTemplateFn =
    Arc<dyn Fn(String, HashMap<String, String>, CancellationToken) -> ReadResourceFuture + Send + Sync>;

/// A resource registered under a fixed URI
pub struct ResourceDescriptor {
    /// What `resources/list` reports
    pub metadata: Resource,
    callback: ReadResourceFn,
}

impl ResourceDescriptor {
    /// Pairs `metadata` with a read callback that receives the requested URI
    pub fn new<F, Fut>(metadata: Resource, callback: F) -> Self
    where
        F: Fn(String, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ResourceContents>>> + Send + 'static,
    {
        Self {
            metadata,
            callback: Arc::new(move |uri, cancel| callback(uri, cancel).boxed()),
        }
    }

    pub(crate) fn read(&self, uri: String, cancel: CancellationToken) -> ReadResourceFuture {
        (self.callback)(uri, cancel)
    }
}

impl Keyed for ResourceDescriptor {
    fn key(&self) -> &str {
        &self.metadata.uri
    }
}

/// A resource template with its read callback
pub struct ResourceTemplateDescriptor {
    /// What `resources/templates/list` reports
    pub metadata: ResourceTemplate,
    pattern: UriTemplate,
    callback: ReadTemplateFn,
}

impl ResourceTemplateDescriptor {
    /// Pairs `metadata` with a callback that receives the URI and its captured segments
    pub fn new<F, Fut>(metadata: ResourceTemplate, callback: F) -> Self
    where
        F: Fn(String, HashMap<String, String>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ResourceContents>>> + Send + 'static,
    {
        Self {
            pattern: UriTemplate::new(&metadata.uri_template),
            metadata,
            callback: Arc::new(move |uri, captures, cancel| callback(uri, captures, cancel).boxed()),
        }
    }

    /// The parsed pattern
    pub fn pattern(&self) -> &UriTemplate {
        &self.pattern
    }

    pub(crate) fn read(&self, uri: String, cancel: CancellationToken) -> Option<ReadResourceFuture> {
        let captures = self.pattern.captures(&uri)?;
        Some((self.callback)(uri, captures, cancel))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// A `/`-separated URI pattern whose `{name}` segments match any single segment.
///
/// A URI matches when it has the same number of segments and every literal
/// segment equals the URI's segment, ignoring ASCII case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    segments: Vec<Segment>,
}

impl UriTemplate {
    /// Parses `pattern`
    pub fn new(pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .map(|segment| {
                match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    Some(name) => Segment::Variable(name.to_owned()),
                    None => Segment::Literal(segment.to_owned()),
                }
            })
            .collect();
        Self { segments }
    }

    /// Whether `uri` matches the pattern
    pub fn matches(&self, uri: &str) -> bool {
        self.captures(uri).is_some()
    }

    /// The variable bindings for `uri`, or `None` if it does not match
    pub fn captures(&self, uri: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = uri.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut captures = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal.eq_ignore_ascii_case(part) => {}
                Segment::Literal(_) => return None,
                Segment::Variable(name) => {
                    captures.insert(name.clone(), part.to_owned());
                }
            }
        }
        Some(captures)
    }
}

/// Resource registration on a [`Server`]
pub struct Resources<'a> {
    pub(crate) server: &'a Server,
}

impl Resources<'_> {
    fn require_capability(&self) -> Result<bool> {
        match &self.server.state.capabilities.resources {
            Some(capability) => Ok(capability.list_changed == Some(true)),
            None => Err(McpError::Configuration(
                "Server does not declare the resources capability".to_owned(),
            )),
        }
    }

    /// Registers a resource under its URI.
    ///
    /// Fails with a configuration error if the resources capability is not
    /// declared or the URI is taken.
    pub fn add(&self, descriptor: ResourceDescriptor) -> Result<()> {
        let list_changed = self.require_capability()?;
        self.server.state.resources.insert(descriptor)?;
        if list_changed {
            self.server.notify_changed(methods::NOTIFICATION_RESOURCES_LIST_CHANGED, None);
        }
        Ok(())
    }

    /// Registers a resource template. Templates are tried in registration order.
    pub fn add_template(&self, descriptor: ResourceTemplateDescriptor) -> Result<()> {
        let list_changed = self.require_capability()?;
        self.server.state.templates.push(descriptor);
        if list_changed {
            self.server.notify_changed(methods::NOTIFICATION_RESOURCES_LIST_CHANGED, None);
        }
        Ok(())
    }

    /// Every registered resource in registration order
    pub fn list(&self) -> Vec<Resource> {
        self.server.state.resources.list().iter().map(|d| d.metadata.clone()).collect()
    }

    /// Every registered template in registration order
    pub fn list_templates(&self) -> Vec<ResourceTemplate> {
        self.server.state.templates.list().iter().map(|d| d.metadata.clone()).collect()
    }

    /// Sends `notifications/resources/updated` if the client subscribed to `uri`
    pub fn notify_updated(&self, uri: &str) -> Result<()> {
        self.require_capability()?;
        if self.server.state.subscriptions.contains(uri) {
            self.server.notify_changed(
                methods::NOTIFICATION_RESOURCES_UPDATED,
                Some(json!({ "uri": uri })),
            );
        }
        Ok(())
    }
}

/// URIs the client subscribed to with `resources/subscribe`
#[derive(Default)]
pub(crate) struct Subscriptions {
    uris: std::sync::RwLock<HashSet<String>>,
}

impl Subscriptions {
    pub(crate) fn subscribe(&self, uri: String) {
        write(&self.uris).insert(uri);
    }

    pub(crate) fn unsubscribe(&self, uri: &str) {
        write(&self.uris).remove(uri);
    }

    pub(crate) fn contains(&self, uri: &str) -> bool {
        read(&self.uris).contains(uri)
    }

    pub(crate) fn clear(&self) {
        write(&self.uris).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_requires_equal_segment_count() {
        let template = UriTemplate::new("res/{id}");
        assert!(template.matches("res/42"));
        assert!(!template.matches("res/42/extra"));
        assert!(!template.matches("res"));
    }

    #[test]
    fn test_literals_after_a_variable_must_match() {
        let template = UriTemplate::new("a/{x}/c");
        assert!(template.matches("a/1/c"));
        assert!(template.matches("A/1/C"));
        assert!(!template.matches("a/1/WRONG"));
    }

    #[test]
    fn test_captures_bind_every_variable() {
        let template = UriTemplate::new("db://{schema}/tables/{table}");
        let captures = template.captures("db://public/tables/users").unwrap();
        assert_eq!(captures.len(), 2);
        assert_eq!(captures["schema"], "public");
        assert_eq!(captures["table"], "users");
        assert!(template.captures("db://public/views/users").is_none());
    }

    #[tokio::test]
    async fn test_template_descriptor_receives_captures() {
        let descriptor = ResourceTemplateDescriptor::new(
            ResourceTemplate::new("res/{id}", "Numbered"),
            |uri, captures, _| async move {
                Ok(vec![ResourceContents::text(uri, format!("item {}", captures["id"]))])
            },
        );
        let contents = descriptor
            .read("res/7".to_owned(), CancellationToken::new())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(contents[0].text.as_deref(), Some("item 7"));
        assert!(descriptor.read("other/7".to_owned(), CancellationToken::new()).is_none());
    }

    #[test]
    fn test_subscriptions() {
        let subscriptions = Subscriptions::default();
        subscriptions.subscribe("file:///a".to_owned());
        assert!(subscriptions.contains("file:///a"));
        subscriptions.unsubscribe("file:///a");
        assert!(!subscriptions.contains("file:///a"));
    }
}
