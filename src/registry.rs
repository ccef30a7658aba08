//! Concurrent descriptor stores owned by a server session.
//!
//! [`Registry`] keys descriptors by name or URI and refuses duplicates.
//! [`TemplateSet`] is an unkeyed bag searched front to back. Both hand out
//! snapshots in insertion order, never a live view.

use crate::error::{McpError, Result};
use crate::protocol::{read, write};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Something stored under a unique key
pub trait Keyed {
    /// The registry key, a tool name or resource URI
    fn key(&self) -> &str;
}

struct Entries<D> {
    order: Vec<Arc<D>>,
    index: HashMap<String, usize>,
}

/// An insertion-ordered store with unique keys
pub struct Registry<D> {
    kind: &'static str,
    entries: RwLock<Entries<D>>,
}

impl<D: Keyed> Registry<D> {
    /// Creates an empty registry. `kind` names entries in error messages.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(Entries {
                order: Vec::new(),
                index: HashMap::new(),
            }),
        }
    }

    /// Adds `descriptor`, failing with a configuration error if its key is taken.
    pub fn insert(&self, descriptor: D) -> Result<()> {
        let mut entries = write(&self.entries);
        let key = descriptor.key().to_owned();
        if entries.index.contains_key(&key) {
            return Err(McpError::Configuration(format!(
                "{} '{}' is already registered",
                self.kind, key
            )));
        }
        let position = entries.order.len();
        entries.order.push(Arc::new(descriptor));
        entries.index.insert(key, position);
        Ok(())
    }

    /// Looks up the descriptor stored under `key`
    pub fn get(&self, key: &str) -> Option<Arc<D>> {
        let entries = read(&self.entries);
        entries.index.get(key).map(|&i| entries.order[i].clone())
    }

    /// Every descriptor in insertion order
    pub fn list(&self) -> Vec<Arc<D>> {
        read(&self.entries).order.clone()
    }

    /// Number of descriptors
    pub fn len(&self) -> usize {
        read(&self.entries).order.len()
    }

    /// Whether the registry holds nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An insertion-ordered bag searched by predicate
pub struct TemplateSet<D> {
    items: RwLock<Vec<Arc<D>>>,
}

impl<D> Default for TemplateSet<D> {
    fn default() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
        }
    }
}

impl<D> TemplateSet<D> {
    /// Appends `item`
    pub fn push(&self, item: D) {
        write(&self.items).push(Arc::new(item));
    }

    /// Every item in insertion order
    pub fn list(&self) -> Vec<Arc<D>> {
        read(&self.items).clone()
    }

    /// The first item satisfying `pred`
    pub fn find(&self, mut pred: impl FnMut(&D) -> bool) -> Option<Arc<D>> {
        read(&self.items).iter().find(|item| pred(item)).cloned()
    }
}
