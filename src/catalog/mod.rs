//! Tool, prompt, resource and resource-template registries
//!
//! One catalog is shared by every connection. Registries keep insertion order
//! for bookkeeping while listings are always served sorted by name or URI.
//! Every mutation is committed under the registry lock and the matching
//! list-changed event is broadcast only after that lock is released.

pub mod builtin;
pub mod prompts;
pub mod resources;
pub mod tools;

use std::{
    any::Any,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use indexmap::IndexMap;
use tokio::sync::broadcast;
use tracing::debug;

use prompts::PromptEntry;
use resources::{ResourceEntry, TemplateEntry};
use tools::ToolEntry;

pub use prompts::text_message;
pub use resources::ResourceRequest;

const CHANGE_BUFFER: usize = 64;

/// Which listing a mutation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChanged {
    Tools,
    Prompts,
    Resources,
}

impl ListChanged {
    pub fn method(self) -> &'static str {
        match self {
            Self::Tools => "notifications/tools/list_changed",
            Self::Prompts => "notifications/prompts/list_changed",
            Self::Resources => "notifications/resources/list_changed",
        }
    }
}

#[derive(Default)]
struct Registries {
    tools: IndexMap<String, ToolEntry>,
    prompts: IndexMap<String, PromptEntry>,
    resources: IndexMap<String, ResourceEntry>,
    templates: IndexMap<String, TemplateEntry>,
}

pub struct Catalog {
    registries: RwLock<Registries>,
    changes: broadcast::Sender<ListChanged>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            registries: RwLock::new(Registries::default()),
            changes,
        }
    }

    /// Receives a [`ListChanged`] event after every committed mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<ListChanged> {
        self.changes.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registries> {
        self.registries.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `mutate` under the registry lock. When it reports a change,
    /// `change` is emitted once the lock has been released.
    fn mutate(&self, change: ListChanged, mutate: impl FnOnce(&mut Registries) -> bool) -> bool {
        let changed = {
            let mut registries: RwLockWriteGuard<'_, Registries> = self
                .registries
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            mutate(&mut registries)
        };

        if changed && self.changes.send(change).is_err() {
            debug!(method = change.method(), "no subscribers for list change");
        }
        changed
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_methods_follow_notification_naming() {
        assert_eq!(
            ListChanged::Tools.method(),
            "notifications/tools/list_changed"
        );
        assert_eq!(
            ListChanged::Resources.method(),
            "notifications/resources/list_changed"
        );
    }

    #[test]
    fn extracts_panic_messages() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");

        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
