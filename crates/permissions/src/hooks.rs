//! Host hooks consumed by specification builders.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use messenger::Messenger;
use serde_json::Value;

use crate::{Error, Result};

/// A host capability a method implementation may call.
pub type Hook = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Hook name to callable, supplied by the embedding application at boot.
///
/// The registry only ever reads from the table.
#[derive(Clone, Default)]
pub struct HookTable {
    hooks: HashMap<String, Hook>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook backed by a plain function.
    pub fn with<F>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.hooks.insert(name.into(), Arc::new(hook));
        self
    }

    /// Add a hook that forwards to a messenger action.
    ///
    /// Messenger failures, including `Forbidden` for an action outside the
    /// messenger's scope, surface from the hook as [`Error::Messenger`].
    pub fn bind_action(
        self,
        name: impl Into<String>,
        messenger: &Messenger,
        action: impl Into<String>,
    ) -> Self {
        let messenger = messenger.clone();
        let action = action.into();
        self.with(name, move |params| Ok(messenger.call(&action, params)?))
    }

    pub fn get(&self, name: &str) -> Option<&Hook> {
        self.hooks.get(name)
    }

    /// Look up a hook `target` declared as required.
    pub fn require(&self, target: &str, name: &str) -> Result<Hook> {
        self.hooks.get(name).cloned().ok_or_else(|| Error::MissingHook {
            target: target.to_string(),
            hook: name.to_string(),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hooks.keys().map(String::as_str)
    }
}

impl fmt::Debug for HookTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("HookTable").field("hooks", &names).finish()
    }
}

/// A typed set of hooks selected from a [`HookTable`].
///
/// Each specification builder names its own implementation; selection is
/// total, so a builder either gets every hook it declares or fails.
pub trait SelectHooks: Sized {
    fn select(target: &str, table: &HookTable) -> Result<Self>;
}

impl SelectHooks for () {
    fn select(_target: &str, _table: &HookTable) -> Result<Self> {
        Ok(())
    }
}
