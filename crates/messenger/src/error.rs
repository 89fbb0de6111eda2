//! Messenger error types.

use thiserror::Error;

/// Messenger errors.
///
/// Action handlers return this same type, so a handler's own error reaches
/// the caller of [`Messenger::call`](crate::Messenger::call) unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// No action, event or namespace with this name is reachable.
    #[error("not found: {0}")]
    NotFound(String),

    /// A handler or namespace with this name already exists.
    #[error("already registered: {0}")]
    Conflict(String),

    /// The name exists outside the caller's capability scope.
    #[error("'{name}' is not visible to messenger '{namespace}'")]
    Forbidden { name: String, namespace: String },

    /// The name is not of the form `Namespace:name`.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// A handler was registered while a call into the same messenger was
    /// running on this thread.
    #[error("cannot register '{0}' while a call into this messenger is in flight")]
    Reentrant(String),

    /// A failure reported by an action handler.
    #[error("{0}")]
    Handler(String),
}

impl Error {
    /// Convenience constructor for handler-authored failures.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
