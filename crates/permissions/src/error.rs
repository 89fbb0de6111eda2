//! Permission error types.

use thiserror::Error;

/// Permission errors.
///
/// Every denial is one of these variants; nothing is reported as a soft
/// failure. This enum is marked `#[non_exhaustive]` to allow adding new
/// variants without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Unknown or excluded permission target.
    #[error("{}", not_found_message(.target, .reason.as_deref()))]
    NotFound {
        target: String,
        reason: Option<String>,
    },

    /// A name or grant that must be unique already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Capability-scope violation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The subject holds no active grant for the target.
    #[error("unauthorized: '{subject}' has no permission for '{target}'")]
    Unauthorized { subject: String, target: String },

    /// Caveat type not allowed for the target, or malformed caveat value.
    #[error("invalid caveat: {0}")]
    InvalidCaveat(String),

    /// A builder's required host hook was not supplied.
    #[error("specification '{target}' requires hook '{hook}'")]
    MissingHook { target: String, hook: String },

    /// The pending approval was rejected.
    #[error("permission request {0} was rejected")]
    Rejected(String),

    /// The pending approval was abandoned because its subject went away.
    #[error("permission request {0} was abandoned")]
    Abandoned(String),

    /// A failure inside a bound method implementation.
    #[error("{0}")]
    Method(String),

    #[error(transparent)]
    Messenger(#[from] messenger::Error),
}

fn not_found_message(target: &str, reason: Option<&str>) -> String {
    match reason {
        Some(reason) => format!("permission target '{target}' is unavailable: {reason}"),
        None => format!("unknown permission target '{target}'"),
    }
}

impl Error {
    pub fn not_found(target: impl Into<String>) -> Self {
        Self::NotFound {
            target: target.into(),
            reason: None,
        }
    }

    pub fn unauthorized(subject: impl Into<String>, target: impl Into<String>) -> Self {
        Self::Unauthorized {
            subject: subject.into(),
            target: target.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
