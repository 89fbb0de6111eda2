use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Permission(#[from] permissions::Error),

    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<messenger::Error> for Error {
    fn from(e: messenger::Error) -> Self {
        Self::Permission(e.into())
    }
}

impl Error {
    /// The permission-layer error, if this is one.
    pub fn as_permission(&self) -> Option<&permissions::Error> {
        match self {
            Self::Permission(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
