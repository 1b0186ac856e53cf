use crate::LeaseId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid TTL {ttl}: must be a positive number of seconds")]
    InvalidTtl { ttl: i64 },

    #[error("Lease {id} not found")]
    LeaseNotFound { id: LeaseId },

    #[error("Lease {id} already exists")]
    LeaseExists { id: LeaseId },

    #[error("Key {key:?} not found")]
    KeyNotFound { key: String },

    #[error("Commit log unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::LeaseNotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
