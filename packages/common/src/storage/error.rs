use thiserror::Error;

/// Errors that can occur during blob storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested blob was not found.
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided content hash is invalid.
    #[error("invalid content hash: {0}")]
    InvalidHash(String),

    /// The blob exceeds the configured size limit.
    #[error("blob exceeds size limit ({actual} > {limit} bytes)")]
    SizeLimitExceeded { actual: u64, limit: u64 },

    /// The remote object store rejected or failed the request.
    #[error("object store error: {0}")]
    Backend(String),
}

impl StorageError {
    /// True when the failure is on the storage side rather than caused by the input.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Backend(_))
    }
}
