//! Error taxonomy for remote storage access.

/// Failure reported by an [`HdfsAccessor`](crate::accessor::HdfsAccessor).
#[derive(Debug, thiserror::Error)]
pub enum AccessorError {
    #[error("No such file or directory: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Directory not empty: {0}")]
    NotEmpty(String),
    #[error("Remote storage unavailable: {0}")]
    Unavailable(String),
    #[error("Remote exception {exception}: {message}")]
    Remote { exception: String, message: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Malformed response: {0}")]
    Decode(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AccessorError {
    /// Whether retrying the same call may succeed.
    ///
    /// Definite answers from the NameNode (missing path, denied access) are
    /// never retried; transport failures and overload responses are.
    pub fn is_retryable(&self) -> bool {
        match self {
            AccessorError::Unavailable(_) | AccessorError::Io(_) => true,
            AccessorError::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.is_request()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            AccessorError::NotFound(_)
            | AccessorError::PermissionDenied(_)
            | AccessorError::AlreadyExists(_)
            | AccessorError::NotEmpty(_)
            | AccessorError::Remote { .. }
            | AccessorError::Decode(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AccessorError>;
