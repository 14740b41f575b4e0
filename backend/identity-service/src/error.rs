use thiserror::Error;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, IdentityError>;

pub const DEFAULT_BAD_REQUEST: &str = "Invalid request. Please check the input and try again.";
pub const DEFAULT_NOT_FOUND: &str = "The requested item could not be found.";
pub const DEFAULT_INTERNAL: &str = "An error occurred. Please try again later.";

/// Outcome of a failed identity operation
///
/// Every variant carries the message shown to the caller. Internal details
/// are logged at the failure site and never placed in `Internal`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl IdentityError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        IdentityError::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        IdentityError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        IdentityError::Conflict(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        IdentityError::Internal(message.into())
    }

    /// HTTP-style status code analog
    pub fn status_code(&self) -> u16 {
        match self {
            IdentityError::BadRequest(_) => 400,
            IdentityError::NotFound(_) => 404,
            IdentityError::Conflict(_) => 409,
            IdentityError::Internal(_) => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            IdentityError::BadRequest(msg)
            | IdentityError::NotFound(msg)
            | IdentityError::Conflict(msg)
            | IdentityError::Internal(msg) => msg,
        }
    }
}

// Storage failures never leak their detail to the caller
impl From<StoreError> for IdentityError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "Credential store error");
        IdentityError::Internal(DEFAULT_INTERNAL.to_string())
    }
}
