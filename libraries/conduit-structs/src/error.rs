use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure the broker and its clients distinguish between.
///
/// At the HTTP boundary all variants collapse to a 400 with the `Display`
/// text in an [`ApiError`] body; the variant itself only matters in-process.
///
/// [`ApiError`]: crate::api::ApiError
#[derive(Debug, Clone, Error)]
pub enum ConduitError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("name '{0}' is already used by {1}")]
    NameCollision(String, &'static str),
    #[error("not allowed to {0}")]
    Unauthorized(&'static str),
    #[error("signature is invalid")]
    SignatureInvalid,
    #[error("content hash mismatch: {expected} != {computed}")]
    Integrity { expected: String, computed: String },
    #[error("timed out")]
    Timeout,
    #[error("storage error: {0}")]
    Io(String),
    #[error("could not parse request")]
    Parse,
}

impl ConduitError {
    /// Wrap a storage or filesystem failure, keeping only its message.
    pub fn io(err: impl std::fmt::Display) -> Self {
        ConduitError::Io(err.to_string())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ConduitError::NotFound(what.into())
    }
}

/// The uniform HTTP 400 body.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ApiError {
    pub error: String,
}

impl From<&ConduitError> for ApiError {
    fn from(err: &ConduitError) -> Self {
        ApiError {
            error: err.to_string(),
        }
    }
}
