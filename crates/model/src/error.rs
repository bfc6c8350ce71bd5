//! Error types for the model crate.

use thiserror::Error;

/// Validation failures for model values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Username is empty or would not be usable as a directory name.
    #[error("invalid username: {0:?}")]
    InvalidUsername(String),

    /// Share path escapes the sandbox or contains forbidden characters.
    #[error("invalid share path: {0:?}")]
    InvalidSharePath(String),

    /// Share hash is not a hex string of the generated length.
    #[error("invalid share hash: {0:?}")]
    InvalidShareHash(String),

    /// Stored password hash does not follow the `sha256$salt$digest` layout.
    #[error("malformed password hash")]
    MalformedPasswordHash,

    /// Failed to serialize the registry snapshot.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize the registry snapshot.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

/// Result type alias for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ModelError::Deserialization(err.to_string())
        } else {
            ModelError::Serialization(err.to_string())
        }
    }
}
