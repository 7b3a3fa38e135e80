//! Error types for the llmodel engine.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, LLModelError>;

/// Errors raised by model construction, inference and state handling.
#[derive(Debug, Error)]
pub enum LLModelError {
    /// IO error, carries the OS error code when there is one.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// No implementation recognises the model file.
    #[error("Model format not supported (no matching implementation found): {0}")]
    Unsupported(String),

    /// The file was recognised but its contents are malformed.
    #[error("Invalid model file: {0}")]
    InvalidModel(String),

    /// The requested backend name is not a known implementation.
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// An operation needed a loaded model.
    #[error("Model is not loaded")]
    NotLoaded,

    /// Caller supplied an argument that cannot be used.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The prompt does not fit in the context window.
    #[error("Prompt of {n_tokens} tokens exceeds the context window of {n_ctx}")]
    ContextOverflow { n_tokens: usize, n_ctx: usize },

    /// Generation failed.
    #[error("Prompt failed: {0}")]
    Prompt(String),

    /// Embedding failed.
    #[error("Embedding failed: {0}")]
    Embedding(String),

    /// A state blob could not be applied.
    #[error("State mismatch: {0}")]
    State(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl LLModelError {
    /// Create an invalid-model error.
    pub fn invalid_model(msg: impl Into<String>) -> Self {
        Self::InvalidModel(msg.into())
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a prompt error.
    pub fn prompt(msg: impl Into<String>) -> Self {
        Self::Prompt(msg.into())
    }

    /// Create an embedding error.
    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    /// Create a state error.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The C error code reported for this error.
    ///
    /// System errors keep their OS code, unmatched formats map to `ENOTSUP`
    /// and everything else is an invalid argument.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::Unsupported(_) => libc::ENOTSUP,
            _ => libc::EINVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LLModelError::invalid_model("truncated header");
        assert_eq!(format!("{}", err), "Invalid model file: truncated header");

        let err = LLModelError::ContextOverflow { n_tokens: 40, n_ctx: 32 };
        assert_eq!(
            format!("{}", err),
            "Prompt of 40 tokens exceeds the context window of 32"
        );
    }

    #[test]
    fn test_errno_mapping() {
        let err = LLModelError::from(std::io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(err.errno(), libc::ENOENT);

        let err = LLModelError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(err.errno(), libc::EIO);

        assert_eq!(LLModelError::Unsupported("x".into()).errno(), libc::ENOTSUP);
        assert_eq!(LLModelError::UnknownBackend("metal".into()).errno(), libc::EINVAL);
        assert_eq!(LLModelError::NotLoaded.errno(), libc::EINVAL);
    }
}
