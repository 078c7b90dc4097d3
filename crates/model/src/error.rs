//! Error type shared by the model, checkpoint and generation layers.

use thiserror::Error;

pub type Result<T, E = ModelError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ModelError {
    /// A loaded tensor or metadata field disagrees with the declared config.
    #[error("config mismatch: {0}")]
    ConfigMismatch(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Rejected before generation starts.
    #[error("invalid sampling parameter `{name}`: {message}")]
    InvalidSamplingParameter {
        name: &'static str,
        message: String,
    },

    /// A window outside `1..=block_size` reached the model. Correct windowing
    /// in the generator makes this unreachable.
    #[error("context of {len} tokens does not fit block size {block_size}")]
    ContextOverflow { len: usize, block_size: usize },

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("kernel error: {0}")]
    Kernel(#[from] anyhow::Error),
}

impl ModelError {
    pub fn sampling(name: &'static str, message: impl Into<String>) -> Self {
        ModelError::InvalidSamplingParameter {
            name,
            message: message.into(),
        }
    }

    /// Stable snake_case tag for structured reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            ModelError::ConfigMismatch(_) => "config_mismatch",
            ModelError::InvalidConfig(_) => "invalid_config",
            ModelError::InvalidSamplingParameter { .. } => "invalid_sampling_parameter",
            ModelError::ContextOverflow { .. } => "context_overflow",
            ModelError::InvalidToken(_) => "invalid_token",
            ModelError::Checkpoint(_) => "checkpoint",
            ModelError::Kernel(_) => "kernel",
        }
    }

    /// True for errors caused by caller input rather than a model or load fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ModelError::InvalidSamplingParameter { .. } | ModelError::InvalidToken(_)
        )
    }
}

impl From<std::io::Error> for ModelError {
    fn from(err: std::io::Error) -> Self {
        ModelError::Checkpoint(err.to_string())
    }
}

impl From<safetensors::SafeTensorError> for ModelError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        ModelError::Checkpoint(err.to_string())
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Checkpoint(err.to_string())
    }
}
