//! Error types for shardgen.

use thiserror::Error;

/// Result type alias for shardgen operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shardgen.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid engine or sampling configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Model files could not be resolved or parsed.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// The model ships custom code but `trust_remote_code` is off.
    #[error("model '{0}' declares custom code (auto_map); set trust_remote_code to load it")]
    UntrustedRemoteCode(String),

    /// The model architecture has no implementation here.
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// The model cannot be split evenly across the requested shards.
    #[error("sharding error: {0}")]
    Sharding(String),

    /// A device for some rank could not be opened.
    #[error("device error: {0}")]
    Device(String),

    /// Prompt does not leave room for a single generated token.
    #[error("prompt has {len} tokens but max_model_len is {max_model_len}")]
    PromptTooLong { len: usize, max_model_len: usize },

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
