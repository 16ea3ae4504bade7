//! Error types for vqspeech-core

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed configuration document
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Topology mismatch detected before reaching the tensor layer
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Model load error: {0}")]
    ModelLoadError(String),

    /// Unreadable, incomplete or stale checkpoint bundle
    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    #[error("Data stream error: {0}")]
    DataError(String),

    #[error("Plot error: {0}")]
    PlotError(String),

    /// An optional capability that was not compiled in
    #[error("{0} not installed")]
    FeatureUnavailable(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
