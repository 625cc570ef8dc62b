//! Error types for gatsby-train.

use thiserror::Error;

/// Error type for training and search.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Graph store error.
    #[error(transparent)]
    Graph(#[from] gatsby_core::Error),

    /// Model construction or forward error.
    #[error(transparent)]
    Model(#[from] gatsby_nn::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid training configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A hyperparameter assignment is missing, unknown or has the wrong type.
    #[error("bad assignment '{name}': {reason}")]
    Assignment { name: String, reason: String },

    /// The graph lacks something training needs (labels, splits).
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
