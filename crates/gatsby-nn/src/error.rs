//! Error types for gatsby-nn.

use thiserror::Error;

/// Error type for attention layers and networks.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Graph or block error.
    #[error(transparent)]
    Graph(#[from] gatsby_core::Error),

    /// Dimension mismatch.
    #[error("dimension mismatch in {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Destination nodes without incoming edges while the layer disallows them.
    #[error(
        "{count} destination nodes have zero in-degree; add self loops or allow zero in-degree"
    )]
    ZeroInDegree { count: usize },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
