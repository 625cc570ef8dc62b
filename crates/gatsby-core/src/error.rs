//! Error types for gatsby-core.

use thiserror::Error;

/// Error type for graph store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An edge or index referenced a node that does not exist.
    #[error("node {node} out of range for graph with {num_nodes} nodes")]
    NodeOutOfRange { node: usize, num_nodes: usize },

    /// Feature buffer does not match its declared shape.
    #[error("feature shape mismatch: expected {expected} values, got {got}")]
    FeatureShape { expected: usize, got: usize },

    /// Row count of a per-node or per-edge buffer is wrong.
    #[error("{what}: expected {expected} rows, got {got}")]
    RowCount {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// Graph violates a structural invariant.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// Sampler or loader misconfiguration.
    #[error("invalid sampler config: {0}")]
    InvalidSampler(String),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary (bincode) error.
    #[error("binary format error: {0}")]
    Binary(#[from] bincode::Error),
}

/// Result type for graph store operations.
pub type Result<T> = std::result::Result<T, Error>;
