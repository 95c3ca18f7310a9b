//! Error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for alphagate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or running a model.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    /// Two operands of a layer do not line up.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// Layer indices start at 1; `theta` is undefined at 0.
    #[error("layer index must be at least 1, got {0}")]
    InvalidLayerIndex(usize),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to write embedding to {path}: {source}")]
    Sink {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },
}

impl Error {
    pub(crate) fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
