//! Error types for graph memory operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GcmError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid hidden state: {0}")]
    InvalidHiddenState(String),

    #[error("Non-finite belief vector after graph propagation; check that the GNN ends in a bounded activation such as tanh")]
    NonFiniteBelief,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),
}
