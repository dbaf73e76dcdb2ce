//! Error types for specification handling.

use thiserror::Error;

/// Errors raised while decoding or interpreting a VM specification.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("invalid size {0:?}")]
    InvalidSize(String),

    #[error("unknown vm type {0:?}")]
    UnknownVmType(String),

    #[error("spec decode error: {0}")]
    Decode(#[from] serde_json::Error),
}
