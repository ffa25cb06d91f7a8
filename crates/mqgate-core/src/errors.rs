//! Core error types.

use thiserror::Error;

/// Errors raised while encoding or decoding shared wire types.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Binary encoding of an envelope, result or session failed.
    #[error("failed to encode {what}: {source}")]
    Encode {
        /// Which structure was being encoded.
        what: &'static str,
        /// Underlying codec error.
        #[source]
        source: bincode::Error,
    },

    /// Binary decoding of an envelope, result or session failed.
    #[error("failed to decode {what}: {source}")]
    Decode {
        /// Which structure was being decoded.
        what: &'static str,
        /// Underlying codec error.
        #[source]
        source: bincode::Error,
    },

    /// A JSON argument or result could not be (de)serialized.
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// An argument carried a kind the receiver cannot interpret.
    #[error("argument of kind {found:?} where {expected:?} was expected")]
    ArgumentKind {
        /// Kind that was required.
        expected: crate::envelope::ArgKind,
        /// Kind that was present.
        found: crate::envelope::ArgKind,
    },
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
