//! Crypto error types.

use thiserror::Error;

/// Cryptographic operation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Scalar is zero or not below the curve order
    #[error("Malformed scalar: {0}")]
    MalformedScalar(&'static str),

    /// Bytes do not encode a valid compressed curve point
    #[error("Malformed point: {0}")]
    MalformedPoint(&'static str),

    /// Point arithmetic produced the point at infinity
    #[error("Point at infinity")]
    PointAtInfinity,

    /// Invalid secret key bytes
    #[error("Invalid secret key")]
    InvalidSecretKey,

    /// Invalid input length
    #[error("Invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        actual: usize,
    },

    /// Partial signatures were not computed against the same aggregate nonce
    #[error("Partial signatures disagree on the aggregate nonce")]
    InconsistentNonce,

    /// Nothing to aggregate
    #[error("No partial signatures to combine")]
    EmptyAggregation,

    /// Signature verification failed
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
}
