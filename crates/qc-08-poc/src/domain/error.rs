//! Error types for the Proof-of-Cooperation subsystem

use super::CvnId;
use shared_crypto::{CryptoError, Hash};

/// Proof-of-Cooperation error types
#[derive(Debug, thiserror::Error)]
pub enum PocError {
    #[error("Malformed crypto input: {0}")]
    MalformedCryptoInput(#[from] CryptoError),

    #[error("Invalid chain data: {0}")]
    InvalidChainData(String),

    #[error("Nonce pool exhausted for validator {0:#010x}")]
    NoncePoolExhausted(CvnId),

    #[error("Insufficient signatures: got {got}, required {required}")]
    InsufficientSignatures { got: usize, required: usize },

    #[error("Partial signatures disagree on the aggregate nonce")]
    InconsistentNonceSet,

    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    #[error("Nonce persistence failed: {0}")]
    NoncePersistence(String),

    #[error("Unknown validator: {0:#010x}")]
    UnknownValidator(CvnId),

    #[error("Banned validator: {0:#010x}")]
    BannedValidator(CvnId),

    #[error("Invalid nonce pool from {cvn_id:#010x}: {reason}")]
    InvalidNoncePool { cvn_id: CvnId, reason: String },

    #[error("Invalid partial signature from {0:#010x}")]
    InvalidPartialSignature(CvnId),

    #[error("Invalid block {hash:?}: {reason}")]
    InvalidBlock { hash: Hash, reason: String },

    #[error("No eligible block creator")]
    NoCreator,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PocError {
    /// Recoverable errors are retried on the next poll cycle.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PocError::NoncePoolExhausted(_)
                | PocError::InsufficientSignatures { .. }
                | PocError::InconsistentNonceSet
                | PocError::DuplicateEntry(_)
                | PocError::NoCreator
                | PocError::Network(_)
        )
    }

    /// Fatal errors stop the production loop.
    ///
    /// A nonce pool that cannot be made durable must never be published or
    /// signed with, otherwise a restart could reuse a secret nonce.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PocError::NoncePersistence(_) | PocError::InvalidConfig(_))
    }

    /// Rejections of peer input; the offending message is dropped.
    pub fn is_rejection(&self) -> bool {
        !self.is_recoverable() && !self.is_fatal()
    }
}

/// Result type for Proof-of-Cooperation operations
pub type PocResult<T> = Result<T, PocError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(PocError::NoncePoolExhausted(1).is_recoverable());
        assert!(PocError::NoncePersistence("disk full".into()).is_fatal());
        assert!(PocError::UnknownValidator(7).is_rejection());
        assert!(!PocError::NoCreator.is_fatal());
    }

    #[test]
    fn test_crypto_error_conversion() {
        let err: PocError = CryptoError::PointAtInfinity.into();
        assert!(matches!(err, PocError::MalformedCryptoInput(_)));
        assert!(err.is_rejection());
    }
}
