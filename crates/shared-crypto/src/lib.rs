//! # Shared Crypto - Proof-of-Cooperation Primitives
//!
//! ## Components
//!
//! | Module | Algorithm | Use Case |
//! |--------|-----------|----------|
//! | `schnorr` | secp256k1 Schnorr, additive aggregation | Partial/aggregate block signatures, admin and creator signatures |
//! | `hashing` | SHA-256d, tagged SHA-256 | Block and message ids, challenge derivation |
//!
//! ## Security Properties
//!
//! - **Strict parsing**: out-of-range scalars and invalid points are errors
//! - **Secret zeroization**: `SecretKey` and `SecretNonce` wipe on drop
//! - **Commutative aggregation**: partials combine in any order

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod errors;
pub mod hashing;
pub mod schnorr;

// Re-exports
pub use errors::CryptoError;
pub use hashing::{sha256d, tagged_hash, Hash, HashWriter};
pub use schnorr::{
    combine_partials, generate_nonce_pair, sign_hash, sign_partial, verify, verify_hash,
    verify_partial, PublicNonce, SchnorrPublicKey, SchnorrSignature, SecretKey, SecretNonce,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
