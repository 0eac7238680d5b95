//! # Multi-party Schnorr Signatures (secp256k1)
//!
//! Signatures are `(R, s)` with `R` the compressed aggregate nonce and `s`
//! a scalar. For a set of signers with keys `P_i = x_i·G` and one-time
//! nonces `R_i = k_i·G`:
//!
//! ```text
//! R = Σ R_i            P = Σ P_i
//! e = H(R || P || m)
//! s_i = k_i + e·x_i    (partial)
//! s   = Σ s_i          (final, verifies as s·G == R + e·P)
//! ```
//!
//! A partial signature carries the full aggregate nonce `R`, so every
//! partial of one signing round shares the same `R`. Combining partials that
//! disagree on `R` is rejected.
//!
//! ## Security Properties
//!
//! - A secret nonce must never sign twice. Callers own that invariant; this
//!   module only does the math.
//! - Scalars are parsed strictly: values `>= n` are rejected, never reduced.
//! - Single-signer signatures derive the nonce from the secret key and the
//!   message, so signing the same message twice reuses nothing unsafe.

use crate::hashing::tagged_hash;
use crate::CryptoError;
use k256::elliptic_curve::{bigint::U256, ops::Reduce, sec1::ToEncodedPoint, Field, PrimeField};
use k256::{FieldBytes, ProjectivePoint, PublicKey, Scalar};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Compressed point length.
pub const POINT_LENGTH: usize = 33;

/// Scalar length.
pub const SCALAR_LENGTH: usize = 32;

/// Encoded signature length (`R || s`).
pub const SIGNATURE_LENGTH: usize = POINT_LENGTH + SCALAR_LENGTH;

const CHALLENGE_TAG: &[u8] = b"qc/poc/challenge";
const NONCE_TAG: &[u8] = b"qc/poc/nonce";

fn parse_scalar(bytes: &[u8; SCALAR_LENGTH]) -> Result<Scalar, CryptoError> {
    Option::<Scalar>::from(Scalar::from_repr(FieldBytes::clone_from_slice(bytes)))
        .ok_or(CryptoError::MalformedScalar("not below curve order"))
}

fn parse_nonzero_scalar(bytes: &[u8; SCALAR_LENGTH]) -> Result<Scalar, CryptoError> {
    let scalar = parse_scalar(bytes)?;
    if bool::from(scalar.is_zero()) {
        return Err(CryptoError::MalformedScalar("zero"));
    }
    Ok(scalar)
}

fn scalar_bytes(scalar: &Scalar) -> [u8; SCALAR_LENGTH] {
    scalar.to_bytes().into()
}

fn decode_point(bytes: &[u8; POINT_LENGTH]) -> Result<ProjectivePoint, CryptoError> {
    PublicKey::from_sec1_bytes(bytes)
        .map(|pk| pk.to_projective())
        .map_err(|_| CryptoError::MalformedPoint("not a compressed secp256k1 point"))
}

fn encode_point(point: &ProjectivePoint) -> Result<[u8; POINT_LENGTH], CryptoError> {
    if *point == ProjectivePoint::IDENTITY {
        return Err(CryptoError::PointAtInfinity);
    }
    let encoded = point.to_affine().to_encoded_point(true);
    let mut out = [0u8; POINT_LENGTH];
    out.copy_from_slice(encoded.as_bytes());
    Ok(out)
}

fn challenge(nonce: &[u8; POINT_LENGTH], key: &[u8; POINT_LENGTH], message: &[u8; 32]) -> Scalar {
    let digest = tagged_hash(CHALLENGE_TAG, &[nonce, key, message]);
    <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(digest))
}

macro_rules! point_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[serde_as]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(#[serde_as(as = "Bytes")] [u8; POINT_LENGTH]);

        impl $name {
            /// Create from compressed bytes, validating the point.
            pub fn from_bytes(bytes: [u8; POINT_LENGTH]) -> Result<Self, CryptoError> {
                decode_point(&bytes)?;
                Ok(Self(bytes))
            }

            /// Create from a slice of compressed bytes.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
                let array: [u8; POINT_LENGTH] =
                    bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                        expected: POINT_LENGTH,
                        actual: bytes.len(),
                    })?;
                Self::from_bytes(array)
            }

            /// Raw compressed bytes.
            pub fn as_bytes(&self) -> &[u8; POINT_LENGTH] {
                &self.0
            }

            /// Sum of points.
            ///
            /// Fails on an empty input or when the sum is the point at infinity.
            pub fn sum<'a, I>(items: I) -> Result<Self, CryptoError>
            where
                I: IntoIterator<Item = &'a Self>,
            {
                let mut acc = ProjectivePoint::IDENTITY;
                for item in items {
                    acc += item.to_point()?;
                }
                Ok(Self(encode_point(&acc)?))
            }

            fn to_point(&self) -> Result<ProjectivePoint, CryptoError> {
                decode_point(&self.0)
            }
        }
    };
}

point_type!(
    /// Compressed Schnorr public key (33 bytes).
    SchnorrPublicKey
);

point_type!(
    /// Compressed public half of a one-time nonce (33 bytes).
    PublicNonce
);

/// Schnorr secret key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    scalar: Scalar,
}

impl SecretKey {
    /// Generate a random key.
    pub fn generate() -> Self {
        Self {
            scalar: Scalar::random(&mut rand::thread_rng()),
        }
    }

    /// Create from secret bytes (32 bytes, non-zero, below curve order).
    pub fn from_bytes(bytes: [u8; SCALAR_LENGTH]) -> Result<Self, CryptoError> {
        let scalar = parse_nonzero_scalar(&bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self { scalar })
    }

    /// Secret bytes (for key storage).
    pub fn to_bytes(&self) -> [u8; SCALAR_LENGTH] {
        scalar_bytes(&self.scalar)
    }

    /// Derive the public key.
    pub fn public_key(&self) -> SchnorrPublicKey {
        // x is non-zero so x·G is never the identity
        let point = ProjectivePoint::GENERATOR * self.scalar;
        let bytes = encode_point(&point).unwrap_or([0u8; POINT_LENGTH]);
        SchnorrPublicKey(bytes)
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Secret half of a one-time nonce.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretNonce {
    scalar: Scalar,
}

impl SecretNonce {
    /// Create from secret bytes.
    pub fn from_bytes(bytes: [u8; SCALAR_LENGTH]) -> Result<Self, CryptoError> {
        Ok(Self {
            scalar: parse_nonzero_scalar(&bytes)?,
        })
    }

    /// Secret bytes (for the local nonce file).
    pub fn to_bytes(&self) -> [u8; SCALAR_LENGTH] {
        scalar_bytes(&self.scalar)
    }

    /// Public half `k·G`.
    pub fn public_nonce(&self) -> PublicNonce {
        let point = ProjectivePoint::GENERATOR * self.scalar;
        PublicNonce(encode_point(&point).unwrap_or([0u8; POINT_LENGTH]))
    }
}

impl std::fmt::Debug for SecretNonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretNonce(..)")
    }
}

/// Generate a fresh one-time nonce pair.
pub fn generate_nonce_pair() -> (SecretNonce, PublicNonce) {
    let mut rng = rand::thread_rng();
    loop {
        let scalar = Scalar::random(&mut rng);
        if !bool::from(scalar.is_zero()) {
            let secret = SecretNonce { scalar };
            let public = secret.public_nonce();
            return (secret, public);
        }
    }
}

/// Schnorr signature `(R, s)`. Used for partial and final signatures alike.
#[serde_as]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchnorrSignature {
    #[serde_as(as = "Bytes")]
    nonce: [u8; POINT_LENGTH],
    s: [u8; SCALAR_LENGTH],
}

impl SchnorrSignature {
    /// Build from parts without validation; see [`SchnorrSignature::validate`].
    pub fn from_parts(nonce: [u8; POINT_LENGTH], s: [u8; SCALAR_LENGTH]) -> Self {
        Self { nonce, s }
    }

    /// Decode from `R || s`, rejecting malformed components.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SIGNATURE_LENGTH {
            return Err(CryptoError::InvalidLength {
                expected: SIGNATURE_LENGTH,
                actual: bytes.len(),
            });
        }
        let mut nonce = [0u8; POINT_LENGTH];
        let mut s = [0u8; SCALAR_LENGTH];
        nonce.copy_from_slice(&bytes[..POINT_LENGTH]);
        s.copy_from_slice(&bytes[POINT_LENGTH..]);
        let sig = Self { nonce, s };
        sig.validate()?;
        Ok(sig)
    }

    /// Encode as `R || s`.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        let mut out = [0u8; SIGNATURE_LENGTH];
        out[..POINT_LENGTH].copy_from_slice(&self.nonce);
        out[POINT_LENGTH..].copy_from_slice(&self.s);
        out
    }

    /// Aggregate nonce `R` bytes.
    pub fn nonce_bytes(&self) -> &[u8; POINT_LENGTH] {
        &self.nonce
    }

    /// Scalar `s` bytes.
    pub fn s_bytes(&self) -> &[u8; SCALAR_LENGTH] {
        &self.s
    }

    /// Check `R` is a valid point and `s` is below the curve order.
    pub fn validate(&self) -> Result<(), CryptoError> {
        decode_point(&self.nonce)?;
        parse_scalar(&self.s)?;
        Ok(())
    }

    fn components(&self) -> Result<(ProjectivePoint, Scalar), CryptoError> {
        Ok((decode_point(&self.nonce)?, parse_scalar(&self.s)?))
    }
}

/// Produce one signer's partial signature.
///
/// `others_nonce_sum` is the sum of the public nonces of every other
/// participating signer (`None` when signing alone). `aggregate_key` is the
/// sum of all participating public keys, this signer's included.
pub fn sign_partial(
    secret_key: &SecretKey,
    secret_nonce: &SecretNonce,
    others_nonce_sum: Option<&PublicNonce>,
    aggregate_key: &SchnorrPublicKey,
    message: &[u8; 32],
) -> Result<SchnorrSignature, CryptoError> {
    let mut nonce_point = ProjectivePoint::GENERATOR * secret_nonce.scalar;
    if let Some(others) = others_nonce_sum {
        nonce_point += others.to_point()?;
    }
    let nonce = encode_point(&nonce_point)?;
    let e = challenge(&nonce, aggregate_key.as_bytes(), message);
    let s = secret_nonce.scalar + e * secret_key.scalar;
    Ok(SchnorrSignature {
        nonce,
        s: scalar_bytes(&s),
    })
}

/// Verify one signer's partial signature.
///
/// Recovers the signer's own nonce as `R - others_nonce_sum` and checks
/// `s_i·G == R_i + e·P_i`. Malformed inputs verify as `false`.
pub fn verify_partial(
    partial: &SchnorrSignature,
    message: &[u8; 32],
    signer_key: &SchnorrPublicKey,
    others_nonce_sum: Option<&PublicNonce>,
    aggregate_key: &SchnorrPublicKey,
) -> bool {
    let check = || -> Result<bool, CryptoError> {
        let (nonce_point, s) = partial.components()?;
        let mut own_nonce = nonce_point;
        if let Some(others) = others_nonce_sum {
            own_nonce -= others.to_point()?;
        }
        let e = challenge(&partial.nonce, aggregate_key.as_bytes(), message);
        let lhs = ProjectivePoint::GENERATOR * s;
        let rhs = own_nonce + signer_key.to_point()? * e;
        Ok(lhs == rhs)
    };
    check().unwrap_or(false)
}

/// Sum partial signatures into the final signature.
///
/// Order does not matter. All partials must carry the same aggregate nonce.
pub fn combine_partials(partials: &[SchnorrSignature]) -> Result<SchnorrSignature, CryptoError> {
    let first = partials.first().ok_or(CryptoError::EmptyAggregation)?;
    let mut s = Scalar::ZERO;
    for partial in partials {
        if partial.nonce != first.nonce {
            return Err(CryptoError::InconsistentNonce);
        }
        s += parse_scalar(&partial.s)?;
    }
    Ok(SchnorrSignature {
        nonce: first.nonce,
        s: scalar_bytes(&s),
    })
}

/// Verify a final (or single-signer) signature against the aggregate key.
pub fn verify(signature: &SchnorrSignature, message: &[u8; 32], aggregate_key: &SchnorrPublicKey) -> bool {
    let check = || -> Result<bool, CryptoError> {
        let (nonce_point, s) = signature.components()?;
        let e = challenge(&signature.nonce, aggregate_key.as_bytes(), message);
        let lhs = ProjectivePoint::GENERATOR * s;
        let rhs = nonce_point + aggregate_key.to_point()? * e;
        Ok(lhs == rhs)
    };
    check().unwrap_or(false)
}

/// Single-signer signature over a 32-byte hash.
///
/// The nonce is derived from the secret key and the message.
pub fn sign_hash(secret_key: &SecretKey, message: &[u8; 32]) -> Result<SchnorrSignature, CryptoError> {
    let mut secret_bytes = secret_key.to_bytes();
    let digest = tagged_hash(NONCE_TAG, &[&secret_bytes, message]);
    secret_bytes.zeroize();
    let k = <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(digest));
    if bool::from(k.is_zero()) {
        return Err(CryptoError::MalformedScalar("derived nonce is zero"));
    }
    let nonce = SecretNonce { scalar: k };
    sign_partial(secret_key, &nonce, None, &secret_key.public_key(), message)
}

/// Verify a single-signer signature.
pub fn verify_hash(signature: &SchnorrSignature, message: &[u8; 32], public_key: &SchnorrPublicKey) -> bool {
    verify(signature, message, public_key)
}
