//! Partial signature collection
//!
//! Partial signatures are grouped into buckets keyed by
//! (tip hash, intended creator, missing-signer set). Only signatures that
//! agree on all three can be combined, since each bucket has its own
//! aggregate key and aggregate nonce.

use super::{
    check_for_duplicate_missing_chain_sigs, round_message, CvnId, CvnSet, PocError, PocResult,
    RoundNonces,
};
use serde::{Deserialize, Serialize};
use shared_crypto::{
    combine_partials, sign_partial, verify_partial, CryptoError, Hash, PublicNonce,
    SchnorrSignature, SecretKey, SecretNonce,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// One validator's partial signature for a production round
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CvnPartialSignature {
    pub prev_block_hash: Hash,
    pub creator_id: CvnId,
    pub signer_id: CvnId,
    /// Validators excluded from this round's aggregate, ascending
    pub missing_signer_ids: Vec<CvnId>,
    pub signature: SchnorrSignature,
}

impl CvnPartialSignature {
    pub fn bucket(&self) -> BucketKey {
        BucketKey {
            prev_block_hash: self.prev_block_hash,
            creator_id: self.creator_id,
            missing: self.missing_signer_ids.clone(),
        }
    }
}

/// Bucket identity
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    pub prev_block_hash: Hash,
    pub creator_id: CvnId,
    pub missing: Vec<CvnId>,
}

impl BucketKey {
    /// Active validators expected to sign into this bucket.
    pub fn signers(&self, active: &[CvnId]) -> Vec<CvnId> {
        active
            .iter()
            .copied()
            .filter(|id| self.missing.binary_search(id).is_err())
            .collect()
    }
}

/// Signing inputs shared by every member of one bucket
pub struct RoundContext<'a> {
    pub prev_block_hash: Hash,
    pub creator_id: CvnId,
    pub missing: &'a [CvnId],
    /// Validators signing the round, ascending
    pub signers: &'a [CvnId],
}

impl RoundContext<'_> {
    pub fn message(&self) -> Hash {
        round_message(&self.prev_block_hash, self.creator_id, self.missing)
    }
}

/// Produce the local validator's partial signature for a round.
pub fn create_partial_signature(
    ctx: &RoundContext<'_>,
    signer_id: CvnId,
    key: &SecretKey,
    nonce: &SecretNonce,
    reserved: &RoundNonces,
    cvns: &CvnSet,
) -> PocResult<CvnPartialSignature> {
    let aggregate_key = cvns.aggregate_key(ctx.signers)?;
    let others = reserved.others_sum(ctx.signers, signer_id)?;
    let signature = sign_partial(key, nonce, others.as_ref(), &aggregate_key, &ctx.message())?;
    Ok(CvnPartialSignature {
        prev_block_hash: ctx.prev_block_hash,
        creator_id: ctx.creator_id,
        signer_id,
        missing_signer_ids: ctx.missing.to_vec(),
        signature,
    })
}

/// Verify a received partial signature against reserved round nonces.
pub fn verify_partial_signature(
    sig: &CvnPartialSignature,
    active: &[CvnId],
    reserved: &RoundNonces,
    cvns: &CvnSet,
) -> PocResult<()> {
    let invalid = || PocError::InvalidPartialSignature(sig.signer_id);
    check_for_duplicate_missing_chain_sigs(&sig.missing_signer_ids).map_err(|_| invalid())?;
    let bucket = sig.bucket();
    let signers = bucket.signers(active);
    if signers.binary_search(&sig.signer_id).is_err() {
        return Err(invalid());
    }
    let ctx = RoundContext {
        prev_block_hash: sig.prev_block_hash,
        creator_id: sig.creator_id,
        missing: &sig.missing_signer_ids,
        signers: &signers,
    };
    let own_nonce = reserved
        .nonces
        .get(&sig.signer_id)
        .ok_or(PocError::NoncePoolExhausted(sig.signer_id))?;
    let others = reserved.others_sum(&signers, sig.signer_id)?;
    let aggregate_key = cvns.aggregate_key(&signers)?;
    let signer_key = cvns.pubkey(sig.signer_id)?;
    if !verify_partial(
        &sig.signature,
        &ctx.message(),
        signer_key,
        others.as_ref(),
        &aggregate_key,
    ) {
        return Err(invalid());
    }
    // R in the partial must be exactly the reserved nonce sum
    let expected = match others {
        Some(others) => PublicNonce::sum([own_nonce, &others])?,
        None => *own_nonce,
    };
    if expected.as_bytes() != sig.signature.nonce_bytes() {
        return Err(PocError::InconsistentNonceSet);
    }
    Ok(())
}

/// Combine a full bucket into the final chain signature.
pub fn combine_bucket(
    partials: &[&CvnPartialSignature],
    required: usize,
) -> PocResult<SchnorrSignature> {
    if partials.len() < required {
        return Err(PocError::InsufficientSignatures {
            got: partials.len(),
            required,
        });
    }
    let sigs: Vec<SchnorrSignature> = partials.iter().map(|p| p.signature).collect();
    combine_partials(&sigs).map_err(|err| match err {
        CryptoError::InconsistentNonce => PocError::InconsistentNonceSet,
        other => PocError::MalformedCryptoInput(other),
    })
}

/// Collected partial signatures, one tree for all open rounds
#[derive(Debug, Default)]
pub struct SignatureTree {
    buckets: BTreeMap<BucketKey, BTreeMap<CvnId, CvnPartialSignature>>,
}

impl SignatureTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert into its bucket; a second signature from the same signer
    /// replaces the first. Returns true when the signer was new.
    pub fn add_sig(&mut self, sig: CvnPartialSignature) -> bool {
        self.buckets
            .entry(sig.bucket())
            .or_default()
            .insert(sig.signer_id, sig)
            .is_none()
    }

    pub fn get_signature_set(
        &self,
        missing: &[CvnId],
        prev_block_hash: &Hash,
        creator_id: CvnId,
    ) -> Option<&BTreeMap<CvnId, CvnPartialSignature>> {
        self.buckets.get(&BucketKey {
            prev_block_hash: *prev_block_hash,
            creator_id,
            missing: missing.to_vec(),
        })
    }

    pub fn get_signature(
        &self,
        missing: &[CvnId],
        prev_block_hash: &Hash,
        creator_id: CvnId,
        signer_id: CvnId,
    ) -> Option<&CvnPartialSignature> {
        self.get_signature_set(missing, prev_block_hash, creator_id)
            .and_then(|set| set.get(&signer_id))
    }

    /// Every signature for (tip, creator), across all missing sets.
    pub fn get_signatures(&self, prev_block_hash: &Hash, creator_id: CvnId) -> Vec<&CvnPartialSignature> {
        self.round_buckets(prev_block_hash, creator_id)
            .flat_map(|(_, set)| set.values())
            .collect()
    }

    /// Per missing set, the expected signers that have not signed yet.
    pub fn get_missing(
        &self,
        prev_block_hash: &Hash,
        creator_id: CvnId,
        active: &[CvnId],
    ) -> BTreeMap<Vec<CvnId>, Vec<CvnId>> {
        self.round_buckets(prev_block_hash, creator_id)
            .map(|(key, set)| {
                let unsigned = key
                    .signers(active)
                    .into_iter()
                    .filter(|id| !set.contains_key(id))
                    .collect();
                (key.missing.clone(), unsigned)
            })
            .collect()
    }

    /// A bucket for (tip, creator) where every expected signer has signed
    /// and at least `required` signatures exist. Prefers the bucket with the
    /// fewest missing validators.
    pub fn complete_bucket(
        &self,
        prev_block_hash: &Hash,
        creator_id: CvnId,
        active: &[CvnId],
        required: usize,
    ) -> Option<(BucketKey, Vec<&CvnPartialSignature>)> {
        self.round_buckets(prev_block_hash, creator_id)
            .filter(|(key, set)| {
                set.len() >= required && key.signers(active).iter().all(|id| set.contains_key(id))
            })
            .min_by(|(a, _), (b, _)| a.missing.len().cmp(&b.missing.len()).then(a.missing.cmp(&b.missing)))
            .map(|(key, set)| (key.clone(), set.values().collect()))
    }

    /// Purge every bucket of one round.
    pub fn remove_round(&mut self, prev_block_hash: &Hash, creator_id: CvnId) {
        self.buckets
            .retain(|key, _| !(key.prev_block_hash == *prev_block_hash && key.creator_id == creator_id));
    }

    /// Purge every bucket not built on `tip`.
    pub fn retain_tip(&mut self, tip: &Hash) {
        self.buckets.retain(|key, _| key.prev_block_hash == *tip);
    }

    /// Drop every bucket. The poll loop purges through [`Self::retain_tip`]
    /// and [`Self::remove_round`] instead.
    pub fn set_null(&mut self) {
        self.buckets.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn signer_ids(&self) -> BTreeSet<CvnId> {
        self.buckets.values().flat_map(|set| set.keys().copied()).collect()
    }

    fn round_buckets(
        &self,
        prev_block_hash: &Hash,
        creator_id: CvnId,
    ) -> impl Iterator<Item = (&BucketKey, &BTreeMap<CvnId, CvnPartialSignature>)> + '_ {
        let tip = *prev_block_hash;
        self.buckets
            .iter()
            .filter(move |(key, _)| key.prev_block_hash == tip && key.creator_id == creator_id)
    }
}

/// Partial signatures received before their round was reserved.
///
/// Each signer holds at most `per_signer` entries. A full slot first evicts
/// its oldest entry built on another tip than the current one.
#[derive(Debug)]
pub struct PartialBuffer {
    per_signer: usize,
    slots: BTreeMap<CvnId, VecDeque<BufferedPartial>>,
}

#[derive(Debug)]
struct BufferedPartial {
    sig: CvnPartialSignature,
    /// Local tip height when received
    seen_at: u64,
}

impl PartialBuffer {
    pub fn new(per_signer: usize) -> Self {
        Self {
            per_signer,
            slots: BTreeMap::new(),
        }
    }

    /// Returns false when `sig` is already buffered or nothing may be kept.
    pub fn push(&mut self, sig: CvnPartialSignature, seen_at: u64, current_tip: Option<&Hash>) -> bool {
        if self.per_signer == 0 {
            return false;
        }
        let slot = self.slots.entry(sig.signer_id).or_default();
        if slot.iter().any(|entry| entry.sig == sig) {
            return false;
        }
        if slot.len() >= self.per_signer {
            let victim = slot
                .iter()
                .position(|entry| Some(&entry.sig.prev_block_hash) != current_tip)
                .unwrap_or(0);
            slot.remove(victim);
        }
        slot.push_back(BufferedPartial { sig, seen_at });
        true
    }

    /// Remove and return every entry of one round.
    pub fn take_round(&mut self, prev_block_hash: &Hash, creator_id: CvnId) -> Vec<CvnPartialSignature> {
        let mut taken = Vec::new();
        for slot in self.slots.values_mut() {
            let (round, rest): (VecDeque<_>, VecDeque<_>) = slot.drain(..).partition(|entry| {
                entry.sig.prev_block_hash == *prev_block_hash && entry.sig.creator_id == creator_id
            });
            *slot = rest;
            taken.extend(round.into_iter().map(|entry| entry.sig));
        }
        self.slots.retain(|_, slot| !slot.is_empty());
        taken
    }

    /// Keep the entries for which `keep(sig, seen_at)` holds.
    pub fn retain(&mut self, mut keep: impl FnMut(&CvnPartialSignature, u64) -> bool) {
        for slot in self.slots.values_mut() {
            slot.retain(|entry| keep(&entry.sig, entry.seen_at));
        }
        self.slots.retain(|_, slot| !slot.is_empty());
    }

    pub fn len(&self) -> usize {
        self.slots.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
