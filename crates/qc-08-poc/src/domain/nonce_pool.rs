//! Nonce pools
//!
//! Every validator publishes an ordered pool of one-time public nonces. All
//! nodes consume pool entries in lock step: within a tip, rotation attempt
//! `a` uses the entry at offset `a`; when a new tip connects, the entries
//! used by every attempt on the old tip are dropped from the front. The
//! attempt count of a tip follows from the timestamps of the block that
//! extended it, so every node derives the same offsets from the chain.
//!
//! A pool announced while the tip is at height `h` becomes usable from the
//! first tip above `h`.
//!
//! The local validator's entries carry their secret halves. A secret leaves
//! the pool exactly once, when its round is reserved, and is dropped when
//! the reservation is removed.

use super::{CvnId, CvnSet, PocError, PocResult};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use shared_crypto::{
    generate_nonce_pair, sign_hash, verify_hash, Hash, HashWriter, PublicNonce,
    SchnorrPublicKey, SchnorrSignature, SecretKey, SecretNonce,
};
use std::collections::{BTreeMap, HashSet, VecDeque};

/// Nonce pool announcement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoncePoolMsg {
    pub cvn_id: CvnId,
    /// Tip height when announced
    pub created_height: u64,
    pub public_nonces: Vec<PublicNonce>,
    /// Creator's signature over [`NoncePoolMsg::signing_hash`]
    pub signature: SchnorrSignature,
}

impl NoncePoolMsg {
    pub fn signing_hash_of(cvn_id: CvnId, created_height: u64, nonces: &[PublicNonce]) -> Hash {
        let mut writer = HashWriter::new();
        writer
            .update(b"qc/poc/nonce-pool")
            .update_u32(cvn_id)
            .update_u64(created_height)
            .update_u32(nonces.len() as u32);
        for nonce in nonces {
            writer.update(nonce.as_bytes());
        }
        writer.finalize()
    }

    pub fn signing_hash(&self) -> Hash {
        Self::signing_hash_of(self.cvn_id, self.created_height, &self.public_nonces)
    }

    pub fn new_signed(
        cvn_id: CvnId,
        created_height: u64,
        public_nonces: Vec<PublicNonce>,
        key: &SecretKey,
    ) -> PocResult<Self> {
        let hash = Self::signing_hash_of(cvn_id, created_height, &public_nonces);
        Ok(Self {
            cvn_id,
            created_height,
            public_nonces,
            signature: sign_hash(key, &hash)?,
        })
    }

    pub fn verify(&self, pubkey: &SchnorrPublicKey) -> bool {
        verify_hash(&self.signature, &self.signing_hash(), pubkey)
    }
}

/// Locally persisted nonce pair
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceRecord {
    /// Height of the pool announcement that published this nonce
    pub pool_height: u64,
    pub public: PublicNonce,
    #[serde_as(as = "Bytes")]
    pub secret: [u8; 32],
}

/// Check an announcement against the validator registry and size bounds.
pub fn validate_nonce_pool(
    msg: &NoncePoolMsg,
    cvns: &CvnSet,
    min_size: usize,
    max_size: usize,
) -> PocResult<()> {
    let invalid = |reason: &str| PocError::InvalidNoncePool {
        cvn_id: msg.cvn_id,
        reason: reason.to_string(),
    };
    let pubkey = cvns.pubkey(msg.cvn_id)?;
    if cvns.is_banned(msg.cvn_id) {
        return Err(PocError::BannedValidator(msg.cvn_id));
    }
    let size = msg.public_nonces.len();
    if size < min_size || size > max_size {
        return Err(invalid(&format!(
            "size {size} outside [{min_size}, {max_size}]"
        )));
    }
    let mut seen = HashSet::with_capacity(size);
    if !msg.public_nonces.iter().all(|n| seen.insert(*n)) {
        return Err(invalid("repeated nonce"));
    }
    if !msg.verify(pubkey) {
        return Err(invalid("bad signature"));
    }
    Ok(())
}

/// Fresh local pool: the signed announcement plus the records to persist.
///
/// Nothing is installed or published here; callers persist the records
/// first.
pub fn create_nonce_pool(
    cvn_id: CvnId,
    created_height: u64,
    size: usize,
    key: &SecretKey,
) -> PocResult<(NoncePoolMsg, Vec<NonceRecord>)> {
    let mut publics = Vec::with_capacity(size);
    let mut records = Vec::with_capacity(size);
    for _ in 0..size {
        let (secret, public) = generate_nonce_pair();
        publics.push(public);
        records.push(NonceRecord {
            pool_height: created_height,
            public,
            secret: secret.to_bytes(),
        });
    }
    let msg = NoncePoolMsg::new_signed(cvn_id, created_height, publics, key)?;
    Ok((msg, records))
}

/// First tip height at which a pool announced at `created_height` is used.
///
/// Pools announced on genesis are used right away, since no earlier tip
/// exists to spend them on.
pub fn activation_height(created_height: u64) -> u64 {
    if created_height == 0 {
        0
    } else {
        created_height + 1
    }
}

struct PoolEntry {
    public: PublicNonce,
    secret: Option<SecretNonce>,
}

struct NoncePool {
    created_height: u64,
    entries: VecDeque<PoolEntry>,
}

impl NoncePool {
    fn from_publics(created_height: u64, publics: &[PublicNonce]) -> Self {
        Self {
            created_height,
            entries: publics
                .iter()
                .map(|public| PoolEntry {
                    public: *public,
                    secret: None,
                })
                .collect(),
        }
    }

    fn same_nonces(&self, publics: &[PublicNonce]) -> bool {
        self.entries.len() == publics.len()
            && self.entries.iter().zip(publics).all(|(e, p)| e.public == *p)
    }

    fn drop_front(&mut self, count: u64) {
        let count = usize::try_from(count).unwrap_or(usize::MAX).min(self.entries.len());
        self.entries.drain(..count);
    }
}

#[derive(Default)]
struct PoolSlot {
    active: Option<NoncePool>,
    pending: Option<NoncePool>,
}

/// Public nonces reserved for one rotation attempt on one tip
#[derive(Default)]
pub struct RoundNonces {
    pub nonces: BTreeMap<CvnId, PublicNonce>,
    local_secret: Option<SecretNonce>,
}

impl RoundNonces {
    /// Sum of the reserved nonces of `signers` other than `exclude`.
    ///
    /// `Ok(None)` when no other signer remains.
    pub fn others_sum(&self, signers: &[CvnId], exclude: CvnId) -> PocResult<Option<PublicNonce>> {
        let mut others = Vec::with_capacity(signers.len());
        for id in signers.iter().filter(|id| **id != exclude) {
            others.push(self.nonces.get(id).ok_or(PocError::NoncePoolExhausted(*id))?);
        }
        if others.is_empty() {
            return Ok(None);
        }
        Ok(Some(PublicNonce::sum(others)?))
    }
}

/// All known nonce pools plus round reservations
pub struct NoncePoolRegistry {
    local_id: CvnId,
    slots: BTreeMap<CvnId, PoolSlot>,
    reservations: BTreeMap<(Hash, u64), RoundNonces>,
    tip: Option<(Hash, u64)>,
}

impl NoncePoolRegistry {
    pub fn new(local_id: CvnId) -> Self {
        Self {
            local_id,
            slots: BTreeMap::new(),
            reservations: BTreeMap::new(),
            tip: None,
        }
    }

    pub fn local_id(&self) -> CvnId {
        self.local_id
    }

    pub fn tip_height(&self) -> Option<u64> {
        self.tip.map(|(_, height)| height)
    }

    /// Install a validated remote announcement.
    ///
    /// `consumed` is the number of entries the rest of the network has
    /// already used when the pool became usable before the current tip.
    /// Returns false when the same pool is already installed.
    pub fn install(&mut self, msg: &NoncePoolMsg, consumed: u64) -> PocResult<bool> {
        self.install_pool(
            msg.cvn_id,
            NoncePool::from_publics(msg.created_height, &msg.public_nonces),
            consumed,
            &msg.public_nonces,
        )
    }

    /// Install the local validator's own pool with its secret halves.
    pub fn install_local(&mut self, msg: &NoncePoolMsg, secrets: Vec<SecretNonce>) -> PocResult<bool> {
        if msg.cvn_id != self.local_id || secrets.len() != msg.public_nonces.len() {
            return Err(PocError::InvalidNoncePool {
                cvn_id: msg.cvn_id,
                reason: "local pool does not match its secrets".into(),
            });
        }
        let mut entries = VecDeque::with_capacity(secrets.len());
        for (public, secret) in msg.public_nonces.iter().zip(secrets) {
            if secret.public_nonce() != *public {
                return Err(PocError::InvalidNoncePool {
                    cvn_id: msg.cvn_id,
                    reason: "secret does not match public nonce".into(),
                });
            }
            entries.push_back(PoolEntry {
                public: *public,
                secret: Some(secret),
            });
        }
        let pool = NoncePool {
            created_height: msg.created_height,
            entries,
        };
        self.install_pool(msg.cvn_id, pool, 0, &msg.public_nonces)
    }

    fn install_pool(
        &mut self,
        cvn_id: CvnId,
        mut pool: NoncePool,
        consumed: u64,
        publics: &[PublicNonce],
    ) -> PocResult<bool> {
        let tip_height = self.tip_height();
        let slot = self.slots.entry(cvn_id).or_default();
        let existing = slot.active.iter().chain(slot.pending.iter());
        if existing
            .clone()
            .any(|p| p.created_height == pool.created_height && p.same_nonces(publics))
        {
            return Ok(false);
        }
        if existing.clone().any(|p| p.created_height > pool.created_height) {
            return Err(PocError::InvalidNoncePool {
                cvn_id,
                reason: format!("stale pool from height {}", pool.created_height),
            });
        }
        match tip_height {
            Some(height) if activation_height(pool.created_height) <= height => {
                pool.drop_front(consumed);
                slot.active = Some(pool);
                slot.pending = None;
            }
            _ => slot.pending = Some(pool),
        }
        Ok(true)
    }

    /// Move to a new tip.
    ///
    /// `attempts_on_prev` entries are dropped from every active pool (zero on
    /// the first tip). Pending pools whose activation height is reached
    /// become active, skipping `fast_forward(created_height)` entries.
    pub fn advance_tip(
        &mut self,
        tip_hash: Hash,
        height: u64,
        attempts_on_prev: u64,
        fast_forward: impl Fn(u64) -> u64,
    ) {
        let had_tip = self.tip.is_some();
        for slot in self.slots.values_mut() {
            if had_tip {
                if let Some(active) = slot.active.as_mut() {
                    active.drop_front(attempts_on_prev);
                }
            }
            if slot
                .pending
                .as_ref()
                .is_some_and(|p| activation_height(p.created_height) <= height)
            {
                if let Some(mut pool) = slot.pending.take() {
                    pool.drop_front(fast_forward(pool.created_height));
                    slot.active = Some(pool);
                }
            }
        }
        self.reservations.retain(|(tip, _), _| *tip == tip_hash);
        self.tip = Some((tip_hash, height));
    }

    /// Remove and return the front entry of a validator's active pool.
    /// Tip changes consume in bulk through [`Self::advance_tip`].
    pub fn consume_nonce(&mut self, cvn_id: CvnId) -> PocResult<PublicNonce> {
        self.slots
            .get_mut(&cvn_id)
            .and_then(|slot| slot.active.as_mut())
            .and_then(|pool| pool.entries.pop_front())
            .map(|entry| entry.public)
            .ok_or(PocError::NoncePoolExhausted(cvn_id))
    }

    /// Reserve the nonces of `validators` for `attempt` on the current tip.
    ///
    /// Idempotent per (tip, attempt). Validators without an entry at the
    /// attempt offset are left out of the reservation.
    pub fn reserve_round(&mut self, attempt: u64, validators: &[CvnId]) -> Option<&RoundNonces> {
        let (tip_hash, _) = self.tip?;
        let key = (tip_hash, attempt);
        if !self.reservations.contains_key(&key) {
            let offset = usize::try_from(attempt).unwrap_or(usize::MAX);
            let mut round = RoundNonces::default();
            for id in validators {
                let entry = self
                    .slots
                    .get_mut(id)
                    .and_then(|slot| slot.active.as_mut())
                    .and_then(|pool| pool.entries.get_mut(offset));
                if let Some(entry) = entry {
                    round.nonces.insert(*id, entry.public);
                    if *id == self.local_id {
                        round.local_secret = entry.secret.take();
                    }
                }
            }
            self.reservations.insert(key, round);
        }
        self.reservations.get(&key)
    }

    pub fn reservation(&self, tip_hash: &Hash, attempt: u64) -> Option<&RoundNonces> {
        self.reservations.get(&(*tip_hash, attempt))
    }

    /// Take the local secret nonce of a reserved round. Yields it once.
    pub fn take_local_secret(&mut self, tip_hash: &Hash, attempt: u64) -> Option<SecretNonce> {
        self.reservations
            .get_mut(&(*tip_hash, attempt))
            .and_then(|round| round.local_secret.take())
    }

    /// Drop every reservation made against `prev_hash`. The poll loop
    /// drops them through [`Self::advance_tip`] and [`Self::remove_round`].
    pub fn remove(&mut self, prev_hash: &Hash) {
        self.reservations.retain(|(tip, _), _| tip != prev_hash);
    }

    pub fn remove_round(&mut self, tip_hash: &Hash, attempt: u64) {
        self.reservations.remove(&(*tip_hash, attempt));
    }

    pub fn has_pool(&self, cvn_id: CvnId) -> bool {
        self.slots
            .get(&cvn_id)
            .is_some_and(|slot| slot.active.is_some() || slot.pending.is_some())
    }

    /// Entries left in the active pool.
    pub fn remaining(&self, cvn_id: CvnId) -> usize {
        self.slots
            .get(&cvn_id)
            .and_then(|slot| slot.active.as_ref())
            .map_or(0, |pool| pool.entries.len())
    }

    /// The local pool is below `floor` with no replacement announced.
    pub fn needs_refresh(&self, floor: usize) -> bool {
        match self.slots.get(&self.local_id) {
            Some(slot) => {
                slot.pending.is_none()
                    && slot.active.as_ref().map_or(0, |p| p.entries.len()) < floor
            }
            None => true,
        }
    }

    /// Local secrets still unused, for persistence.
    pub fn local_records(&self) -> Vec<NonceRecord> {
        let mut records = Vec::new();
        if let Some(slot) = self.slots.get(&self.local_id) {
            for pool in slot.active.iter().chain(slot.pending.iter()) {
                for entry in &pool.entries {
                    if let Some(secret) = &entry.secret {
                        records.push(NonceRecord {
                            pool_height: pool.created_height,
                            public: entry.public,
                            secret: secret.to_bytes(),
                        });
                    }
                }
            }
        }
        for ((_, _), round) in &self.reservations {
            if let (Some(secret), Some(public)) =
                (&round.local_secret, round.nonces.get(&self.local_id))
            {
                records.push(NonceRecord {
                    pool_height: 0,
                    public: *public,
                    secret: secret.to_bytes(),
                });
            }
        }
        records
    }

    /// Forget every pool of a removed or banned validator.
    pub fn drop_validator(&mut self, cvn_id: CvnId) {
        self.slots.remove(&cvn_id);
    }
}
