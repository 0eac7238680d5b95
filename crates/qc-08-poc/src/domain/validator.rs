//! Validator (CVN) and chain administrator registries

use super::{PocError, PocResult};
use serde::{Deserialize, Serialize};
use shared_crypto::SchnorrPublicKey;
use std::collections::BTreeMap;

/// Cooperating validator node identifier
pub type CvnId = u32;

/// Chain administrator identifier
pub type AdminId = u32;

/// Node id of the genesis validator
pub const GENESIS_NODE_ID: CvnId = 0xc001_d00d;

/// Admin id of the genesis chain administrator
pub const GENESIS_ADMIN_ID: AdminId = 0xad3a_ee01;

/// Registered validator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CvnInfo {
    pub id: CvnId,
    pub pubkey: SchnorrPublicKey,
    /// Operator supplied, network visible metadata (alias, contact)
    pub metadata: String,
}

impl CvnInfo {
    pub fn new(id: CvnId, pubkey: SchnorrPublicKey) -> Self {
        Self {
            id,
            pubkey,
            metadata: String::new(),
        }
    }
}

/// Chain administrator allowed to sign chain-data messages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainAdmin {
    pub id: AdminId,
    pub pubkey: SchnorrPublicKey,
    /// Authorised to sign coin supply changes
    pub coin_supply: bool,
}

/// Validator registry ordered by id.
///
/// Mutated only by applying accepted chain data.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CvnSet {
    cvns: BTreeMap<CvnId, CvnInfo>,
    /// Banned id to the height of the block that banned it
    banned: BTreeMap<CvnId, u64>,
}

impl CvnSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cvns(cvns: impl IntoIterator<Item = CvnInfo>) -> Self {
        let mut set = Self::new();
        for cvn in cvns {
            set.upsert(cvn);
        }
        set
    }

    /// Insert or replace; returns true if the id was new.
    pub fn upsert(&mut self, cvn: CvnInfo) -> bool {
        self.cvns.insert(cvn.id, cvn).is_none()
    }

    pub fn remove(&mut self, id: CvnId) -> Option<CvnInfo> {
        self.banned.remove(&id);
        self.cvns.remove(&id)
    }

    /// Ban `id` as of block `height`. A repeated ban keeps the first height.
    pub fn ban(&mut self, id: CvnId, height: u64) -> PocResult<()> {
        if !self.cvns.contains_key(&id) {
            return Err(PocError::UnknownValidator(id));
        }
        self.banned.entry(id).or_insert(height);
        Ok(())
    }

    pub fn get(&self, id: CvnId) -> Option<&CvnInfo> {
        self.cvns.get(&id)
    }

    pub fn contains(&self, id: CvnId) -> bool {
        self.cvns.contains_key(&id)
    }

    pub fn is_banned(&self, id: CvnId) -> bool {
        self.banned.contains_key(&id)
    }

    pub fn banned_at(&self, id: CvnId) -> Option<u64> {
        self.banned.get(&id).copied()
    }

    /// Banned ids with their ban heights.
    pub fn banned(&self) -> impl Iterator<Item = (CvnId, u64)> + '_ {
        self.banned.iter().map(|(id, height)| (*id, *height))
    }

    /// Registered and not banned.
    pub fn is_active(&self, id: CvnId) -> bool {
        self.contains(id) && !self.is_banned(id)
    }

    pub fn len(&self) -> usize {
        self.cvns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cvns.is_empty()
    }

    /// Active validator ids in ascending order.
    pub fn active_ids(&self) -> Vec<CvnId> {
        self.cvns
            .keys()
            .copied()
            .filter(|id| !self.banned.contains_key(id))
            .collect()
    }

    pub fn banned_ids(&self) -> Vec<CvnId> {
        self.banned.keys().copied().collect()
    }

    pub fn pubkey(&self, id: CvnId) -> PocResult<&SchnorrPublicKey> {
        self.cvns
            .get(&id)
            .map(|cvn| &cvn.pubkey)
            .ok_or(PocError::UnknownValidator(id))
    }

    /// Sum of the public keys of `signers`.
    pub fn aggregate_key(&self, signers: &[CvnId]) -> PocResult<SchnorrPublicKey> {
        let keys = signers
            .iter()
            .map(|id| self.pubkey(*id))
            .collect::<PocResult<Vec<_>>>()?;
        Ok(SchnorrPublicKey::sum(keys)?)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CvnInfo> {
        self.cvns.values()
    }
}

/// Chain administrator registry
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AdminSet {
    admins: BTreeMap<AdminId, ChainAdmin>,
}

impl AdminSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_admins(admins: impl IntoIterator<Item = ChainAdmin>) -> Self {
        Self {
            admins: admins.into_iter().map(|a| (a.id, a)).collect(),
        }
    }

    pub fn upsert(&mut self, admin: ChainAdmin) -> bool {
        self.admins.insert(admin.id, admin).is_none()
    }

    pub fn remove(&mut self, id: AdminId) -> Option<ChainAdmin> {
        self.admins.remove(&id)
    }

    pub fn get(&self, id: AdminId) -> Option<&ChainAdmin> {
        self.admins.get(&id)
    }

    pub fn contains(&self, id: AdminId) -> bool {
        self.admins.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.admins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainAdmin> {
        self.admins.values()
    }
}

/// Signatures required out of `active` validators at `percentage` percent,
/// rounded up and never below one.
pub fn required_signatures(active: usize, percentage: u32) -> usize {
    let needed = (active * percentage as usize).div_ceil(100);
    needed.max(1)
}
