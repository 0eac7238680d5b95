//! Chain-data messages
//!
//! Administrator signed updates to the validator registry, the admin
//! registry, the dynamic parameters and the coin supply. A message is keyed
//! by [`ChainDataMsg::hash`], which covers the payload but not the admin
//! signatures.

use super::{
    check_dynamic_chain_parameters, AdminId, AdminSet, ChainAdmin, CvnId, CvnInfo, CvnSet,
    DynamicChainParams, PocError, PocResult,
};
use serde::{Deserialize, Serialize};
use shared_crypto::{sign_hash, verify_hash, Hash, HashWriter, SchnorrSignature, SecretKey};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Validator registry changes
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CvnUpdate {
    pub added: Vec<CvnInfo>,
    pub removed: Vec<CvnId>,
    pub banned: Vec<CvnId>,
}

/// Admin registry changes
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminUpdate {
    pub added: Vec<ChainAdmin>,
    pub removed: Vec<AdminId>,
}

/// Coin supply change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinSupply {
    /// Amount issued, in base units
    pub amount: u64,
    /// No further supply changes after this one
    pub is_final: bool,
}

/// One admin's signature over a chain-data message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminSignature {
    pub admin_id: AdminId,
    pub signature: SchnorrSignature,
}

/// Admin signed chain-data message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainDataMsg {
    /// Creation time; distinguishes otherwise equal payloads
    pub created: u64,
    pub params: Option<DynamicChainParams>,
    pub cvn_update: Option<CvnUpdate>,
    pub admin_update: Option<AdminUpdate>,
    pub coin_supply: Option<CoinSupply>,
    pub admin_signatures: Vec<AdminSignature>,
}

impl ChainDataMsg {
    pub fn new(created: u64) -> Self {
        Self {
            created,
            params: None,
            cvn_update: None,
            admin_update: None,
            coin_supply: None,
            admin_signatures: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: DynamicChainParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_cvn_update(mut self, update: CvnUpdate) -> Self {
        self.cvn_update = Some(update);
        self
    }

    pub fn with_admin_update(mut self, update: AdminUpdate) -> Self {
        self.admin_update = Some(update);
        self
    }

    pub fn with_coin_supply(mut self, supply: CoinSupply) -> Self {
        self.coin_supply = Some(supply);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_none()
            && self.cvn_update.is_none()
            && self.admin_update.is_none()
            && self.coin_supply.is_none()
    }

    /// Payload hash; the message key and the admin signing target.
    pub fn hash(&self) -> Hash {
        let mut writer = HashWriter::new();
        writer.update_u64(self.created);
        // bincode of plain data structures cannot fail
        let payload = bincode::serialize(&(
            &self.params,
            &self.cvn_update,
            &self.admin_update,
            &self.coin_supply,
        ))
        .unwrap_or_default();
        writer.update(&payload);
        writer.finalize()
    }

    /// Append the signature of `admin_id` over the payload hash.
    pub fn sign(&mut self, admin_id: AdminId, key: &SecretKey) -> PocResult<()> {
        let signature = sign_hash(key, &self.hash())?;
        self.admin_signatures.push(AdminSignature {
            admin_id,
            signature,
        });
        Ok(())
    }
}

/// Reject a signature list naming the same admin twice.
pub fn check_for_duplicate_admin_sigs(signatures: &[AdminSignature]) -> PocResult<()> {
    let mut seen = HashSet::new();
    for sig in signatures {
        if !seen.insert(sig.admin_id) {
            return Err(PocError::DuplicateEntry(format!(
                "admin {:#010x} signed twice",
                sig.admin_id
            )));
        }
    }
    Ok(())
}

/// Reject a validator list naming the same id twice.
pub fn check_for_duplicate_cvns(cvns: &[CvnInfo]) -> PocResult<()> {
    let mut seen = HashSet::new();
    for cvn in cvns {
        if !seen.insert(cvn.id) {
            return Err(PocError::DuplicateEntry(format!(
                "validator {:#010x} listed twice",
                cvn.id
            )));
        }
    }
    Ok(())
}

/// Reject an admin list naming the same id twice.
pub fn check_for_duplicate_chain_admins(admins: &[ChainAdmin]) -> PocResult<()> {
    let mut seen = HashSet::new();
    for admin in admins {
        if !seen.insert(admin.id) {
            return Err(PocError::DuplicateEntry(format!(
                "admin {:#010x} listed twice",
                admin.id
            )));
        }
    }
    Ok(())
}

/// Reject a missing-signer list that is unsorted or repeats an id.
pub fn check_for_duplicate_missing_chain_sigs(missing: &[CvnId]) -> PocResult<()> {
    if missing.windows(2).all(|w| w[0] < w[1]) {
        Ok(())
    } else {
        Err(PocError::DuplicateEntry(
            "missing signer ids must be strictly ascending".into(),
        ))
    }
}

/// Verify admin signatures against the current registry and parameters.
pub fn check_admin_signatures(
    msg: &ChainDataMsg,
    admins: &AdminSet,
    params: &DynamicChainParams,
) -> PocResult<()> {
    check_for_duplicate_admin_sigs(&msg.admin_signatures)?;

    let count = msg.admin_signatures.len();
    if count < params.min_admin_sigs as usize {
        return Err(PocError::InvalidChainData(format!(
            "{count} admin signatures, {} required",
            params.min_admin_sigs
        )));
    }
    if count > params.max_admin_sigs as usize {
        return Err(PocError::InvalidChainData(format!(
            "{count} admin signatures, at most {} allowed",
            params.max_admin_sigs
        )));
    }

    let hash = msg.hash();
    for sig in &msg.admin_signatures {
        let admin = admins.get(sig.admin_id).ok_or_else(|| {
            PocError::InvalidChainData(format!("unknown admin {:#010x}", sig.admin_id))
        })?;
        if msg.coin_supply.is_some() && !admin.coin_supply {
            return Err(PocError::InvalidChainData(format!(
                "admin {:#010x} may not change coin supply",
                admin.id
            )));
        }
        if !verify_hash(&sig.signature, &hash, &admin.pubkey) {
            return Err(PocError::InvalidChainData(format!(
                "bad signature from admin {:#010x}",
                admin.id
            )));
        }
    }
    Ok(())
}

/// Full validation of a chain-data message against current state.
///
/// Every rejection is reported as [`PocError::InvalidChainData`].
pub fn validate_chain_data(msg: &ChainDataMsg, registries: &ChainRegistries) -> PocResult<()> {
    check_chain_data(msg, registries).map_err(|err| match err {
        PocError::DuplicateEntry(reason) => PocError::InvalidChainData(reason),
        PocError::UnknownValidator(id) => {
            PocError::InvalidChainData(format!("unknown validator {id:#010x}"))
        }
        other => other,
    })
}

fn check_chain_data(msg: &ChainDataMsg, registries: &ChainRegistries) -> PocResult<()> {
    let ChainRegistries {
        cvns,
        admins,
        params,
        supply_final,
        ..
    } = registries;
    if msg.is_empty() {
        return Err(PocError::InvalidChainData("empty payload".into()));
    }
    check_admin_signatures(msg, admins, params)?;

    if msg.coin_supply.is_some() && *supply_final {
        return Err(PocError::InvalidChainData("coin supply is final".into()));
    }

    if let Some(new_params) = &msg.params {
        check_dynamic_chain_parameters(new_params)?;
    }

    if let Some(update) = &msg.cvn_update {
        check_for_duplicate_cvns(&update.added)?;
        let mut dropped = HashSet::new();
        for id in update.removed.iter().chain(&update.banned) {
            if !dropped.insert(*id) {
                return Err(PocError::InvalidChainData(format!(
                    "validator {id:#010x} removed or banned twice"
                )));
            }
            if !cvns.contains(*id) && !update.added.iter().any(|c| c.id == *id) {
                return Err(PocError::UnknownValidator(*id));
            }
        }
    }

    if let Some(update) = &msg.admin_update {
        check_for_duplicate_chain_admins(&update.added)?;
        let mut remaining: BTreeSet<AdminId> = admins.iter().map(|a| a.id).collect();
        for id in &update.removed {
            if !remaining.remove(id) {
                return Err(PocError::InvalidChainData(format!(
                    "cannot remove unknown admin {id:#010x}"
                )));
            }
        }
        remaining.extend(update.added.iter().map(|a| a.id));
        let min = msg
            .params
            .as_ref()
            .unwrap_or(params)
            .min_admin_sigs as usize;
        if remaining.len() < min {
            return Err(PocError::InvalidChainData(format!(
                "admin update leaves {} admins, {min} signatures required",
                remaining.len()
            )));
        }
    }
    Ok(())
}

/// Registries mutated by chain data
#[derive(Clone, Debug, Default)]
pub struct ChainRegistries {
    pub cvns: CvnSet,
    pub admins: AdminSet,
    pub params: DynamicChainParams,
    /// Total coin supply issued by chain data
    pub coin_supply: u64,
    pub supply_final: bool,
}

impl ChainRegistries {
    /// Apply an already validated message carried by the block at `height`.
    /// Additions of known ids replace the stored entry.
    ///
    /// Either the whole message applies or the registries are left as they were.
    pub fn update_chain_data(&mut self, msg: &ChainDataMsg, height: u64) -> PocResult<()> {
        let mut next = self.clone();
        if let Some(params) = msg.params {
            next.update_chain_parameters(params);
        }
        if let Some(update) = &msg.cvn_update {
            next.update_cvn_info(update, height)?;
        }
        if let Some(update) = &msg.admin_update {
            next.update_chain_admins(update);
        }
        if let Some(supply) = msg.coin_supply {
            if next.supply_final {
                return Err(PocError::InvalidChainData("coin supply is final".into()));
            }
            next.coin_supply = next.coin_supply.saturating_add(supply.amount);
            next.supply_final = supply.is_final;
        }
        *self = next;
        Ok(())
    }

    pub fn update_chain_parameters(&mut self, params: DynamicChainParams) {
        self.params = params;
    }

    pub fn update_cvn_info(&mut self, update: &CvnUpdate, height: u64) -> PocResult<()> {
        for cvn in &update.added {
            self.cvns.upsert(cvn.clone());
        }
        for id in &update.removed {
            self.cvns.remove(*id);
        }
        for id in &update.banned {
            self.cvns.ban(*id, height)?;
        }
        Ok(())
    }

    pub fn update_chain_admins(&mut self, update: &AdminUpdate) {
        for admin in &update.added {
            self.admins.upsert(admin.clone());
        }
        for id in &update.removed {
            self.admins.remove(*id);
        }
    }
}

/// Received chain data awaiting inclusion, and messages already applied
#[derive(Debug, Default)]
pub struct ChainDataStore {
    pending: BTreeMap<Hash, ChainDataMsg>,
    /// Applied messages with the height of the block carrying them
    applied: BTreeMap<Hash, (u64, ChainDataMsg)>,
}

impl ChainDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the message is already known.
    pub fn insert_pending(&mut self, msg: ChainDataMsg) -> bool {
        let hash = msg.hash();
        if self.applied.contains_key(&hash) || self.pending.contains_key(&hash) {
            return false;
        }
        self.pending.insert(hash, msg);
        true
    }

    pub fn pending(&self, hash: &Hash) -> Option<&ChainDataMsg> {
        self.pending.get(hash)
    }

    /// Pending messages in creation order.
    pub fn pending_messages(&self) -> Vec<ChainDataMsg> {
        let mut msgs: Vec<ChainDataMsg> = self.pending.values().cloned().collect();
        msgs.sort_by_key(|m| m.created);
        msgs
    }

    /// Record `msg` as applied by the block at `height`.
    pub fn mark_applied(&mut self, msg: &ChainDataMsg, height: u64) {
        let hash = msg.hash();
        self.pending.remove(&hash);
        self.applied.insert(hash, (height, msg.clone()));
    }

    pub fn is_applied(&self, hash: &Hash) -> bool {
        self.applied.contains_key(hash)
    }

    /// Applied message and its block height.
    pub fn applied(&self, hash: &Hash) -> Option<(u64, &ChainDataMsg)> {
        self.applied.get(hash).map(|(height, msg)| (*height, msg))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
