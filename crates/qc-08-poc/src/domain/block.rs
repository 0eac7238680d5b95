//! Block entities

use super::{ChainDataMsg, CvnId, GENESIS_NODE_ID};
use serde::{Deserialize, Serialize};
use shared_crypto::{tagged_hash, Hash, HashWriter, SchnorrSignature};

/// Current header version
pub const BLOCK_VERSION: u32 = 1;

const ROUND_TAG: &[u8] = b"qc/poc/round";

/// Block header
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash,
    /// Commitment to the block's chain-data payload
    pub payload_root: Hash,
    /// Unix seconds
    pub time: u64,
    pub height: u64,
    pub creator_id: CvnId,
    /// Validators excluded from the aggregate, ascending
    pub missing_signer_ids: Vec<CvnId>,
    /// Hashes of chain-data messages carried by this block, in apply order
    pub chain_data_refs: Vec<Hash>,
    /// Aggregate signature of the cooperating validators (absent on genesis)
    pub chain_multi_sig: Option<SchnorrSignature>,
    /// Creator's own signature over [`BlockHeader::signing_hash`]
    pub creator_signature: Option<SchnorrSignature>,
}

impl BlockHeader {
    /// Genesis header created by the genesis validator.
    pub fn genesis(time: u64) -> Self {
        Self {
            version: BLOCK_VERSION,
            prev_hash: [0u8; 32],
            payload_root: payload_root(&[]),
            time,
            height: 0,
            creator_id: GENESIS_NODE_ID,
            missing_signer_ids: Vec::new(),
            chain_data_refs: Vec::new(),
            chain_multi_sig: None,
            creator_signature: None,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.prev_hash == [0u8; 32]
    }

    /// Hash covered by the creator signature (everything but that signature).
    pub fn signing_hash(&self) -> Hash {
        let mut writer = HashWriter::new();
        writer
            .update_u32(self.version)
            .update(&self.prev_hash)
            .update(&self.payload_root)
            .update_u64(self.time)
            .update_u64(self.height)
            .update_u32(self.creator_id)
            .update_u32(self.missing_signer_ids.len() as u32);
        for id in &self.missing_signer_ids {
            writer.update_u32(*id);
        }
        writer.update_u32(self.chain_data_refs.len() as u32);
        for hash in &self.chain_data_refs {
            writer.update(hash);
        }
        match &self.chain_multi_sig {
            Some(sig) => writer.update(&[1]).update(&sig.to_bytes()),
            None => writer.update(&[0]),
        };
        writer.finalize()
    }

    /// Block identifier.
    pub fn hash(&self) -> Hash {
        let mut writer = HashWriter::new();
        writer.update(&self.signing_hash());
        match &self.creator_signature {
            Some(sig) => writer.update(&[1]).update(&sig.to_bytes()),
            None => writer.update(&[0]),
        };
        writer.finalize()
    }
}

/// Full block: header plus the chain-data payload it commits to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub chain_data: Vec<ChainDataMsg>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Payload root and reference list match the carried chain data.
    pub fn payload_matches(&self) -> bool {
        let refs: Vec<Hash> = self.chain_data.iter().map(ChainDataMsg::hash).collect();
        refs == self.header.chain_data_refs && payload_root(&refs) == self.header.payload_root
    }
}

/// Commitment over an ordered list of chain-data hashes.
pub fn payload_root(refs: &[Hash]) -> Hash {
    let mut writer = HashWriter::new();
    writer.update_u32(refs.len() as u32);
    for hash in refs {
        writer.update(hash);
    }
    writer.finalize()
}

/// Chain index entry handed out by the chain view
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub hash: Hash,
    pub header: BlockHeader,
}

impl BlockIndexEntry {
    pub fn new(header: BlockHeader) -> Self {
        Self {
            hash: header.hash(),
            header,
        }
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn time(&self) -> u64 {
        self.header.time
    }
}

/// Message every cooperating validator signs for one production round.
///
/// Binds the parent tip, the intended creator and the exact missing set, so
/// a partial produced for one bucket can never count toward another.
pub fn round_message(prev_hash: &Hash, creator_id: CvnId, missing: &[CvnId]) -> Hash {
    let mut ids = Vec::with_capacity(4 + missing.len() * 4);
    ids.extend_from_slice(&(missing.len() as u32).to_le_bytes());
    for id in missing {
        ids.extend_from_slice(&id.to_le_bytes());
    }
    tagged_hash(ROUND_TAG, &[prev_hash, &creator_id.to_le_bytes(), &ids])
}

/// Rotation slot at `time` for a round building on a tip created at
/// `tip_time`.
///
/// Slot 0 spans `[T, T + 2S)`; every further `S` seconds opens the next slot.
pub fn slot_index(tip_time: u64, time: u64, spacing: u32) -> u64 {
    let spacing = u64::from(spacing.max(1));
    (time.saturating_sub(tip_time) / spacing).saturating_sub(1)
}
