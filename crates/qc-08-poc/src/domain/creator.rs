//! Block creator selection
//!
//! Candidates are the active validators ranked by time weight (blocks
//! since their last creation, descending) and then by id. A validator that
//! has not co-signed within the recent window is skipped while the chain is
//! long enough to judge. The top candidate owns the first slot after the
//! tip; each later slot passes the turn to the next candidate, wrapping.

use super::{slot_index, BlockIndexEntry, CvnId, CvnSet};
use shared_crypto::Hash;
use std::collections::{BTreeMap, BTreeSet};

/// Deepest ancestor inspected for time weights
pub const MAX_WEIGHT_HISTORY: usize = 1_000;

/// Candidate order for one tip
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatorRanking {
    pub tip_hash: Hash,
    pub tip_time: u64,
    pub candidates: Vec<CvnId>,
}

impl CreatorRanking {
    /// Rotation attempt at `time`.
    pub fn attempt_at(&self, time: u64, spacing: u32) -> u64 {
        slot_index(self.tip_time, time, spacing)
    }

    /// Candidate owning `attempt`, or `None` when nobody is eligible.
    pub fn creator_for_attempt(&self, attempt: u64) -> Option<CvnId> {
        if self.candidates.is_empty() {
            return None;
        }
        let index = attempt % self.candidates.len() as u64;
        self.candidates.get(index as usize).copied()
    }

    pub fn creator_at(&self, time: u64, spacing: u32) -> Option<CvnId> {
        self.creator_for_attempt(self.attempt_at(time, spacing))
    }
}

/// Signers recorded by a header: the creator plus every active validator
/// not listed as missing.
fn header_signers(entry: &BlockIndexEntry, active: &[CvnId]) -> Vec<CvnId> {
    let header = &entry.header;
    let mut signers = vec![header.creator_id];
    if header.chain_multi_sig.is_some() {
        signers.extend(
            active
                .iter()
                .copied()
                .filter(|id| header.missing_signer_ids.binary_search(id).is_err()),
        );
    }
    signers
}

/// Rank the creator candidates for the round building on `tip`.
///
/// `parent_of` resolves a block hash to its parent entry.
pub fn rank_candidates(
    tip: &BlockIndexEntry,
    parent_of: impl Fn(&BlockIndexEntry) -> Option<BlockIndexEntry>,
    cvns: &CvnSet,
    window: u32,
) -> CreatorRanking {
    let active = cvns.active_ids();
    let window = window as usize;
    let mut last_created: BTreeMap<CvnId, usize> = BTreeMap::new();
    let mut recent_signers: BTreeSet<CvnId> = BTreeSet::new();
    let mut walked = 0usize;
    let mut signed_blocks = 0usize;

    let mut cursor = Some(tip.clone());
    while let Some(entry) = cursor {
        if walked < window {
            recent_signers.extend(header_signers(&entry, &active));
            if entry.header.chain_multi_sig.is_some() {
                signed_blocks += 1;
            }
        }
        last_created.entry(entry.header.creator_id).or_insert(walked);
        walked += 1;
        let done = active.iter().all(|id| last_created.contains_key(id))
            && walked >= window;
        if done || walked >= MAX_WEIGHT_HISTORY || entry.header.is_genesis() {
            break;
        }
        cursor = parent_of(&entry);
    }

    let weight = |id: &CvnId| last_created.get(id).copied().unwrap_or(walked);
    let mut candidates: Vec<CvnId> = if signed_blocks >= window {
        active
            .iter()
            .copied()
            .filter(|id| recent_signers.contains(id))
            .collect()
    } else {
        Vec::new()
    };
    if candidates.is_empty() {
        candidates = active;
    }
    candidates.sort_by(|a, b| weight(b).cmp(&weight(a)).then(a.cmp(b)));

    CreatorRanking {
        tip_hash: tip.hash,
        tip_time: tip.time(),
        candidates,
    }
}

/// Memoised ranking of the most recent tip
#[derive(Debug, Default)]
pub struct CreatorCache {
    key: Option<(Hash, Vec<CvnId>, u32)>,
    ranking: Option<CreatorRanking>,
}

impl CreatorCache {
    pub fn get_or_rank(
        &mut self,
        tip: &BlockIndexEntry,
        parent_of: impl Fn(&BlockIndexEntry) -> Option<BlockIndexEntry>,
        cvns: &CvnSet,
        window: u32,
    ) -> CreatorRanking {
        let key = (tip.hash, cvns.active_ids(), window);
        if self.key.as_ref() == Some(&key) {
            if let Some(ranking) = &self.ranking {
                return ranking.clone();
            }
        }
        let ranking = rank_candidates(tip, parent_of, cvns, window);
        self.key = Some(key);
        self.ranking = Some(ranking.clone());
        ranking
    }

    pub fn clear(&mut self) {
        self.key = None;
        self.ranking = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BlockHeader, CvnInfo};
    use shared_crypto::{sign_hash, SecretKey};
    use std::collections::HashMap;

    struct Chain {
        blocks: HashMap<Hash, BlockIndexEntry>,
        tip: BlockIndexEntry,
    }

    impl Chain {
        fn new() -> Self {
            let genesis = BlockIndexEntry::new(BlockHeader::genesis(1_000));
            let mut blocks = HashMap::new();
            blocks.insert(genesis.hash, genesis.clone());
            Self {
                blocks,
                tip: genesis,
            }
        }

        fn extend(&mut self, creator: CvnId, missing: Vec<CvnId>) {
            let mut header = BlockHeader::genesis(self.tip.time() + 60);
            header.prev_hash = self.tip.hash;
            header.height = self.tip.height() + 1;
            header.creator_id = creator;
            header.missing_signer_ids = missing;
            // any well formed signature marks the block as co-signed
            header.chain_multi_sig = Some(sign_hash(&SecretKey::generate(), &[1u8; 32]).unwrap());
            let entry = BlockIndexEntry::new(header);
            self.blocks.insert(entry.hash, entry.clone());
            self.tip = entry;
        }

        fn rank(&self, cvns: &CvnSet, window: u32) -> CreatorRanking {
            rank_candidates(
                &self.tip,
                |e| self.blocks.get(&e.header.prev_hash).cloned(),
                cvns,
                window,
            )
        }
    }

    fn cvns(ids: &[CvnId]) -> CvnSet {
        CvnSet::from_cvns(ids.iter().map(|id| CvnInfo::new(*id, SecretKey::generate().public_key())))
    }

    #[test]
    fn test_ties_break_by_ascending_id() {
        let chain = Chain::new();
        let ranking = chain.rank(&cvns(&[30, 10, 20]), 5);
        assert_eq!(ranking.candidates, vec![10, 20, 30]);
    }

    #[test]
    fn test_recent_creator_ranked_last() {
        let mut chain = Chain::new();
        chain.extend(10, vec![]);
        chain.extend(20, vec![]);
        let ranking = chain.rank(&cvns(&[10, 20, 30]), 1);
        // 30 never created, 10 waited longer than 20
        assert_eq!(ranking.candidates, vec![30, 10, 20]);
    }

    #[test]
    fn test_banned_validator_skipped() {
        let chain = Chain::new();
        let mut set = cvns(&[1, 2, 3]);
        set.ban(1, 3).unwrap();
        assert_eq!(chain.rank(&set, 5).candidates, vec![2, 3]);
    }

    #[test]
    fn test_absent_signer_ineligible_once_window_filled() {
        let mut chain = Chain::new();
        for _ in 0..3 {
            chain.extend(1, vec![3]);
        }
        let set = cvns(&[1, 2, 3]);
        let ranking = chain.rank(&set, 3);
        assert!(!ranking.candidates.contains(&3));
        // window longer than the chain: nobody filtered
        let ranking = chain.rank(&set, 10);
        assert!(ranking.candidates.contains(&3));
    }

    #[test]
    fn test_no_active_validators() {
        let chain = Chain::new();
        let ranking = chain.rank(&CvnSet::new(), 5);
        assert_eq!(ranking.creator_at(2_000, 60), None);
    }

    #[test]
    fn test_rotation_timing() {
        let chain = Chain::new();
        let ranking = chain.rank(&cvns(&[1, 2, 3]), 5);
        let t = chain.tip.time();
        assert_eq!(ranking.creator_at(t, 60), Some(1));
        assert_eq!(ranking.creator_at(t + 119, 60), Some(1));
        assert_eq!(ranking.creator_at(t + 120, 60), Some(2));
        assert_eq!(ranking.creator_at(t + 180, 60), Some(3));
        assert_eq!(ranking.creator_at(t + 240, 60), Some(1));
    }

    #[test]
    fn test_cache_reranks_on_registry_change() {
        let chain = Chain::new();
        let mut cache = CreatorCache::default();
        let parent = |e: &BlockIndexEntry| chain.blocks.get(&e.header.prev_hash).cloned();
        let mut set = cvns(&[1, 2]);
        assert_eq!(cache.get_or_rank(&chain.tip, parent, &set, 5).candidates, vec![1, 2]);
        set.ban(1, 3).unwrap();
        assert_eq!(cache.get_or_rank(&chain.tip, parent, &set, 5).candidates, vec![2]);
    }
}
