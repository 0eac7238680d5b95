use crate::domain::{
    BlockIndexEntry, ChainDataStore, ChainRegistries, CreatorCache, CreatorRanking, CvnId,
    NoncePoolRegistry, PartialBuffer, SignatureTree,
};
use crate::ports::ChainView;
use parking_lot::{Mutex, RwLock};
use shared_crypto::Hash;
use std::collections::BTreeMap;

/// Round the local node is working on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CurrentRound {
    pub tip_hash: Hash,
    pub creator_id: CvnId,
    pub attempt: u64,
}

/// Creator selection with a per-tip ranking cache.
#[derive(Default)]
pub struct CreatorSelector {
    cache: Mutex<CreatorCache>,
}

impl CreatorSelector {
    pub fn ranking<C: ChainView + ?Sized>(
        &self,
        chain: &C,
        tip: &BlockIndexEntry,
        registries: &ChainRegistries,
    ) -> CreatorRanking {
        self.cache.lock().get_or_rank(
            tip,
            |entry| chain.parent(entry),
            &registries.cvns,
            registries.params.blocks_to_consider_for_sig_check,
        )
    }

    /// Validator entitled to build on `tip` at `time`.
    pub fn check_next_block_creator<C: ChainView + ?Sized>(
        &self,
        chain: &C,
        tip: &BlockIndexEntry,
        time: u64,
        registries: &ChainRegistries,
    ) -> Option<CvnId> {
        self.ranking(chain, tip, registries)
            .creator_at(time, registries.params.block_spacing)
    }

    pub fn invalidate(&self) {
        self.cache.lock().clear();
    }
}

/// Mutable state shared between the poll loop and message handlers.
///
/// Each structure has its own lock. When more than one is held they are
/// taken in declaration order.
pub struct PocSharedState {
    pub registries: RwLock<ChainRegistries>,
    pub chain_data: RwLock<ChainDataStore>,
    pub nonces: RwLock<NoncePoolRegistry>,
    pub signatures: RwLock<SignatureTree>,
    pub current_round: RwLock<Option<CurrentRound>>,
    /// Partial signatures for rounds not reserved yet
    pub buffered: Mutex<PartialBuffer>,
    /// Abandoned creation attempts per validator
    pub failures: RwLock<BTreeMap<CvnId, u32>>,
    pub selector: CreatorSelector,
}

impl PocSharedState {
    pub fn new(local_id: CvnId, registries: ChainRegistries, buffered_per_signer: usize) -> Self {
        Self {
            registries: RwLock::new(registries),
            chain_data: RwLock::new(ChainDataStore::new()),
            nonces: RwLock::new(NoncePoolRegistry::new(local_id)),
            signatures: RwLock::new(SignatureTree::new()),
            current_round: RwLock::new(None),
            buffered: Mutex::new(PartialBuffer::new(buffered_per_signer)),
            failures: RwLock::new(BTreeMap::new()),
            selector: CreatorSelector::default(),
        }
    }

    pub fn record_failure(&self, creator: CvnId) -> u32 {
        let mut failures = self.failures.write();
        let count = failures.entry(creator).or_insert(0);
        *count += 1;
        *count
    }

    pub fn clear_failures(&self, creator: CvnId) {
        self.failures.write().remove(&creator);
    }

    /// Validators with more failed attempts than `budget`.
    pub fn ban_candidates(&self, budget: u32) -> Vec<CvnId> {
        self.failures
            .read()
            .iter()
            .filter(|(_, count)| **count > budget)
            .map(|(id, _)| *id)
            .collect()
    }
}
