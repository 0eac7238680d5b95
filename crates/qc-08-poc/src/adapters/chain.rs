//! In-memory block index

use crate::domain::{Block, BlockHeader, BlockIndexEntry, ChainDataMsg};
use crate::ports::ChainView;
use parking_lot::RwLock;
use shared_crypto::Hash;
use std::collections::HashMap;

#[derive(Default)]
struct ChainInner {
    entries: HashMap<Hash, BlockIndexEntry>,
    bodies: HashMap<Hash, Vec<ChainDataMsg>>,
    children: HashMap<Hash, Hash>,
    tip: Option<Hash>,
}

/// Block index for tests and single-process simulations.
///
/// The highest connected block is the tip; the first child connected on a
/// parent is the one returned by `block_by_prev_hash`.
#[derive(Default)]
pub struct InMemoryChain {
    inner: RwLock<ChainInner>,
}

impl InMemoryChain {
    pub fn with_genesis(genesis: BlockHeader) -> Self {
        let chain = Self::default();
        chain.connect_header(genesis);
        chain
    }

    /// Connect a full block.
    pub fn connect(&self, block: Block) -> BlockIndexEntry {
        let entry = self.connect_header(block.header);
        self.inner.write().bodies.insert(entry.hash, block.chain_data);
        entry
    }

    /// Connect a header whose body is not available locally.
    pub fn connect_header(&self, header: BlockHeader) -> BlockIndexEntry {
        let entry = BlockIndexEntry::new(header);
        let mut inner = self.inner.write();
        inner
            .children
            .entry(entry.header.prev_hash)
            .or_insert(entry.hash);
        let higher = match inner.tip.and_then(|t| inner.entries.get(&t)) {
            Some(tip) => entry.height() > tip.height(),
            None => true,
        };
        if higher {
            inner.tip = Some(entry.hash);
        }
        inner.entries.insert(entry.hash, entry.clone());
        entry
    }

    pub fn height(&self) -> Option<u64> {
        self.tip().map(|t| t.height())
    }
}

impl ChainView for InMemoryChain {
    fn tip(&self) -> Option<BlockIndexEntry> {
        let inner = self.inner.read();
        inner.tip.and_then(|t| inner.entries.get(&t).cloned())
    }

    fn block(&self, hash: &Hash) -> Option<BlockIndexEntry> {
        self.inner.read().entries.get(hash).cloned()
    }

    fn block_by_prev_hash(&self, prev_hash: &Hash) -> Option<BlockIndexEntry> {
        let inner = self.inner.read();
        inner
            .children
            .get(prev_hash)
            .and_then(|h| inner.entries.get(h).cloned())
    }

    fn chain_data(&self, block_hash: &Hash) -> Option<Vec<ChainDataMsg>> {
        self.inner.read().bodies.get(block_hash).cloned()
    }
}
