//! Driven ports (Outbound dependencies)

use crate::domain::{Block, BlockIndexEntry, ChainDataMsg, CvnPartialSignature, NoncePoolMsg, NonceRecord, PocResult};
use async_trait::async_trait;
use shared_crypto::Hash;

/// Read-only view of the block index
pub trait ChainView: Send + Sync {
    fn tip(&self) -> Option<BlockIndexEntry>;

    fn block(&self, hash: &Hash) -> Option<BlockIndexEntry>;

    /// Child of `prev_hash` on the active chain
    fn block_by_prev_hash(&self, prev_hash: &Hash) -> Option<BlockIndexEntry>;

    /// Chain-data payload of a stored block, if the body is available
    fn chain_data(&self, block_hash: &Hash) -> Option<Vec<ChainDataMsg>>;

    fn parent(&self, entry: &BlockIndexEntry) -> Option<BlockIndexEntry> {
        if entry.header.is_genesis() {
            return None;
        }
        self.block(&entry.header.prev_hash)
    }
}

/// Gossip and block submission
#[async_trait]
pub trait PocNetwork: Send + Sync {
    async fn relay_chain_data(&self, msg: ChainDataMsg) -> Result<(), String>;

    async fn relay_cvn_signature(&self, msg: CvnPartialSignature) -> Result<(), String>;

    async fn relay_nonce_pool(&self, msg: NoncePoolMsg) -> Result<(), String>;

    /// Hand a finished block to the block processing pipeline
    async fn submit_block(&self, block: Block) -> Result<(), String>;
}

/// Durable storage of the local validator's unused secret nonces
pub trait NonceStore: Send + Sync {
    fn read(&self) -> PocResult<Vec<NonceRecord>>;

    /// Replace the stored records. Must be durable when it returns.
    fn write(&self, records: &[NonceRecord]) -> PocResult<()>;
}

/// Time source abstraction
pub trait TimeSource: Send + Sync {
    /// Unix seconds
    fn now(&self) -> u64;
}

/// System clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}
