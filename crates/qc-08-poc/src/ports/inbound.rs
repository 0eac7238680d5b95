//! Driving ports (Inbound API)

use crate::domain::{
    BlockHeader, BlockIndexEntry, ChainDataMsg, CvnId, PocMessage, PocResult, PocState,
};
use async_trait::async_trait;

/// Proof-of-Cooperation API used by block validation and the gossip layer
#[async_trait]
pub trait PocApi: Send + Sync {
    /// Verify the cooperation proof of a header extending the current tip.
    fn check_proof_of_cooperation(&self, header: &BlockHeader) -> PocResult<()>;

    /// Validator entitled to build on `tip` at `time`, if any.
    fn check_next_block_creator(&self, tip: &BlockIndexEntry, time: u64) -> Option<CvnId>;

    /// Validate and absorb a gossiped message. Accepted messages are relayed.
    async fn handle_message(&self, msg: PocMessage) -> PocResult<()>;

    /// Submit locally authored chain data. Returns false if already known.
    async fn add_chain_data(&self, msg: ChainDataMsg) -> PocResult<bool>;

    /// Current production state.
    async fn state(&self) -> PocState;

    /// Validators whose failed creation attempts exceed the retry budget.
    fn ban_candidates(&self) -> Vec<CvnId>;
}
