//! In-memory network adapter
//!
//! Records everything relayed or submitted so a harness can deliver it to
//! other nodes.

use crate::domain::{Block, ChainDataMsg, CvnPartialSignature, NoncePoolMsg, PocMessage};
use crate::ports::PocNetwork;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct InMemoryNetwork {
    outbox: RwLock<Vec<PocMessage>>,
    blocks: RwLock<Vec<Block>>,
    offline: AtomicBool,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self {
            outbox: RwLock::new(Vec::new()),
            blocks: RwLock::new(Vec::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Drain relayed messages.
    pub fn take_messages(&self) -> Vec<PocMessage> {
        std::mem::take(&mut *self.outbox.write())
    }

    pub fn message_count(&self) -> usize {
        self.outbox.read().len()
    }

    /// Drain submitted blocks.
    pub fn take_blocks(&self) -> Vec<Block> {
        std::mem::take(&mut *self.blocks.write())
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    /// Make every call fail until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn push(&self, msg: PocMessage) -> Result<(), String> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(format!("network offline, dropped {}", msg.kind()));
        }
        self.outbox.write().push(msg);
        Ok(())
    }
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PocNetwork for InMemoryNetwork {
    async fn relay_chain_data(&self, msg: ChainDataMsg) -> Result<(), String> {
        self.push(PocMessage::ChainData(msg))
    }

    async fn relay_cvn_signature(&self, msg: CvnPartialSignature) -> Result<(), String> {
        self.push(PocMessage::PartialSignature(msg))
    }

    async fn relay_nonce_pool(&self, msg: NoncePoolMsg) -> Result<(), String> {
        self.push(PocMessage::NoncePool(msg))
    }

    async fn submit_block(&self, block: Block) -> Result<(), String> {
        if self.offline.load(Ordering::SeqCst) {
            return Err("network offline, block not submitted".into());
        }
        self.blocks.write().push(block);
        Ok(())
    }
}
