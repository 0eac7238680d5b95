//! Production round state

use super::{BlockIndexEntry, CvnId};
use shared_crypto::Hash;
use std::fmt;
use std::time::Duration;

/// Phase of the local production cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PocState {
    Init,
    NoncePoolChanges,
    CreateSignature,
    WaitingForSignatures,
    WaitingForBlock,
    WaitingForNewTip,
    WaitingForCvnData,
}

impl PocState {
    pub fn name(&self) -> &'static str {
        match self {
            PocState::Init => "INIT",
            PocState::NoncePoolChanges => "NONCE_POOL_CHANGES",
            PocState::CreateSignature => "CREATE_SIGNATURE",
            PocState::WaitingForSignatures => "WAITING_FOR_SIGNATURES",
            PocState::WaitingForBlock => "WAITING_FOR_BLOCK",
            PocState::WaitingForNewTip => "WAITING_FOR_NEW_TIP",
            PocState::WaitingForCvnData => "WAITING_FOR_CVN_DATA",
        }
    }
}

impl fmt::Display for PocState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tip snapshot the round builds on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TipRef {
    pub hash: Hash,
    pub height: u64,
    pub time: u64,
}

impl From<&BlockIndexEntry> for TipRef {
    fn from(entry: &BlockIndexEntry) -> Self {
        Self {
            hash: entry.hash,
            height: entry.height(),
            time: entry.time(),
        }
    }
}

/// The node's single production state
#[derive(Debug)]
pub struct PocStateHolder {
    pub state: PocState,
    pub node_id: CvnId,
    pub next_creator: Option<CvnId>,
    pub last_creator: Option<CvnId>,
    /// Rotation attempt of the current round
    pub attempt: u64,
    pub last_attempt: u64,
    /// Consecutive idle polls, drives the poll backoff
    pub sleep: u32,
    /// Validators excluded from the current round
    pub missing_signatures: Vec<CvnId>,
    pub last_tip: Option<TipRef>,
    pub prev: Option<TipRef>,
}

impl PocStateHolder {
    pub fn new(node_id: CvnId) -> Self {
        Self {
            state: PocState::Init,
            node_id,
            next_creator: None,
            last_creator: None,
            attempt: 0,
            last_attempt: 0,
            sleep: 0,
            missing_signatures: Vec::new(),
            last_tip: None,
            prev: None,
        }
    }

    /// Start a new production attempt.
    pub fn reset(&mut self, next_creator: Option<CvnId>, attempt: u64, tip: TipRef) {
        self.state = PocState::NoncePoolChanges;
        self.last_creator = self.next_creator;
        self.next_creator = next_creator;
        self.last_attempt = self.attempt;
        self.attempt = attempt;
        self.last_tip = self.prev;
        self.prev = Some(tip);
        self.sleep = 0;
        self.missing_signatures.clear();
    }

    /// The round inputs changed since the last reset.
    pub fn is_stale(&self, tip_hash: &Hash, next_creator: Option<CvnId>, attempt: u64) -> bool {
        self.prev.map(|p| p.hash) != Some(*tip_hash)
            || self.next_creator != next_creator
            || self.attempt != attempt
    }

    /// The last reset moved to a different tip.
    pub fn new_tip(&self) -> bool {
        self.last_tip.map(|t| t.hash) != self.prev.map(|t| t.hash)
    }

    /// The last reset kept the tip but rotated to another attempt.
    pub fn block_spacing_timeout(&self) -> bool {
        self.last_creator != self.next_creator || self.last_attempt != self.attempt
    }

    pub fn prev_block_hash(&self) -> Option<Hash> {
        self.prev.map(|p| p.hash)
    }

    pub fn is_creator(&self) -> bool {
        self.next_creator == Some(self.node_id)
    }

    /// Poll delay after `sleep` idle polls, doubling up to `max`.
    pub fn backoff(&self, base: Duration, max: Duration) -> Duration {
        let factor = 1u32 << self.sleep.min(16);
        base.saturating_mul(factor).min(max)
    }

    pub fn idle(&mut self) {
        self.sleep = self.sleep.saturating_add(1);
    }

    pub fn active(&mut self) {
        self.sleep = 0;
    }
}
