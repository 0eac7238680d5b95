//! Gossip envelope

use super::{ChainDataMsg, CvnPartialSignature, NoncePoolMsg};
use serde::{Deserialize, Serialize};

/// Messages exchanged between cooperating validators
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PocMessage {
    ChainData(ChainDataMsg),
    PartialSignature(CvnPartialSignature),
    NoncePool(NoncePoolMsg),
}

impl PocMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PocMessage::ChainData(_) => "chain_data",
            PocMessage::PartialSignature(_) => "partial_signature",
            PocMessage::NoncePool(_) => "nonce_pool",
        }
    }
}
