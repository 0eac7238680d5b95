//! Domain layer for Proof-of-Cooperation
//!
//! Pure data types and rules. No I/O, no locking.

pub mod block;
pub mod chain_data;
pub mod creator;
pub mod error;
pub mod holder;
pub mod message;
pub mod nonce_pool;
pub mod params;
pub mod signatures;
pub mod validator;

pub use block::{payload_root, round_message, slot_index, Block, BlockHeader, BlockIndexEntry, BLOCK_VERSION};
pub use chain_data::{
    check_admin_signatures, check_for_duplicate_admin_sigs, check_for_duplicate_chain_admins,
    check_for_duplicate_cvns, check_for_duplicate_missing_chain_sigs, validate_chain_data,
    AdminSignature, AdminUpdate, ChainDataMsg, ChainDataStore, ChainRegistries, CoinSupply,
    CvnUpdate,
};
pub use creator::{rank_candidates, CreatorCache, CreatorRanking, MAX_WEIGHT_HISTORY};
pub use error::{PocError, PocResult};
pub use holder::{PocState, PocStateHolder, TipRef};
pub use message::PocMessage;
pub use nonce_pool::{
    activation_height, create_nonce_pool, validate_nonce_pool, NoncePoolMsg, NoncePoolRegistry, NonceRecord,
    RoundNonces,
};
pub use params::{check_dynamic_chain_parameters, DynamicChainParams, COIN};
pub use signatures::{
    combine_bucket, create_partial_signature, verify_partial_signature, BucketKey,
    CvnPartialSignature, PartialBuffer, RoundContext, SignatureTree,
};
pub use validator::{
    required_signatures, AdminId, AdminSet, ChainAdmin, CvnId, CvnInfo, CvnSet, GENESIS_ADMIN_ID,
    GENESIS_NODE_ID,
};
