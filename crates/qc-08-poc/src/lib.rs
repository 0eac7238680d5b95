//! # qc-08-poc
//!
//! Proof-of-Cooperation consensus subsystem for Quantum-Chain.
//!
//! ## Architecture
//!
//! A fixed, permissioned set of cooperating validator nodes (CVNs) takes
//! turns creating blocks. Every block carries an aggregated Schnorr
//! signature of a quorum of validators over the round it was built in.
//!
//! ```text
//!  gossip ──► handle_message ──► [chain data | nonce pools | partial sigs]
//!                                          │
//!  chain tip + clock ──► poll ──► NONCE_POOL_CHANGES ──► CREATE_SIGNATURE
//!                                          │
//!                       WAITING_FOR_SIGNATURES ──► WAITING_FOR_BLOCK
//!                                          │
//!                                WAITING_FOR_NEW_TIP ──► (reset)
//! ```
//!
//! ### Rounds
//!
//! A round is (tip, rotation attempt). The creator of an attempt is fixed
//! by the chain alone, and so are the nonce pool entries every validator
//! commits to for it. Partial signatures are grouped by
//! (tip, creator, missing set); the creator combines the first complete
//! group into the block's chain signature.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use qc_08_poc::{PocConfig, PocDependencies, PocService};
//!
//! let service = PocService::new(PocDependencies {
//!     chain,
//!     network,
//!     nonce_store: Arc::new(FileNonceStore::open(config.nonce_file())?),
//!     time_source: Arc::new(SystemTimeSource),
//!     secret_key,
//!     config,
//!     genesis_cvns,
//!     genesis_admins,
//! })?;
//!
//! service.run(shutdown_rx).await?;
//! ```
//!
//! ## Security
//!
//! - Secret nonces are written to disk before use and never signed with twice
//! - Chain data requires admin signatures within the governed bounds
//! - Every received partial signature is checked against the reserved nonces

pub mod adapters;
pub mod config;
pub mod domain;
pub mod metrics;
pub mod ports;
pub mod service;
pub mod state;
pub mod validation;

// Re-export main types
pub use adapters::{FileNonceStore, InMemoryChain, InMemoryNetwork, ManualClock, MemoryNonceStore};
pub use config::PocConfig;
pub use domain::{
    Block, BlockHeader, BlockIndexEntry, ChainAdmin, ChainDataMsg, CvnId, CvnInfo,
    CvnPartialSignature, DynamicChainParams, NoncePoolMsg, PocError, PocMessage, PocResult,
    PocState,
};
pub use ports::{ChainView, NonceStore, PocApi, PocNetwork, SystemTimeSource, TimeSource};
pub use service::{PocDependencies, PocService};
pub use validation::ProofValidator;
