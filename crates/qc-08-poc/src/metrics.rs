//! # Proof-of-Cooperation Metrics
//!
//! Prometheus metrics for monitoring block production.
//!
//! ## Usage
//!
//! Enable with the `metrics` feature:
//! ```toml
//! qc-08-poc = { path = "...", features = ["metrics"] }
//! ```
//!
//! ## Metrics Exported
//!
//! - `poc_blocks_produced_total` - Blocks this node created and submitted
//! - `poc_partial_signatures_total` - Partial signatures by outcome
//! - `poc_nonce_pools_created_total` - Local nonce pools announced
//! - `poc_chain_data_rejected_total` - Rejected chain-data messages
//! - `poc_creator_timeouts_total` - Abandoned creator attempts

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

#[cfg(feature = "metrics")]
lazy_static! {
    pub static ref BLOCKS_PRODUCED: IntCounter = register_int_counter!(
        "poc_blocks_produced_total",
        "Total number of blocks created by this node"
    )
    .expect("Failed to create BLOCKS_PRODUCED metric");

    /// Partial signatures, labeled accepted/rejected
    pub static ref PARTIAL_SIGNATURES: IntCounterVec = register_int_counter_vec!(
        "poc_partial_signatures_total",
        "Partial signatures received by outcome",
        &["outcome"]
    )
    .expect("Failed to create PARTIAL_SIGNATURES metric");

    pub static ref NONCE_POOLS_CREATED: IntCounter = register_int_counter!(
        "poc_nonce_pools_created_total",
        "Total number of local nonce pools announced"
    )
    .expect("Failed to create NONCE_POOLS_CREATED metric");

    pub static ref CHAIN_DATA_REJECTED: IntCounter = register_int_counter!(
        "poc_chain_data_rejected_total",
        "Total number of rejected chain-data messages"
    )
    .expect("Failed to create CHAIN_DATA_REJECTED metric");

    pub static ref CREATOR_TIMEOUTS: IntCounter = register_int_counter!(
        "poc_creator_timeouts_total",
        "Total number of abandoned creator attempts"
    )
    .expect("Failed to create CREATOR_TIMEOUTS metric");
}

#[cfg(feature = "metrics")]
pub fn record_block_produced() {
    BLOCKS_PRODUCED.inc();
}

#[cfg(feature = "metrics")]
pub fn record_partial_signature(accepted: bool) {
    let outcome = if accepted { "accepted" } else { "rejected" };
    PARTIAL_SIGNATURES.with_label_values(&[outcome]).inc();
}

#[cfg(feature = "metrics")]
pub fn record_nonce_pool_created() {
    NONCE_POOLS_CREATED.inc();
}

#[cfg(feature = "metrics")]
pub fn record_chain_data_rejected() {
    CHAIN_DATA_REJECTED.inc();
}

#[cfg(feature = "metrics")]
pub fn record_creator_timeout() {
    CREATOR_TIMEOUTS.inc();
}

// No-op implementations when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
pub fn record_block_produced() {}

#[cfg(not(feature = "metrics"))]
pub fn record_partial_signature(_accepted: bool) {}

#[cfg(not(feature = "metrics"))]
pub fn record_nonce_pool_created() {}

#[cfg(not(feature = "metrics"))]
pub fn record_chain_data_rejected() {}

#[cfg(not(feature = "metrics"))]
pub fn record_creator_timeout() {}
