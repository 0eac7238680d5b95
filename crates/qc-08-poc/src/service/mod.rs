//! Proof-of-Cooperation service
//!
//! Owns the shared registries and drives the production state machine.
//! Gossip enters through [`PocApi::handle_message`]; the poll loop in
//! `machine.rs` advances the local production round.

mod machine;
mod sync;

#[cfg(test)]
mod tests;

use crate::config::PocConfig;
use crate::domain::{
    activation_height, slot_index, validate_chain_data, validate_nonce_pool, verify_partial_signature, AdminSet,
    BlockHeader, BlockIndexEntry, ChainAdmin, ChainDataMsg, ChainRegistries, CvnId, CvnInfo,
    CvnPartialSignature, CvnSet, NoncePoolMsg, PocError, PocMessage, PocResult, PocState,
    PocStateHolder,
};
use crate::ports::{ChainView, NonceStore, PocApi, PocNetwork, TimeSource};
use crate::state::PocSharedState;
use crate::validation::ProofValidator;
use async_trait::async_trait;
use parking_lot::Mutex;
use shared_crypto::{Hash, SecretKey};
use std::sync::Arc;
use tracing::{debug, warn};

/// Blocks a partial for an unknown tip stays buffered
const UNKNOWN_TIP_WINDOW: u64 = 1;

/// Collaborators and settings for [`PocService`]
pub struct PocDependencies<C, N, S> {
    pub chain: Arc<C>,
    pub network: Arc<N>,
    pub nonce_store: Arc<S>,
    pub time_source: Arc<dyn TimeSource>,
    /// Local validator key
    pub secret_key: SecretKey,
    pub config: PocConfig,
    /// Validator set at genesis
    pub genesis_cvns: Vec<CvnInfo>,
    pub genesis_admins: Vec<ChainAdmin>,
}

/// Proof-of-Cooperation service
pub struct PocService<C, N, S>
where
    C: ChainView,
    N: PocNetwork,
    S: NonceStore,
{
    chain: Arc<C>,
    network: Arc<N>,
    nonce_store: Arc<S>,
    time_source: Arc<dyn TimeSource>,
    secret_key: SecretKey,
    config: PocConfig,
    /// Registries before any chain data, replayed from on reorg
    genesis: ChainRegistries,
    state: Arc<PocSharedState>,
    holder: tokio::sync::Mutex<PocStateHolder>,
    /// Local pool announcement not yet relayed successfully
    unpublished_pool: Mutex<Option<NoncePoolMsg>>,
    last_pool_announcement: Mutex<Option<u64>>,
    /// Chain-data hashes referenced by connected blocks but not received
    missing_chain_data: Mutex<Vec<Hash>>,
    /// Last block whose chain data is reflected in the registries
    synced: Mutex<Option<BlockIndexEntry>>,
}

impl<C, N, S> PocService<C, N, S>
where
    C: ChainView,
    N: PocNetwork,
    S: NonceStore,
{
    pub fn new(deps: PocDependencies<C, N, S>) -> PocResult<Self> {
        deps.config.validate()?;
        let node_id = deps.config.node_id;
        let genesis = ChainRegistries {
            cvns: CvnSet::from_cvns(deps.genesis_cvns),
            admins: AdminSet::from_admins(deps.genesis_admins),
            params: deps.config.genesis_params,
            ..ChainRegistries::default()
        };
        Ok(Self {
            chain: deps.chain,
            network: deps.network,
            nonce_store: deps.nonce_store,
            time_source: deps.time_source,
            secret_key: deps.secret_key,
            state: Arc::new(PocSharedState::new(
                node_id,
                genesis.clone(),
                deps.config.max_buffered_per_signer,
            )),
            genesis,
            holder: tokio::sync::Mutex::new(PocStateHolder::new(node_id)),
            config: deps.config,
            unpublished_pool: Mutex::new(None),
            last_pool_announcement: Mutex::new(None),
            missing_chain_data: Mutex::new(Vec::new()),
            synced: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> CvnId {
        self.config.node_id
    }

    pub fn config(&self) -> &PocConfig {
        &self.config
    }

    pub fn shared_state(&self) -> Arc<PocSharedState> {
        Arc::clone(&self.state)
    }

    /// Snapshot of the registries.
    pub fn registries(&self) -> ChainRegistries {
        self.state.registries.read().clone()
    }

    /// Attempts spent on tips from `from_height` up to the one below `tip`.
    ///
    /// Each block extending a tip tells, through its timestamp, how many
    /// rotation attempts that tip went through. The walk stops early once
    /// no pool could have more entries left.
    fn attempts_spent(&self, tip: &BlockIndexEntry, from_height: u64, spacing: u32) -> u64 {
        let cap = self.config.max_nonce_pool_size as u64;
        let mut total = 0u64;
        let mut cursor = tip.clone();
        while cursor.height() > from_height && total < cap {
            let Some(parent) = self.chain.parent(&cursor) else {
                break;
            };
            total += slot_index(parent.time(), cursor.time(), spacing) + 1;
            cursor = parent;
        }
        total
    }

    /// Validate and queue chain data; relays it when new.
    async fn accept_chain_data(&self, msg: ChainDataMsg) -> PocResult<bool> {
        let validation = {
            let registries = self.state.registries.read();
            validate_chain_data(&msg, &registries)
        };
        if let Err(err) = validation {
            crate::metrics::record_chain_data_rejected();
            warn!("[qc-08] rejected chain data {:02x?}: {err}", &msg.hash()[..4]);
            return Err(err);
        }
        if !self.state.chain_data.write().insert_pending(msg.clone()) {
            return Ok(false);
        }
        debug!("[qc-08] queued chain data {:02x?}", &msg.hash()[..4]);
        self.network
            .relay_chain_data(msg)
            .await
            .map_err(PocError::Network)?;
        Ok(true)
    }

    async fn accept_nonce_pool(&self, msg: NoncePoolMsg) -> PocResult<()> {
        if msg.cvn_id == self.node_id() {
            return Ok(());
        }
        let spacing = {
            let registries = self.state.registries.read();
            validate_nonce_pool(
                &msg,
                &registries.cvns,
                self.config.min_nonce_pool_size,
                self.config.max_nonce_pool_size,
            )?;
            registries.params.block_spacing
        };
        let activation = activation_height(msg.created_height);
        let consumed = match self.chain.tip() {
            Some(tip) if activation <= tip.height() => self.attempts_spent(&tip, activation, spacing),
            _ => 0,
        };
        if self.state.nonces.write().install(&msg, consumed)? {
            debug!(
                cvn = msg.cvn_id,
                size = msg.public_nonces.len(),
                "[qc-08] installed nonce pool"
            );
            self.network
                .relay_nonce_pool(msg)
                .await
                .map_err(PocError::Network)?;
        }
        Ok(())
    }

    /// Verify a partial against the current round or buffer it for later.
    async fn accept_partial_signature(&self, sig: CvnPartialSignature) -> PocResult<()> {
        {
            let registries = self.state.registries.read();
            if !registries.cvns.contains(sig.signer_id) {
                return Err(PocError::UnknownValidator(sig.signer_id));
            }
            if registries.cvns.is_banned(sig.signer_id) {
                return Err(PocError::BannedValidator(sig.signer_id));
            }
        }
        if self.is_stale_tip(&sig.prev_block_hash) {
            debug!(signer = sig.signer_id, "[qc-08] dropped partial signature for stale tip");
            return Ok(());
        }

        let round = *self.state.current_round.read();
        let current = round.filter(|r| {
            r.tip_hash == sig.prev_block_hash
                && r.creator_id == sig.creator_id
                && self.state.nonces.read().reservation(&r.tip_hash, r.attempt).is_some()
        });
        let Some(round) = current else {
            self.buffer_partial(sig);
            return Ok(());
        };

        if self.verify_and_store(&sig, round.attempt)? {
            self.network
                .relay_cvn_signature(sig)
                .await
                .map_err(PocError::Network)?;
        }
        Ok(())
    }

    /// Returns true when the signer is new to its bucket.
    fn verify_and_store(&self, sig: &CvnPartialSignature, attempt: u64) -> PocResult<bool> {
        let verified = {
            let registries = self.state.registries.read();
            let active = registries.cvns.active_ids();
            let nonces = self.state.nonces.read();
            match nonces.reservation(&sig.prev_block_hash, attempt) {
                Some(reserved) => verify_partial_signature(sig, &active, reserved, &registries.cvns),
                None => Err(PocError::NoncePoolExhausted(sig.signer_id)),
            }
        };
        crate::metrics::record_partial_signature(verified.is_ok());
        if let Err(err) = verified {
            warn!(
                signer = sig.signer_id,
                creator = sig.creator_id,
                "[qc-08] rejected partial signature: {err}"
            );
            return Err(err);
        }
        Ok(self.state.signatures.write().add_sig(sig.clone()))
    }

    /// Keep a partial for the current tip or for a block not seen yet.
    fn buffer_partial(&self, sig: CvnPartialSignature) {
        let tip = self.chain.tip();
        let tip_hash = tip.as_ref().map(|t| t.hash);
        if tip_hash != Some(sig.prev_block_hash) && self.chain.block(&sig.prev_block_hash).is_some() {
            return;
        }
        let height = tip.map_or(0, |t| t.height());
        if !self.state.buffered.lock().push(sig, height, tip_hash.as_ref()) {
            debug!("[qc-08] partial signature already buffered");
        }
    }

    /// Verify buffered partials that belong to the current round.
    fn drain_buffered(&self) {
        let Some(round) = *self.state.current_round.read() else {
            return;
        };
        if self
            .state
            .nonces
            .read()
            .reservation(&round.tip_hash, round.attempt)
            .is_none()
        {
            return;
        }
        let pending = self
            .state
            .buffered
            .lock()
            .take_round(&round.tip_hash, round.creator_id);
        for sig in pending {
            // already logged on failure
            let _ = self.verify_and_store(&sig, round.attempt);
        }
    }

    /// Drop buffered partials that can no longer match a round: those for
    /// known blocks other than `tip`, and those for unknown blocks received
    /// more than [`UNKNOWN_TIP_WINDOW`] blocks ago.
    fn purge_buffered(&self, tip: &BlockIndexEntry) {
        let height = tip.height();
        self.state.buffered.lock().retain(|sig, seen_at| {
            sig.prev_block_hash == tip.hash
                || (self.chain.block(&sig.prev_block_hash).is_none()
                    && seen_at + UNKNOWN_TIP_WINDOW >= height)
        });
    }

    /// Cooperation proof of a header against its parent in the chain view.
    pub fn verify_header(&self, header: &BlockHeader) -> PocResult<()> {
        let parent = self
            .chain
            .block(&header.prev_hash)
            .ok_or_else(|| PocError::InvalidBlock {
                hash: header.hash(),
                reason: "unknown parent".into(),
            })?;
        let registries = self.state.registries.read();
        let ranking = self
            .state
            .selector
            .ranking(self.chain.as_ref(), &parent, &registries);
        ProofValidator::check_proof_of_cooperation(
            header,
            &parent,
            &ranking,
            &registries,
            self.time_source.now(),
            self.config.max_timestamp_drift_secs,
        )
    }

    /// Known block other than the current tip.
    fn is_stale_tip(&self, hash: &Hash) -> bool {
        match (self.chain.tip(), self.chain.block(hash)) {
            (Some(tip), Some(block)) => block.hash != tip.hash && block.height() <= tip.height(),
            _ => false,
        }
    }
}

#[async_trait]
impl<C, N, S> PocApi for PocService<C, N, S>
where
    C: ChainView + 'static,
    N: PocNetwork + 'static,
    S: NonceStore + 'static,
{
    fn check_proof_of_cooperation(&self, header: &BlockHeader) -> PocResult<()> {
        self.verify_header(header)
    }

    fn check_next_block_creator(&self, tip: &BlockIndexEntry, time: u64) -> Option<CvnId> {
        let registries = self.state.registries.read();
        self.state
            .selector
            .check_next_block_creator(self.chain.as_ref(), tip, time, &registries)
    }

    async fn handle_message(&self, msg: PocMessage) -> PocResult<()> {
        match msg {
            PocMessage::ChainData(msg) => self.accept_chain_data(msg).await.map(|_| ()),
            PocMessage::PartialSignature(sig) => self.accept_partial_signature(sig).await,
            PocMessage::NoncePool(msg) => self.accept_nonce_pool(msg).await,
        }
    }

    async fn add_chain_data(&self, msg: ChainDataMsg) -> PocResult<bool> {
        self.accept_chain_data(msg).await
    }

    async fn state(&self) -> PocState {
        self.holder.lock().await.state
    }

    fn ban_candidates(&self) -> Vec<CvnId> {
        self.state.ban_candidates(self.config.creator_retry_budget)
    }
}
