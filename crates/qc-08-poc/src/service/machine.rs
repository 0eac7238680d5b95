//! Poll-driven production state machine
//!
//! Every poll reads the chain tip and the clock, derives the creator and
//! rotation attempt for this moment and resets the holder when either the
//! tip or the attempt moved. The remaining transitions are taken in place
//! until the state stops changing.

use super::PocService;
use crate::domain::{
    activation_height, combine_bucket, create_nonce_pool, create_partial_signature, payload_root,
    required_signatures, validate_chain_data, Block, BlockHeader, BlockIndexEntry, BucketKey,
    ChainDataMsg, CvnId, CvnPartialSignature, PocError, PocResult, PocState, PocStateHolder,
    RoundContext, TipRef, BLOCK_VERSION,
};
use crate::ports::{ChainView, NonceStore, PocNetwork};
use crate::state::CurrentRound;
use crate::validation::ProofValidator;
use shared_crypto::{sign_hash, Hash, SecretNonce};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Transitions taken within one poll
const MAX_STEPS_PER_POLL: usize = 6;

impl<C, N, S> PocService<C, N, S>
where
    C: ChainView,
    N: PocNetwork,
    S: NonceStore,
{
    /// Advance the state machine as far as the current inputs allow.
    pub async fn poll(&self) -> PocResult<PocState> {
        let mut holder = self.holder.lock().await;
        let Some(tip) = self.chain.tip() else {
            holder.idle();
            return Ok(holder.state);
        };

        let data_complete = self.sync_chain_data(&tip)?;
        if holder.state == PocState::Init {
            info!(
                node = self.node_id(),
                height = tip.height(),
                "[qc-08] initializing proof-of-cooperation"
            );
            self.restore_nonces(&tip)?;
        }

        let now = self.time_source.now();
        let (ranking, spacing) = {
            let registries = self.state.registries.read();
            let ranking = self
                .state
                .selector
                .ranking(self.chain.as_ref(), &tip, &registries);
            (ranking, registries.params.block_spacing)
        };
        let attempt = ranking.attempt_at(now, spacing);
        let next = ranking.creator_for_attempt(attempt);

        let mut transitions = 0usize;
        if holder.is_stale(&tip.hash, next, attempt) {
            self.begin_round(&mut holder, &tip, next, attempt, spacing)?;
            transitions += 1;
        }

        for _ in 0..MAX_STEPS_PER_POLL {
            let before = holder.state;
            match self.step(&mut holder, &tip, data_complete).await {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    error!(state = %before, "[qc-08] fatal: {err}");
                    return Err(err);
                }
                Err(err) => {
                    warn!(state = %before, "[qc-08] {err}");
                    break;
                }
            }
            if holder.state == before {
                break;
            }
            info!(from = %before, to = %holder.state, "[qc-08] state transition");
            transitions += 1;
        }

        if transitions == 0 {
            holder.idle();
        } else {
            holder.active();
        }
        Ok(holder.state)
    }

    /// Poll until `shutdown` flips to true or a fatal error occurs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> PocResult<()> {
        info!(
            node = self.node_id(),
            "[qc-08] 🚀 proof-of-cooperation service started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = self.poll().await {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!("[qc-08] poll failed: {err}");
            }
            let delay = {
                let holder = self.holder.lock().await;
                holder.backoff(self.config.poll_interval(), self.config.max_poll_backoff())
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("[qc-08] proof-of-cooperation service stopped");
        Ok(())
    }

    fn begin_round(
        &self,
        holder: &mut PocStateHolder,
        tip: &BlockIndexEntry,
        next: Option<CvnId>,
        attempt: u64,
        spacing: u32,
    ) -> PocResult<()> {
        let old_tip = holder.prev;
        let carried = if old_tip.map(|t| t.hash) == Some(tip.hash) {
            self.carried_non_signers(holder)
        } else {
            Vec::new()
        };

        holder.reset(next, attempt, TipRef::from(tip));
        *self.state.current_round.write() = next.map(|creator_id| CurrentRound {
            tip_hash: tip.hash,
            creator_id,
            attempt,
        });
        self.purge_buffered(tip);

        if holder.new_tip() {
            let consumed = old_tip.map_or(0, |old| self.attempts_spent(tip, old.height, spacing));
            self.state.nonces.write().advance_tip(tip.hash, tip.height(), consumed, |created| {
                self.attempts_spent(tip, activation_height(created), spacing)
            });
            self.state.signatures.write().retain_tip(&tip.hash);
            self.state.clear_failures(tip.header.creator_id);
            self.persist_nonces()?;
            debug!(
                height = tip.height(),
                creator = ?next,
                consumed,
                "[qc-08] new tip"
            );
        } else if holder.block_spacing_timeout() {
            if let Some(failed) = holder.last_creator {
                let failures = self.state.record_failure(failed);
                crate::metrics::record_creator_timeout();
                warn!(
                    creator = failed,
                    failures,
                    attempt,
                    "[qc-08] ⏰ block spacing timeout, rotating creator"
                );
                self.state.signatures.write().remove_round(&tip.hash, failed);
            }
            self.state
                .nonces
                .write()
                .remove_round(&tip.hash, holder.last_attempt);
            self.persist_nonces()?;
            holder.missing_signatures = carried;
        }
        Ok(())
    }

    /// Validators that did not sign the abandoned round: the missing set and
    /// unsigned members of the bucket the local node signed, or of the
    /// bucket closest to completion.
    fn carried_non_signers(&self, holder: &PocStateHolder) -> Vec<CvnId> {
        let (Some(tip), Some(creator)) = (holder.prev_block_hash(), holder.next_creator) else {
            return Vec::new();
        };
        let active = self.state.registries.read().cvns.active_ids();
        let signatures = self.state.signatures.read();
        let missing = signatures.get_missing(&tip, creator, &active);
        let own = missing.iter().find(|(set, _)| {
            signatures
                .get_signature(set, &tip, creator, self.node_id())
                .is_some()
        });
        let chosen = own.or_else(|| missing.iter().min_by_key(|(_, unsigned)| unsigned.len()));
        let mut ids: Vec<CvnId> = chosen
            .map(|(set, unsigned)| set.iter().chain(unsigned.iter()).copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    async fn step(
        &self,
        holder: &mut PocStateHolder,
        tip: &BlockIndexEntry,
        data_complete: bool,
    ) -> PocResult<()> {
        match holder.state {
            PocState::Init => {
                holder.state = PocState::NoncePoolChanges;
                Ok(())
            }
            PocState::NoncePoolChanges => self.step_nonce_pool(holder, tip).await,
            PocState::CreateSignature => self.step_create_signature(holder, tip, data_complete).await,
            PocState::WaitingForSignatures => self.step_collect(holder, tip).await,
            PocState::WaitingForBlock => {
                self.step_await_block(holder, tip);
                Ok(())
            }
            PocState::WaitingForNewTip => Ok(()),
            PocState::WaitingForCvnData => {
                self.step_cvn_data(holder, data_complete);
                Ok(())
            }
        }
    }

    /// Registered, not banned, and holding the registered key.
    fn is_local_validator(&self) -> bool {
        let registries = self.state.registries.read();
        registries.cvns.is_active(self.node_id())
            && registries
                .cvns
                .pubkey(self.node_id())
                .is_ok_and(|key| *key == self.secret_key.public_key())
    }

    async fn step_nonce_pool(&self, holder: &mut PocStateHolder, tip: &BlockIndexEntry) -> PocResult<()> {
        if !self.is_local_validator() {
            holder.state = PocState::WaitingForCvnData;
            return Ok(());
        }
        self.refresh_nonce_pool(tip).await?;
        holder.state = PocState::CreateSignature;
        Ok(())
    }

    /// Announce a new pool when the local one runs low, at most once per
    /// wait period. Secrets reach the nonce file before anything else sees
    /// the pool.
    async fn refresh_nonce_pool(&self, tip: &BlockIndexEntry) -> PocResult<()> {
        let needs_refresh = self
            .state
            .nonces
            .read()
            .needs_refresh(self.config.nonce_refresh_floor);
        let now = self.time_source.now();
        let waited = self
            .last_pool_announcement
            .lock()
            .map_or(true, |last| now.saturating_sub(last) >= self.config.nonce_pool_wait_secs);

        if needs_refresh && waited {
            let (msg, records) = create_nonce_pool(
                self.node_id(),
                tip.height(),
                self.config.nonce_pool_size,
                &self.secret_key,
            )?;
            let secrets = records
                .iter()
                .map(|r| SecretNonce::from_bytes(r.secret))
                .collect::<Result<Vec<_>, _>>()?;
            let mut all = self.state.nonces.read().local_records();
            all.extend(records);
            self.nonce_store.write(&all)?;
            self.state.nonces.write().install_local(&msg, secrets)?;
            *self.last_pool_announcement.lock() = Some(now);
            *self.unpublished_pool.lock() = Some(msg);
            crate::metrics::record_nonce_pool_created();
            info!(
                size = self.config.nonce_pool_size,
                height = tip.height(),
                "[qc-08] 🎲 created nonce pool"
            );
        }

        let unpublished = self.unpublished_pool.lock().clone();
        if let Some(msg) = unpublished {
            match self.network.relay_nonce_pool(msg).await {
                Ok(()) => *self.unpublished_pool.lock() = None,
                Err(err) => warn!("[qc-08] nonce pool announcement failed: {err}"),
            }
        }
        Ok(())
    }

    async fn step_create_signature(
        &self,
        holder: &mut PocStateHolder,
        tip: &BlockIndexEntry,
        data_complete: bool,
    ) -> PocResult<()> {
        if !data_complete {
            holder.state = PocState::WaitingForCvnData;
            return Ok(());
        }
        let creator = holder.next_creator.ok_or(PocError::NoCreator)?;
        let attempt = holder.attempt;
        let node = self.node_id();

        let (active, required) = {
            let registries = self.state.registries.read();
            let active = registries.cvns.active_ids();
            let required = required_signatures(
                active.len(),
                registries.params.percentage_of_signatures_mean,
            );
            (active, required)
        };
        let reserved: Vec<CvnId> = self
            .state
            .nonces
            .write()
            .reserve_round(attempt, &active)
            .map(|round| round.nonces.keys().copied().collect())
            .unwrap_or_default();

        let carried = &holder.missing_signatures;
        let mut signers: Vec<CvnId> = reserved
            .iter()
            .copied()
            .filter(|id| *id == creator || carried.binary_search(id).is_err())
            .collect();
        if signers.len() < required {
            signers = reserved;
        }
        if signers.len() < required || signers.binary_search(&creator).is_err() {
            debug!(
                creator,
                attempt,
                signers = signers.len(),
                required,
                "[qc-08] round cannot reach quorum, waiting for rotation"
            );
            holder.state = PocState::WaitingForSignatures;
            return Ok(());
        }
        let missing: Vec<CvnId> = active
            .iter()
            .copied()
            .filter(|id| signers.binary_search(id).is_err())
            .collect();
        holder.missing_signatures = missing.clone();

        if signers.binary_search(&node).is_ok() {
            let secret = self.state.nonces.write().take_local_secret(&tip.hash, attempt);
            match secret {
                Some(secret) => {
                    self.persist_nonces()?;
                    let sig = self.sign_round(tip.hash, creator, attempt, &missing, &signers, &secret)?;
                    self.state.signatures.write().add_sig(sig.clone());
                    debug!(creator, attempt, missing = ?missing, "[qc-08] signed round");
                    if let Err(err) = self.network.relay_cvn_signature(sig).await {
                        warn!("[qc-08] partial signature relay failed: {err}");
                    }
                }
                None => debug!(attempt, "[qc-08] no unused local nonce for this round"),
            }
        }
        self.drain_buffered();
        holder.state = PocState::WaitingForSignatures;
        Ok(())
    }

    fn sign_round(
        &self,
        tip_hash: Hash,
        creator: CvnId,
        attempt: u64,
        missing: &[CvnId],
        signers: &[CvnId],
        secret: &SecretNonce,
    ) -> PocResult<CvnPartialSignature> {
        let registries = self.state.registries.read();
        let nonces = self.state.nonces.read();
        let reserved = nonces
            .reservation(&tip_hash, attempt)
            .ok_or(PocError::NoncePoolExhausted(self.node_id()))?;
        let ctx = RoundContext {
            prev_block_hash: tip_hash,
            creator_id: creator,
            missing,
            signers,
        };
        create_partial_signature(
            &ctx,
            self.node_id(),
            &self.secret_key,
            secret,
            reserved,
            &registries.cvns,
        )
    }

    async fn step_collect(&self, holder: &mut PocStateHolder, tip: &BlockIndexEntry) -> PocResult<()> {
        self.drain_buffered();
        let Some(creator) = holder.next_creator else {
            return Ok(());
        };
        let (active, required) = {
            let registries = self.state.registries.read();
            let active = registries.cvns.active_ids();
            let required = required_signatures(
                active.len(),
                registries.params.percentage_of_signatures_mean,
            );
            (active, required)
        };
        let complete = self
            .state
            .signatures
            .read()
            .complete_bucket(&tip.hash, creator, &active, required)
            .map(|(key, partials)| (key, partials.into_iter().cloned().collect::<Vec<_>>()));
        let Some((bucket, partials)) = complete else {
            return Ok(());
        };
        if holder.is_creator() {
            self.produce_block(tip, &bucket, &partials, required).await?;
        }
        holder.state = PocState::WaitingForBlock;
        Ok(())
    }

    /// Combine a complete bucket into a block and submit it.
    async fn produce_block(
        &self,
        tip: &BlockIndexEntry,
        bucket: &BucketKey,
        partials: &[CvnPartialSignature],
        required: usize,
    ) -> PocResult<()> {
        let refs: Vec<&CvnPartialSignature> = partials.iter().collect();
        let chain_multi_sig = combine_bucket(&refs, required)?;
        let now = self.time_source.now();

        let block = {
            let registries = self.state.registries.read();
            let mut scratch = registries.clone();
            let mut chain_data: Vec<ChainDataMsg> = Vec::new();
            for msg in self.state.chain_data.read().pending_messages() {
                if chain_data.len() >= self.config.max_chain_data_per_block {
                    break;
                }
                match validate_chain_data(&msg, &scratch)
                    .and_then(|()| scratch.update_chain_data(&msg, tip.height() + 1))
                {
                    Ok(()) => chain_data.push(msg),
                    Err(err) => debug!("[qc-08] leaving chain data out of block: {err}"),
                }
            }

            let data_refs: Vec<Hash> = chain_data.iter().map(ChainDataMsg::hash).collect();
            let mut header = BlockHeader {
                version: BLOCK_VERSION,
                prev_hash: tip.hash,
                payload_root: payload_root(&data_refs),
                time: now.max(tip.time() + 1),
                height: tip.height() + 1,
                creator_id: bucket.creator_id,
                missing_signer_ids: bucket.missing.clone(),
                chain_data_refs: data_refs,
                chain_multi_sig: Some(chain_multi_sig),
                creator_signature: None,
            };
            header.creator_signature = Some(sign_hash(&self.secret_key, &header.signing_hash())?);
            let block = Block { header, chain_data };

            let ranking = self
                .state
                .selector
                .ranking(self.chain.as_ref(), tip, &registries);
            ProofValidator::check_proof_of_cooperation(
                &block.header,
                tip,
                &ranking,
                &registries,
                now,
                self.config.max_timestamp_drift_secs,
            )?;
            ProofValidator::validate_payload(&block, &registries)?;
            block
        };

        let height = block.header.height;
        let missing = block.header.missing_signer_ids.clone();
        self.network
            .submit_block(block)
            .await
            .map_err(PocError::Network)?;
        crate::metrics::record_block_produced();
        info!(
            height,
            signers = partials.len(),
            missing = ?missing,
            "[qc-08] ⛏️ block produced"
        );
        Ok(())
    }

    fn step_await_block(&self, holder: &mut PocStateHolder, tip: &BlockIndexEntry) {
        if let Some(child) = self.chain.block_by_prev_hash(&tip.hash) {
            match self.verify_header(&child.header) {
                Ok(()) => holder.state = PocState::WaitingForNewTip,
                Err(err) => debug!("[qc-08] ignoring child block: {err}"),
            }
        }
    }

    fn step_cvn_data(&self, holder: &mut PocStateHolder, data_complete: bool) {
        if !data_complete || !self.is_local_validator() {
            return;
        }
        let refresh = self
            .state
            .nonces
            .read()
            .needs_refresh(self.config.nonce_refresh_floor);
        holder.state = if refresh {
            PocState::NoncePoolChanges
        } else {
            PocState::CreateSignature
        };
    }
}
