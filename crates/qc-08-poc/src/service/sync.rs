//! Chain-data replay and nonce file restore

use super::PocService;
use crate::domain::{BlockIndexEntry, ChainDataMsg, CvnId, NoncePoolMsg, PocError, PocResult};
use crate::ports::{ChainView, NonceStore, PocNetwork};
use shared_crypto::{Hash, SecretNonce};
use std::collections::HashSet;
use tracing::{debug, info, warn};

impl<C, N, S> PocService<C, N, S>
where
    C: ChainView,
    N: PocNetwork,
    S: NonceStore,
{
    /// Bring the registries up to `tip` by applying the chain data of every
    /// block connected since the last sync.
    ///
    /// Returns false when a block references chain data that has not been
    /// received; the registries then stay at the last complete block.
    pub(super) fn sync_chain_data(&self, tip: &BlockIndexEntry) -> PocResult<bool> {
        let synced = self.synced.lock().clone();
        if synced.as_ref().map(|s| s.hash) == Some(tip.hash) {
            return Ok(true);
        }

        let mut path = Vec::new();
        let mut cursor = Some(tip.clone());
        let mut linked = synced.is_none();
        while let Some(entry) = cursor {
            if synced.as_ref().map(|s| s.hash) == Some(entry.hash) {
                linked = true;
                break;
            }
            cursor = self.chain.parent(&entry);
            path.push(entry);
        }
        if !linked {
            // the synced block left the active chain
            warn!(tip_height = tip.height(), "[qc-08] reorg detected, replaying chain data from genesis");
            *self.state.registries.write() = self.genesis.clone();
            self.state.selector.invalidate();
        }

        for entry in path.into_iter().rev() {
            if !entry.header.chain_data_refs.is_empty() {
                let Some(msgs) = self.block_chain_data(&entry) else {
                    return Ok(false);
                };
                self.apply_chain_data(&entry, &msgs)?;
            }
            *self.synced.lock() = Some(entry);
        }
        self.missing_chain_data.lock().clear();
        Ok(true)
    }

    /// Chain data carried by `entry`, from the stored body or the pending
    /// pool. Records the unresolved references when neither has it.
    fn block_chain_data(&self, entry: &BlockIndexEntry) -> Option<Vec<ChainDataMsg>> {
        if let Some(body) = self.chain.chain_data(&entry.hash) {
            return Some(body);
        }
        let store = self.state.chain_data.read();
        let mut msgs = Vec::with_capacity(entry.header.chain_data_refs.len());
        let mut unresolved: Vec<Hash> = Vec::new();
        for hash in &entry.header.chain_data_refs {
            match store.pending(hash) {
                Some(msg) => msgs.push(msg.clone()),
                None => unresolved.push(*hash),
            }
        }
        if unresolved.is_empty() {
            return Some(msgs);
        }
        debug!(
            height = entry.height(),
            missing = unresolved.len(),
            "[qc-08] waiting for referenced chain data"
        );
        *self.missing_chain_data.lock() = unresolved;
        None
    }

    fn apply_chain_data(&self, entry: &BlockIndexEntry, msgs: &[ChainDataMsg]) -> PocResult<()> {
        let mut dropped: Vec<CvnId> = Vec::new();
        {
            let mut registries = self.state.registries.write();
            let mut store = self.state.chain_data.write();
            for msg in msgs {
                registries.update_chain_data(msg, entry.height()).map_err(|err| {
                    PocError::InvalidChainData(format!(
                        "block at height {} carries unappliable chain data: {err}",
                        entry.height()
                    ))
                })?;
                store.mark_applied(msg, entry.height());
                if let Some(update) = &msg.cvn_update {
                    dropped.extend(update.removed.iter().chain(update.banned.iter()).copied());
                }
            }
        }
        if !dropped.is_empty() {
            let mut nonces = self.state.nonces.write();
            for id in &dropped {
                nonces.drop_validator(*id);
            }
        }
        self.state.selector.invalidate();
        info!(
            height = entry.height(),
            count = msgs.len(),
            "[qc-08] applied chain data"
        );
        Ok(())
    }

    /// Reload unused secrets from the nonce file and queue them for
    /// re-announcement as a fresh pool at the current tip.
    pub(super) fn restore_nonces(&self, tip: &BlockIndexEntry) -> PocResult<()> {
        let records = self.nonce_store.read()?;
        if records.is_empty() {
            return Ok(());
        }
        let mut seen = HashSet::with_capacity(records.len());
        let mut publics = Vec::new();
        let mut secrets = Vec::new();
        for record in records {
            if secrets.len() >= self.config.max_nonce_pool_size {
                break;
            }
            if !seen.insert(record.public) {
                continue;
            }
            let secret = SecretNonce::from_bytes(record.secret)?;
            if secret.public_nonce() != record.public {
                warn!("[qc-08] skipping corrupt nonce record");
                continue;
            }
            publics.push(record.public);
            secrets.push(secret);
        }
        if secrets.is_empty() {
            return Ok(());
        }

        let count = secrets.len();
        let msg = NoncePoolMsg::new_signed(self.node_id(), tip.height(), publics, &self.secret_key)?;
        self.state.nonces.write().install_local(&msg, secrets)?;
        self.persist_nonces()?;
        *self.unpublished_pool.lock() = Some(msg);
        info!(count, height = tip.height(), "[qc-08] restored nonces from pool file");
        Ok(())
    }

    /// Rewrite the nonce file with every local secret still unused.
    pub(super) fn persist_nonces(&self) -> PocResult<()> {
        let records = self.state.nonces.read().local_records();
        self.nonce_store.write(&records)
    }
}
