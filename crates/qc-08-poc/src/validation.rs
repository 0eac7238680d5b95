use crate::domain::{
    check_for_duplicate_chain_admins, check_for_duplicate_cvns,
    check_for_duplicate_missing_chain_sigs, required_signatures, round_message,
    validate_chain_data, Block, BlockHeader, BlockIndexEntry, ChainRegistries, CreatorRanking,
    CvnId, PocError, PocResult,
};
use shared_crypto::{verify, verify_hash, Hash};
use std::collections::HashSet;

fn invalid(header: &BlockHeader, reason: impl Into<String>) -> PocError {
    PocError::InvalidBlock {
        hash: header.hash(),
        reason: reason.into(),
    }
}

/// Stateless validation of cooperation proofs.
pub struct ProofValidator;

impl ProofValidator {
    /// Header must extend `parent` directly.
    pub fn validate_linkage(header: &BlockHeader, parent: &BlockIndexEntry) -> PocResult<()> {
        if header.prev_hash != parent.hash {
            return Err(invalid(header, "does not extend the current tip"));
        }
        if header.height != parent.height() + 1 {
            return Err(invalid(
                header,
                format!("height {} after parent {}", header.height, parent.height()),
            ));
        }
        Ok(())
    }

    /// Timestamp after the parent and not beyond the allowed drift.
    pub fn validate_timestamp(
        header: &BlockHeader,
        parent: &BlockIndexEntry,
        now: u64,
        max_drift: u64,
    ) -> PocResult<()> {
        if header.time <= parent.time() {
            return Err(invalid(
                header,
                format!("time {} not after parent {}", header.time, parent.time()),
            ));
        }
        if header.time > now.saturating_add(max_drift) {
            return Err(invalid(header, format!("time {} in the future", header.time)));
        }
        Ok(())
    }

    /// The creator owns the rotation slot the header time falls into.
    pub fn validate_creator(
        header: &BlockHeader,
        ranking: &CreatorRanking,
        spacing: u32,
    ) -> PocResult<()> {
        match ranking.creator_at(header.time, spacing) {
            Some(entitled) if entitled == header.creator_id => Ok(()),
            Some(entitled) => Err(invalid(
                header,
                format!(
                    "creator {:#010x} not entitled, slot belongs to {entitled:#010x}",
                    header.creator_id
                ),
            )),
            None => Err(PocError::NoCreator),
        }
    }

    /// Missing set is well formed; returns the participating signers.
    pub fn validate_missing_set(
        header: &BlockHeader,
        registries: &ChainRegistries,
    ) -> PocResult<Vec<CvnId>> {
        let missing = &header.missing_signer_ids;
        check_for_duplicate_missing_chain_sigs(missing)?;
        if missing.binary_search(&header.creator_id).is_ok() {
            return Err(invalid(header, "creator listed as missing"));
        }
        let active = registries.cvns.active_ids();
        if let Some(unknown) = missing.iter().find(|id| active.binary_search(id).is_err()) {
            return Err(PocError::UnknownValidator(*unknown));
        }
        let signers: Vec<CvnId> = active
            .iter()
            .copied()
            .filter(|id| missing.binary_search(id).is_err())
            .collect();
        let required = required_signatures(
            active.len(),
            registries.params.percentage_of_signatures_mean,
        );
        if signers.len() < required {
            return Err(PocError::InsufficientSignatures {
                got: signers.len(),
                required,
            });
        }
        Ok(signers)
    }

    /// Aggregate signature of `signers` over the round message.
    pub fn validate_chain_signature(
        header: &BlockHeader,
        signers: &[CvnId],
        registries: &ChainRegistries,
    ) -> PocResult<()> {
        let sig = header
            .chain_multi_sig
            .as_ref()
            .ok_or_else(|| invalid(header, "missing chain signature"))?;
        let aggregate_key = registries.cvns.aggregate_key(signers)?;
        let message = round_message(&header.prev_hash, header.creator_id, &header.missing_signer_ids);
        if !verify(sig, &message, &aggregate_key) {
            return Err(invalid(header, "chain signature does not verify"));
        }
        Ok(())
    }

    pub fn validate_creator_signature(
        header: &BlockHeader,
        registries: &ChainRegistries,
    ) -> PocResult<()> {
        let sig = header
            .creator_signature
            .as_ref()
            .ok_or_else(|| invalid(header, "missing creator signature"))?;
        let pubkey = registries.cvns.pubkey(header.creator_id)?;
        if !verify_hash(sig, &header.signing_hash(), pubkey) {
            return Err(invalid(header, "creator signature does not verify"));
        }
        Ok(())
    }

    /// Full header check for a block extending `parent`.
    pub fn check_proof_of_cooperation(
        header: &BlockHeader,
        parent: &BlockIndexEntry,
        ranking: &CreatorRanking,
        registries: &ChainRegistries,
        now: u64,
        max_drift: u64,
    ) -> PocResult<()> {
        Self::validate_linkage(header, parent)?;
        Self::validate_timestamp(header, parent, now, max_drift)?;
        Self::validate_creator(header, ranking, registries.params.block_spacing)?;
        let signers = Self::validate_missing_set(header, registries)?;
        Self::validate_chain_signature(header, &signers, registries)?;
        Self::validate_creator_signature(header, registries)
    }

    /// Payload commitment, chain-data validity and duplicate checks.
    ///
    /// Messages are validated in order against registries updated by the
    /// messages before them.
    pub fn validate_payload(block: &Block, registries: &ChainRegistries) -> PocResult<()> {
        let header = &block.header;
        if !block.payload_matches() {
            return Err(invalid(header, "payload root mismatch"));
        }
        let mut seen: HashSet<Hash> = HashSet::new();
        let mut added_cvns = Vec::new();
        let mut added_admins = Vec::new();
        let mut scratch = registries.clone();
        for msg in &block.chain_data {
            if !seen.insert(msg.hash()) {
                return Err(PocError::DuplicateEntry("chain data included twice".into()));
            }
            validate_chain_data(msg, &scratch)?;
            scratch.update_chain_data(msg, header.height)?;
            if let Some(update) = &msg.cvn_update {
                added_cvns.extend(update.added.iter().cloned());
            }
            if let Some(update) = &msg.admin_update {
                added_admins.extend(update.added.iter().cloned());
            }
        }
        check_for_duplicate_cvns(&added_cvns)?;
        check_for_duplicate_chain_admins(&added_admins)
    }
}
