//! # Proof-of-Cooperation Scenarios
//!
//! Several validators share one chain and one clock. Each poll drives a
//! validator's state machine; `deliver` floods whatever the validators
//! relayed to every other validator until the network is quiet.
//!
//! On genesis every validator carries the same weight, so the rotation
//! order is by id and attempt `n` belongs to validator `n % len + 1`.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use qc_08_poc::domain::GENESIS_ADMIN_ID;
    use qc_08_poc::{
        Block, BlockHeader, ChainAdmin, ChainDataMsg, ChainView, CvnId, CvnInfo,
        DynamicChainParams, FileNonceStore, InMemoryChain, InMemoryNetwork, ManualClock,
        MemoryNonceStore, NonceStore, PocApi, PocConfig, PocDependencies, PocError, PocMessage,
        PocService, TimeSource,
    };
    use shared_crypto::{Hash, SecretKey};

    use crate::integration::init_tracing;

    const GENESIS_TIME: u64 = 1_700_000_000;
    const SPACING: u32 = 60;

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    struct Validator<S: NonceStore> {
        service: PocService<InMemoryChain, InMemoryNetwork, S>,
        network: Arc<InMemoryNetwork>,
    }

    struct Network {
        chain: Arc<InMemoryChain>,
        clock: Arc<ManualClock>,
        keys: Vec<SecretKey>,
        admin_keys: Vec<SecretKey>,
        params: DynamicChainParams,
        validators: Vec<Validator<MemoryNonceStore>>,
    }

    fn params(percentage: u32, min_admin_sigs: u32) -> DynamicChainParams {
        DynamicChainParams {
            block_spacing: SPACING,
            percentage_of_signatures_mean: percentage,
            min_admin_sigs,
            ..DynamicChainParams::default()
        }
    }

    fn config(node_id: CvnId, params: DynamicChainParams) -> PocConfig {
        PocConfig {
            node_id,
            nonce_pool_size: 10,
            nonce_refresh_floor: 3,
            genesis_params: params,
            ..PocConfig::default()
        }
    }

    impl Network {
        fn new(size: u32, admins: u32, params: DynamicChainParams) -> Self {
            init_tracing();
            let keys: Vec<SecretKey> = (0..size).map(|_| SecretKey::generate()).collect();
            let admin_keys: Vec<SecretKey> = (0..admins).map(|_| SecretKey::generate()).collect();
            let chain = Arc::new(InMemoryChain::with_genesis(BlockHeader::genesis(GENESIS_TIME)));
            let clock = Arc::new(ManualClock::new(GENESIS_TIME + 1));
            let mut network = Self {
                chain,
                clock,
                keys,
                admin_keys,
                params,
                validators: Vec::new(),
            };
            network.validators = (1..=size)
                .map(|id| network.spawn(id, Arc::new(MemoryNonceStore::new())))
                .collect();
            network
        }

        fn cvns(&self) -> Vec<CvnInfo> {
            self.keys
                .iter()
                .zip(1..)
                .map(|(key, id)| CvnInfo::new(id, key.public_key()))
                .collect()
        }

        fn admins(&self) -> Vec<ChainAdmin> {
            self.admin_keys
                .iter()
                .zip(GENESIS_ADMIN_ID..)
                .map(|(key, id)| ChainAdmin {
                    id,
                    pubkey: key.public_key(),
                    coin_supply: false,
                })
                .collect()
        }

        fn spawn<S: NonceStore + 'static>(&self, id: CvnId, store: Arc<S>) -> Validator<S> {
            let network = Arc::new(InMemoryNetwork::new());
            let service = PocService::new(PocDependencies {
                chain: Arc::clone(&self.chain),
                network: Arc::clone(&network),
                nonce_store: store,
                time_source: self.clock.clone(),
                secret_key: self.keys[id as usize - 1].clone(),
                config: config(id, self.params),
                genesis_cvns: self.cvns(),
                genesis_admins: self.admins(),
            })
            .expect("valid validator config");
            Validator { service, network }
        }

        fn validator(&self, id: CvnId) -> &Validator<MemoryNonceStore> {
            &self.validators[id as usize - 1]
        }

        fn active(&self) -> Vec<CvnId> {
            (1..=self.validators.len() as CvnId).collect()
        }

        fn genesis_hash(&self) -> Hash {
            self.chain.tip().expect("genesis connected").hash
        }

        async fn poll(&self, ids: &[CvnId]) {
            for id in ids {
                self.validator(*id).service.poll().await.expect("poll");
            }
        }

        async fn deliver(&self) {
            loop {
                let mut delivered = false;
                for (i, from) in self.validators.iter().enumerate() {
                    for msg in from.network.take_messages() {
                        delivered = true;
                        for (j, to) in self.validators.iter().enumerate() {
                            if i != j {
                                let _ = to.service.handle_message(msg.clone()).await;
                            }
                        }
                    }
                }
                if !delivered {
                    break;
                }
            }
        }

        fn submitted_blocks(&self) -> Vec<Block> {
            self.validators
                .iter()
                .flat_map(|v| v.network.take_blocks())
                .collect()
        }

        /// Move the clock into the slot of rotation attempt `attempt` on genesis.
        fn enter_attempt(&self, attempt: u64) {
            self.clock.set(GENESIS_TIME + (attempt + 1) * SPACING as u64);
        }

        fn chain_data(&self, params: DynamicChainParams, signers: &[usize]) -> ChainDataMsg {
            let mut msg = ChainDataMsg::new(GENESIS_TIME).with_params(params);
            for index in signers {
                msg.sign(GENESIS_ADMIN_ID + *index as u32, &self.admin_keys[*index])
                    .expect("admin signature");
            }
            msg
        }
    }

    // =============================================================================
    // ROUNDS
    // =============================================================================

    #[tokio::test]
    async fn test_quorum_without_offline_validators() {
        // 60% of five validators: three signatures
        let network = Network::new(5, 1, params(60, 1));
        let genesis = network.genesis_hash();

        // validators 4 and 5 never come online
        network.poll(&[1, 2, 3]).await;
        network.deliver().await;

        // attempt 5 wraps back to validator 1
        network.enter_attempt(5);
        network.poll(&[1, 2, 3]).await;
        network.deliver().await;
        {
            let state = network.validator(1).service.shared_state();
            let signatures = state.signatures.read();
            let bucket = signatures
                .get_signature_set(&[4, 5], &genesis, 1)
                .expect("bucket for the missing set");
            assert_eq!(bucket.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        }

        network.poll(&[1]).await;
        let blocks = network.submitted_blocks();
        assert_eq!(blocks.len(), 1);
        let header = &blocks[0].header;
        assert_eq!(header.creator_id, 1);
        assert_eq!(header.missing_signer_ids, vec![4, 5]);
        for id in [2, 3, 4, 5] {
            assert!(network
                .validator(id)
                .service
                .check_proof_of_cooperation(header)
                .is_ok());
        }

        network.chain.connect(blocks[0].clone());
        network.poll(&[1, 2, 3]).await;
        assert_eq!(network.chain.height(), Some(1));
    }

    #[tokio::test]
    async fn test_spacing_timeout_hands_round_to_next_creator() {
        let network = Network::new(5, 1, params(60, 1));
        let genesis = network.genesis_hash();
        let active = network.active();

        // every pool is announced, then 4 and 5 stop signing
        network.poll(&active).await;
        network.deliver().await;
        network.enter_attempt(5);
        network.poll(&[1, 2, 3]).await;
        network.deliver().await;
        network.poll(&[1, 2, 3]).await;
        assert!(network.submitted_blocks().is_empty());
        {
            let state = network.validator(1).service.shared_state();
            let missing = state.signatures.read().get_missing(&genesis, 1, &active);
            assert_eq!(missing.get(&Vec::new()), Some(&vec![4, 5]));
        }

        network.enter_attempt(6);
        network.poll(&[1, 2, 3]).await;
        let tip = network.chain.tip().expect("genesis");
        for id in [1, 2, 3] {
            let service = &network.validator(id).service;
            assert!(service
                .shared_state()
                .signatures
                .read()
                .get_missing(&genesis, 1, &active)
                .is_empty());
            assert_eq!(
                service.check_next_block_creator(&tip, network.clock.now()),
                Some(2)
            );
        }

        network.deliver().await;
        network.poll(&[2]).await;
        let blocks = network.submitted_blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].header.creator_id, 2);
        assert_eq!(blocks[0].header.missing_signer_ids, vec![4, 5]);
        assert!(network
            .validator(5)
            .service
            .check_proof_of_cooperation(&blocks[0].header)
            .is_ok());
    }

    #[tokio::test]
    async fn test_creator_choice_is_deterministic_across_nodes() {
        let network = Network::new(4, 1, params(60, 1));
        let tip = network.chain.tip().expect("genesis");
        for attempt in 0..8u64 {
            let time = GENESIS_TIME + (attempt + 1) * SPACING as u64;
            let expected = (attempt % 4) as CvnId + 1;
            for id in network.active() {
                let service = &network.validator(id).service;
                assert_eq!(service.check_next_block_creator(&tip, time), Some(expected));
                service.shared_state().selector.invalidate();
                assert_eq!(service.check_next_block_creator(&tip, time), Some(expected));
            }
        }
    }

    // =============================================================================
    // CHAIN DATA
    // =============================================================================

    #[tokio::test]
    async fn test_under_signed_chain_data_is_rejected() {
        let network = Network::new(3, 2, params(100, 2));
        let validator = network.validator(1);
        let msg = network.chain_data(
            DynamicChainParams {
                block_spacing: 120,
                ..network.params
            },
            &[0],
        );
        let hash = msg.hash();

        let result = validator.service.add_chain_data(msg).await;
        assert!(matches!(result, Err(PocError::InvalidChainData(_))));
        assert!(validator
            .service
            .shared_state()
            .chain_data
            .read()
            .pending(&hash)
            .is_none());
        assert_eq!(validator.network.message_count(), 0);
    }

    #[tokio::test]
    async fn test_fully_signed_chain_data_is_relayed() {
        let network = Network::new(3, 2, params(100, 2));
        let msg = network.chain_data(
            DynamicChainParams {
                block_spacing: 120,
                ..network.params
            },
            &[0, 1],
        );
        let hash = msg.hash();

        assert!(network.validator(1).service.add_chain_data(msg).await.is_ok());
        network.deliver().await;
        for id in network.active() {
            let state = network.validator(id).service.shared_state();
            assert!(state.chain_data.read().pending(&hash).is_some());
        }
    }

    #[tokio::test]
    async fn test_out_of_bounds_parameters_are_never_applied() {
        let network = Network::new(3, 2, params(100, 2));
        let validator = network.validator(1);
        let msg = network.chain_data(
            DynamicChainParams {
                block_spacing: 10,
                ..network.params
            },
            &[0, 1],
        );

        let result = validator.service.add_chain_data(msg).await;
        assert!(matches!(result, Err(PocError::InvalidChainData(_))));
        assert_eq!(validator.service.registries().params.block_spacing, SPACING);
        assert_eq!(validator.network.message_count(), 0);
    }

    // =============================================================================
    // NONCE FILE
    // =============================================================================

    #[tokio::test]
    async fn test_restart_restores_pool_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pool.dat");
        let network = Network::new(3, 1, params(100, 1));

        let announced = {
            let store = Arc::new(FileNonceStore::open(&path).expect("open pool file"));
            // a second handle on the same file is refused
            assert!(FileNonceStore::open(&path).is_err());

            let validator = network.spawn(1, Arc::clone(&store));
            validator.service.poll().await.expect("poll");
            assert_eq!(store.read().expect("read").len(), 10);
            match validator.network.take_messages().as_slice() {
                [PocMessage::NoncePool(pool)] => pool.public_nonces.clone(),
                other => panic!("expected one pool announcement, got {other:?}"),
            }
        };

        let store = Arc::new(FileNonceStore::open(&path).expect("reopen pool file"));
        let validator = network.spawn(1, store);
        validator.service.poll().await.expect("poll after restart");
        let restored = validator
            .network
            .take_messages()
            .into_iter()
            .find_map(|msg| match msg {
                PocMessage::NoncePool(pool) => Some(pool),
                _ => None,
            })
            .expect("restored pool announced");
        assert_eq!(restored.cvn_id, 1);
        assert_eq!(restored.public_nonces, announced);
    }
}
