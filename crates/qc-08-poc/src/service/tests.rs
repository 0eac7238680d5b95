use super::*;
use crate::adapters::{InMemoryChain, InMemoryNetwork, ManualClock, MemoryNonceStore};
use crate::domain::{create_nonce_pool, Block, DynamicChainParams, GENESIS_ADMIN_ID};
use std::time::Duration;
use tokio::sync::watch;

const GENESIS_TIME: u64 = 1_700_000_000;
const SPACING: u32 = 60;

type TestService = PocService<InMemoryChain, InMemoryNetwork, MemoryNonceStore>;

struct TestNode {
    service: Arc<TestService>,
    network: Arc<InMemoryNetwork>,
    store: Arc<MemoryNonceStore>,
}

/// Validators 1..=n sharing one chain and one clock
struct Cluster {
    chain: Arc<InMemoryChain>,
    clock: Arc<ManualClock>,
    admin_key: SecretKey,
    nodes: Vec<TestNode>,
}

fn test_params(percentage: u32) -> DynamicChainParams {
    DynamicChainParams {
        block_spacing: SPACING,
        percentage_of_signatures_mean: percentage,
        ..DynamicChainParams::default()
    }
}

fn test_config(node_id: CvnId, percentage: u32) -> PocConfig {
    PocConfig {
        node_id,
        nonce_pool_size: 10,
        nonce_refresh_floor: 3,
        genesis_params: test_params(percentage),
        ..PocConfig::default()
    }
}

fn build_node(
    chain: &Arc<InMemoryChain>,
    clock: &Arc<ManualClock>,
    key: SecretKey,
    config: PocConfig,
    cvns: &[CvnInfo],
    admins: &[ChainAdmin],
    store: MemoryNonceStore,
) -> TestNode {
    let network = Arc::new(InMemoryNetwork::new());
    let store = Arc::new(store);
    let service = PocService::new(PocDependencies {
        chain: Arc::clone(chain),
        network: Arc::clone(&network),
        nonce_store: Arc::clone(&store),
        time_source: clock.clone(),
        secret_key: key,
        config,
        genesis_cvns: cvns.to_vec(),
        genesis_admins: admins.to_vec(),
    })
    .unwrap();
    TestNode {
        service: Arc::new(service),
        network,
        store,
    }
}

impl Cluster {
    fn new(size: u32, percentage: u32) -> Self {
        let keys: Vec<SecretKey> = (0..size).map(|_| SecretKey::generate()).collect();
        let cvns: Vec<CvnInfo> = keys
            .iter()
            .zip(1..)
            .map(|(key, id)| CvnInfo::new(id, key.public_key()))
            .collect();
        let admin_key = SecretKey::generate();
        let admins = vec![ChainAdmin {
            id: GENESIS_ADMIN_ID,
            pubkey: admin_key.public_key(),
            coin_supply: true,
        }];
        let chain = Arc::new(InMemoryChain::with_genesis(BlockHeader::genesis(GENESIS_TIME)));
        let clock = Arc::new(ManualClock::new(GENESIS_TIME + 1));
        let nodes = keys
            .into_iter()
            .zip(1..)
            .map(|(key, id)| {
                build_node(
                    &chain,
                    &clock,
                    key,
                    test_config(id, percentage),
                    &cvns,
                    &admins,
                    MemoryNonceStore::new(),
                )
            })
            .collect();
        Self {
            chain,
            clock,
            admin_key,
            nodes,
        }
    }

    fn node(&self, id: CvnId) -> &TestNode {
        &self.nodes[id as usize - 1]
    }

    fn genesis_hash(&self) -> Hash {
        self.chain.block_by_prev_hash(&[0u8; 32]).unwrap().hash
    }

    fn active(&self) -> Vec<CvnId> {
        (1..=self.nodes.len() as CvnId).collect()
    }

    async fn poll(&self, ids: &[CvnId]) {
        for id in ids {
            self.node(*id).service.poll().await.unwrap();
        }
    }

    async fn poll_all(&self) {
        self.poll(&self.active()).await;
    }

    /// Flood relayed messages until every outbox is empty.
    async fn deliver(&self) {
        loop {
            let mut delivered = false;
            for (i, from) in self.nodes.iter().enumerate() {
                for msg in from.network.take_messages() {
                    delivered = true;
                    for (j, to) in self.nodes.iter().enumerate() {
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

    /// Connect every submitted block; returns them.
    fn connect_blocks(&self) -> Vec<Block> {
        let mut blocks = Vec::new();
        for node in &self.nodes {
            for block in node.network.take_blocks() {
                self.chain.connect(block.clone());
                blocks.push(block);
            }
        }
        blocks
    }

    /// Announce pools on genesis and move to the first slot every pool
    /// can serve.
    async fn bootstrap(&self) {
        self.poll_all().await;
        self.deliver().await;
        self.clock.set(GENESIS_TIME + 2 * SPACING as u64);
    }

    fn signed_chain_data(&self, created: u64, params: DynamicChainParams) -> ChainDataMsg {
        let mut msg = ChainDataMsg::new(created).with_params(params);
        msg.sign(GENESIS_ADMIN_ID, &self.admin_key).unwrap();
        msg
    }
}

#[tokio::test]
async fn test_first_poll_announces_pool_and_waits_for_quorum() {
    let cluster = Cluster::new(3, 100);
    cluster.poll(&[1]).await;

    let node = cluster.node(1);
    assert_eq!(node.service.state().await, PocState::WaitingForSignatures);
    assert_eq!(node.store.records().len(), 10);
    let messages = node.network.take_messages();
    assert_eq!(messages.len(), 1);
    assert!(matches!(&messages[0], PocMessage::NoncePool(msg) if msg.cvn_id == 1));
}

#[tokio::test]
async fn test_three_validators_produce_block() {
    let cluster = Cluster::new(3, 100);
    cluster.bootstrap().await;

    cluster.poll_all().await;
    cluster.deliver().await;
    cluster.poll_all().await;

    let blocks = cluster.connect_blocks();
    assert_eq!(blocks.len(), 1);
    let header = &blocks[0].header;
    // attempt 1 on genesis belongs to the second candidate
    assert_eq!(header.creator_id, 2);
    assert!(header.missing_signer_ids.is_empty());
    assert_eq!(header.height, 1);
    assert_eq!(cluster.chain.height(), Some(1));
    for id in [1, 3] {
        assert!(cluster.node(id).service.check_proof_of_cooperation(header).is_ok());
    }
    assert_eq!(
        cluster.node(2).service.state().await,
        PocState::WaitingForBlock
    );

    cluster.poll_all().await;
    for node in &cluster.nodes {
        let state = node.service.shared_state();
        let nonces = state.nonces.read();
        // two attempts were spent on genesis
        for id in 1..=3 {
            assert_eq!(nonces.remaining(id), 8);
        }
    }
}

#[tokio::test]
async fn test_tampered_block_fails_proof() {
    let cluster = Cluster::new(3, 100);
    cluster.bootstrap().await;
    cluster.poll_all().await;
    cluster.deliver().await;
    cluster.poll_all().await;

    let mut header = cluster.node(2).network.take_blocks().remove(0).header;
    header.missing_signer_ids = vec![3];
    assert!(cluster.node(1).service.check_proof_of_cooperation(&header).is_err());
}

#[tokio::test]
async fn test_spacing_timeout_rotates_and_carries_non_signers() {
    let cluster = Cluster::new(4, 60);
    cluster.bootstrap().await;
    let genesis = cluster.genesis_hash();
    let active = cluster.active();

    // validator 4 goes quiet after announcing its pool
    cluster.poll(&[1, 2, 3]).await;
    cluster.deliver().await;
    cluster.poll(&[1, 2, 3]).await;
    assert!(cluster.connect_blocks().is_empty());
    {
        let state = cluster.node(1).service.shared_state();
        let missing = state.signatures.read().get_missing(&genesis, 2, &active);
        assert_eq!(missing.get(&Vec::new()), Some(&vec![4]));
    }

    cluster.clock.advance(SPACING as u64);
    cluster.poll(&[1, 2, 3]).await;
    {
        let state = cluster.node(1).service.shared_state();
        assert!(state
            .signatures
            .read()
            .get_missing(&genesis, 2, &active)
            .is_empty());
        assert!(state.ban_candidates(0).contains(&2));
        let holder = cluster.node(1).service.holder.lock().await;
        assert_eq!(holder.next_creator, Some(3));
        assert_eq!(holder.missing_signatures, vec![4]);
    }

    cluster.deliver().await;
    cluster.poll(&[3]).await;
    let blocks = cluster.connect_blocks();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].header.creator_id, 3);
    assert_eq!(blocks[0].header.missing_signer_ids, vec![4]);
    assert!(cluster
        .node(1)
        .service
        .check_proof_of_cooperation(&blocks[0].header)
        .is_ok());
}

#[tokio::test]
async fn test_early_partial_signature_is_buffered() {
    let cluster = Cluster::new(3, 100);
    cluster.bootstrap().await;

    cluster.poll(&[1]).await;
    let messages = cluster.node(1).network.take_messages();
    let partial = messages
        .into_iter()
        .find(|m| matches!(m, PocMessage::PartialSignature(_)))
        .unwrap();

    // node 2 has not reached attempt 1 yet
    let node = cluster.node(2);
    node.service.handle_message(partial).await.unwrap();
    assert_eq!(node.service.shared_state().buffered.lock().len(), 1);

    cluster.poll(&[2]).await;
    let state = node.service.shared_state();
    assert!(state.buffered.lock().is_empty());
    let genesis = cluster.genesis_hash();
    assert!(state
        .signatures
        .read()
        .get_signature(&[], &genesis, 2, 1)
        .is_some());
}

#[tokio::test]
async fn test_partials_for_unknown_tips_cannot_crowd_out_round() {
    let cluster = Cluster::new(3, 100);
    cluster.bootstrap().await;

    cluster.poll(&[1]).await;
    let partial = cluster
        .node(1)
        .network
        .take_messages()
        .into_iter()
        .find_map(|m| match m {
            PocMessage::PartialSignature(sig) => Some(sig),
            _ => None,
        })
        .unwrap();

    let node = cluster.node(2);
    for seed in 0..1_024u64 {
        let mut junk = partial.clone();
        junk.prev_block_hash = [0u8; 32];
        junk.prev_block_hash[..8].copy_from_slice(&seed.to_le_bytes());
        junk.prev_block_hash[31] = 0xee;
        node.service
            .handle_message(PocMessage::PartialSignature(junk))
            .await
            .unwrap();
    }
    let per_signer = node.service.config().max_buffered_per_signer;
    assert!(node.service.shared_state().buffered.lock().len() <= per_signer);

    node.service
        .handle_message(PocMessage::PartialSignature(partial))
        .await
        .unwrap();
    cluster.poll(&[2]).await;

    let state = node.service.shared_state();
    let genesis = cluster.genesis_hash();
    assert!(state
        .signatures
        .read()
        .get_signature(&[], &genesis, 2, 1)
        .is_some());
    assert!(state.buffered.lock().len() <= per_signer * 3);
}

#[tokio::test]
async fn test_forged_partial_signature_is_rejected_and_not_relayed() {
    let cluster = Cluster::new(3, 100);
    cluster.bootstrap().await;
    cluster.poll(&[1, 2]).await;

    let mut partial = cluster
        .node(1)
        .network
        .take_messages()
        .into_iter()
        .find_map(|m| match m {
            PocMessage::PartialSignature(sig) => Some(sig),
            _ => None,
        })
        .unwrap();
    partial.signer_id = 3;

    let node = cluster.node(2);
    node.network.take_messages();
    let result = node
        .service
        .handle_message(PocMessage::PartialSignature(partial))
        .await;
    assert!(result.is_err());
    assert_eq!(node.network.message_count(), 0);
}

#[tokio::test]
async fn test_chain_data_is_included_and_applied() {
    let cluster = Cluster::new(3, 100);
    cluster.bootstrap().await;

    let mut params = test_params(100);
    params.dust_threshold = 5_000;
    let msg = cluster.signed_chain_data(GENESIS_TIME, params);
    assert!(cluster.node(1).service.add_chain_data(msg.clone()).await.unwrap());
    assert!(!cluster.node(1).service.add_chain_data(msg.clone()).await.unwrap());

    cluster.poll_all().await;
    cluster.deliver().await;
    cluster.poll_all().await;
    let blocks = cluster.connect_blocks();
    assert_eq!(blocks[0].chain_data, vec![msg.clone()]);

    cluster.poll_all().await;
    for node in &cluster.nodes {
        assert_eq!(node.service.registries().params.dust_threshold, 5_000);
        let state = node.service.shared_state();
        assert!(state.chain_data.read().is_applied(&msg.hash()));
    }
}

#[tokio::test]
async fn test_unsigned_chain_data_is_rejected_and_not_relayed() {
    let cluster = Cluster::new(3, 100);
    let msg = ChainDataMsg::new(GENESIS_TIME).with_params(test_params(80));
    let node = cluster.node(1);
    let result = node.service.add_chain_data(msg).await;
    assert!(result.is_err());
    assert_eq!(node.network.message_count(), 0);
}

#[tokio::test]
async fn test_block_waits_for_missing_chain_data() {
    let cluster = Cluster::new(3, 100);
    cluster.bootstrap().await;

    let mut params = test_params(100);
    params.tx_fee_threshold = 1_234;
    let msg = cluster.signed_chain_data(GENESIS_TIME, params);
    // only the creator knows the message
    cluster.node(2).service.add_chain_data(msg.clone()).await.unwrap();
    cluster.node(2).network.take_messages();

    cluster.poll_all().await;
    cluster.deliver().await;
    cluster.poll_all().await;
    let block = cluster.node(2).network.take_blocks().remove(0);
    cluster.chain.connect_header(block.header.clone());

    cluster.poll(&[1]).await;
    let node = cluster.node(1);
    assert_eq!(node.service.state().await, PocState::WaitingForCvnData);
    assert_ne!(node.service.registries().params.tx_fee_threshold, 1_234);

    node.service
        .handle_message(PocMessage::ChainData(msg))
        .await
        .unwrap();
    cluster.poll(&[1]).await;
    assert_ne!(node.service.state().await, PocState::WaitingForCvnData);
    assert_eq!(node.service.registries().params.tx_fee_threshold, 1_234);
}

#[tokio::test]
async fn test_unknown_node_waits_for_cvn_data() {
    let cluster = Cluster::new(2, 100);
    let stranger = build_node(
        &cluster.chain,
        &cluster.clock,
        SecretKey::generate(),
        test_config(9, 100),
        &[],
        &[],
        MemoryNonceStore::new(),
    );
    let state = stranger.service.poll().await.unwrap();
    assert_eq!(state, PocState::WaitingForCvnData);
    assert_eq!(stranger.network.message_count(), 0);
}

#[tokio::test]
async fn test_restart_reannounces_stored_nonces() {
    let cluster = Cluster::new(3, 100);
    let key = SecretKey::generate();
    let (_, records) = create_nonce_pool(1, 0, 5, &key).unwrap();
    let publics: Vec<_> = records.iter().map(|r| r.public).collect();
    let cvns = vec![CvnInfo::new(1, key.public_key())];

    let node = build_node(
        &cluster.chain,
        &cluster.clock,
        key,
        test_config(1, 100),
        &cvns,
        &[],
        MemoryNonceStore::with_records(records),
    );
    node.service.poll().await.unwrap();

    let pools: Vec<NoncePoolMsg> = node
        .network
        .take_messages()
        .into_iter()
        .filter_map(|m| match m {
            PocMessage::NoncePool(msg) => Some(msg),
            _ => None,
        })
        .collect();
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].public_nonces, publics);
}

#[tokio::test]
async fn test_nonce_write_failure_is_fatal() {
    let cluster = Cluster::new(3, 100);
    let node = cluster.node(1);
    node.store.set_fail_writes(true);
    let result = node.service.poll().await;
    assert!(matches!(result, Err(PocError::NoncePersistence(_))));
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let cluster = Cluster::new(1, 100);
    let mut config = test_config(1, 100);
    config.min_nonce_pool_size = 50;
    config.max_nonce_pool_size = 10;
    let result = PocService::new(PocDependencies {
        chain: Arc::clone(&cluster.chain),
        network: Arc::new(InMemoryNetwork::new()),
        nonce_store: Arc::new(MemoryNonceStore::new()),
        time_source: cluster.clock.clone(),
        secret_key: SecretKey::generate(),
        config,
        genesis_cvns: Vec::new(),
        genesis_admins: Vec::new(),
    });
    assert!(matches!(result, Err(PocError::InvalidConfig(_))));
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_shutdown() {
    let cluster = Cluster::new(1, 100);
    let service = Arc::clone(&cluster.node(1).service);
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { service.run(rx).await });

    tokio::time::sleep(Duration::from_secs(5)).await;
    tx.send(true).unwrap();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_fatal_error() {
    let cluster = Cluster::new(1, 100);
    cluster.node(1).store.set_fail_writes(true);
    let service = Arc::clone(&cluster.node(1).service);
    let (_tx, rx) = watch::channel(false);
    let result = service.run(rx).await;
    assert!(matches!(result, Err(PocError::NoncePersistence(_))));
}
