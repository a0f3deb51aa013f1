#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::SolEvent as _;
use ark_std::rand::thread_rng;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use tessera_core::{
    attestation::{aggregate_pubkeys_g1, KeyPair},
    batch::BatchHeader,
    blob::{Blob, BlobRequestHeader, SecurityParam},
    operators::{
        ChainState, IndexedChainState, IndexedOperatorInfo, IndexedOperatorState, OperatorId,
        OperatorInfo, OperatorState, QuorumId,
    },
    DynError, Encoder, StdAssignmentCoordinator,
};
use tessera_dispersal::{
    batcher::{BatchConfirmed, Batcher, BatcherConfig, ConfirmationMetadata, TimeoutConfig},
    dispatcher::{Dispatcher, EncodedBlob, SigningReply},
    finalizer::{Finalizer, FinalizerError},
    store::InMemoryBlobStore,
    txn_manager::{
        EthClient, Log, Transaction, TransactionReceipt, Transactor, TxnManager, TxnManagerError,
        TxnRequest,
    },
};
use tessera_encoder::{global::GLOBAL_PARAMETERS, TesseraEncoder};

pub const NUM_OPERATORS: u8 = 10;

pub fn operator_id(index: u8) -> OperatorId {
    let mut id = [0u8; 32];
    id[31] = index;
    id
}

/// Equal-stake operator set registered on every requested quorum, with real
/// BLS keys so attestations exercise the actual pairing checks.
pub struct MockChainState {
    pub keypairs: BTreeMap<OperatorId, KeyPair>,
    pub block_number: Mutex<u32>,
}

impl MockChainState {
    pub fn new(num_operators: u8) -> Self {
        let mut rng = thread_rng();
        let keypairs = (0..num_operators)
            .map(|i| (operator_id(i), KeyPair::generate(&mut rng)))
            .collect();
        Self {
            keypairs,
            block_number: Mutex::new(10),
        }
    }

    pub fn set_block_number(&self, block_number: u32) {
        *self.block_number.lock().unwrap() = block_number;
    }

    fn make_state(&self, block_number: u32, quorums: &[QuorumId]) -> OperatorState {
        let per_quorum: BTreeMap<OperatorId, OperatorInfo> = self
            .keypairs
            .keys()
            .enumerate()
            .map(|(index, id)| {
                (
                    *id,
                    OperatorInfo {
                        stake: U256::from(100u32),
                        index: index as u32,
                    },
                )
            })
            .collect();
        let total = OperatorInfo {
            stake: U256::from(100u32) * U256::from(self.keypairs.len()),
            index: self.keypairs.len() as u32,
        };
        OperatorState {
            operators: quorums.iter().map(|q| (*q, per_quorum.clone())).collect(),
            totals: quorums.iter().map(|q| (*q, total)).collect(),
            block_number,
        }
    }
}

#[async_trait]
impl ChainState for MockChainState {
    async fn get_current_block_number(&self) -> Result<u32, DynError> {
        Ok(*self.block_number.lock().unwrap())
    }

    async fn get_operator_state(
        &self,
        block_number: u32,
        quorums: &[QuorumId],
    ) -> Result<OperatorState, DynError> {
        Ok(self.make_state(block_number, quorums))
    }
}

#[async_trait]
impl IndexedChainState for MockChainState {
    async fn get_indexed_operator_state(
        &self,
        block_number: u32,
        quorums: &[QuorumId],
    ) -> Result<Arc<IndexedOperatorState>, DynError> {
        let state = self.make_state(block_number, quorums);
        let indexed_operators: BTreeMap<OperatorId, IndexedOperatorInfo> = self
            .keypairs
            .iter()
            .enumerate()
            .map(|(index, (id, keypair))| {
                (
                    *id,
                    IndexedOperatorInfo {
                        pubkey_g1: keypair.pubkey_g1,
                        pubkey_g2: keypair.pubkey_g2,
                        socket: format!("operator-{index}.node:32005"),
                    },
                )
            })
            .collect();
        let agg = aggregate_pubkeys_g1(self.keypairs.values().map(|kp| &kp.pubkey_g1));
        Ok(Arc::new(IndexedOperatorState {
            state,
            indexed_operators,
            agg_pubkeys_g1: quorums.iter().map(|q| (*q, agg)).collect(),
        }))
    }
}

/// Signs the batch header hash with every operator's key, minus a
/// configurable set of abstainers.
pub struct MockDispatcher {
    chain: Arc<MockChainState>,
    non_signers: Mutex<HashSet<OperatorId>>,
}

impl MockDispatcher {
    pub fn new(chain: Arc<MockChainState>) -> Self {
        Self {
            chain,
            non_signers: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_non_signers(&self, indices: &[u8]) {
        *self.non_signers.lock().unwrap() = indices.iter().map(|i| operator_id(*i)).collect();
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn disperse_batch(
        &self,
        state: Arc<IndexedOperatorState>,
        _blobs: Vec<EncodedBlob>,
        batch_header: BatchHeader,
    ) -> mpsc::Receiver<SigningReply> {
        let (tx, rx) = mpsc::channel(state.indexed_operators.len().max(1));
        let header_hash = batch_header.batch_header_hash();
        let non_signers = self.non_signers.lock().unwrap().clone();
        for operator in state.indexed_operators.keys() {
            let reply = if non_signers.contains(operator) {
                SigningReply {
                    operator: *operator,
                    signature: Err("operator refused to sign".into()),
                }
            } else {
                let keypair = &self.chain.keypairs[operator];
                SigningReply {
                    operator: *operator,
                    signature: Ok(keypair.sign(header_hash)),
                }
            };
            let _ = tx.send(reply).await;
        }
        rx
    }
}

pub struct MockTransactor;

#[async_trait]
impl Transactor for MockTransactor {
    async fn build_confirm_batch_txn(
        &self,
        _batch_header: &BatchHeader,
        _aggregation: &tessera_core::SignatureAggregation,
    ) -> Result<Transaction, DynError> {
        Ok(Transaction {
            to: Address::ZERO,
            data: vec![],
            value: U256::ZERO,
            gas_limit: 21_000,
            gas_price: U256::from(1u64),
        })
    }
}

/// Records requests instead of submitting; tests deliver receipts by calling
/// `process_confirmed_batch` directly with the captured metadata.
#[derive(Default)]
pub struct MockTxnManager {
    pub requests: Mutex<Vec<TxnRequest<ConfirmationMetadata>>>,
}

#[async_trait]
impl TxnManager<ConfirmationMetadata> for MockTxnManager {
    async fn process_transaction(
        &self,
        request: TxnRequest<ConfirmationMetadata>,
    ) -> Result<(), TxnManagerError> {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

impl MockTxnManager {
    pub fn last_metadata(&self) -> ConfirmationMetadata {
        self.requests
            .lock()
            .unwrap()
            .last()
            .expect("no transaction was submitted")
            .metadata
            .clone()
    }
}

/// Scripted chain: receipts pop in order, then the transaction is unknown.
#[derive(Default)]
pub struct MockEthClient {
    pub receipts: Mutex<VecDeque<TransactionReceipt>>,
    pub finalized_block: Mutex<u64>,
}

impl MockEthClient {
    pub fn push_receipt(&self, receipt: TransactionReceipt) {
        self.receipts.lock().unwrap().push_back(receipt);
    }

    pub fn set_finalized_block(&self, block: u64) {
        *self.finalized_block.lock().unwrap() = block;
    }
}

#[async_trait]
impl EthClient for MockEthClient {
    async fn estimate_gas(&self, _txn: &Transaction) -> Result<u64, DynError> {
        Ok(21_000)
    }

    async fn send_transaction(&self, _txn: &Transaction) -> Result<B256, DynError> {
        Ok(B256::repeat_byte(0x12))
    }

    async fn transaction_receipt(
        &self,
        _hash: B256,
    ) -> Result<Option<TransactionReceipt>, DynError> {
        Ok(self.receipts.lock().unwrap().pop_front())
    }

    async fn latest_finalized_block(&self) -> Result<u64, DynError> {
        Ok(*self.finalized_block.lock().unwrap())
    }
}

pub struct NoopFinalizer;

#[async_trait]
impl Finalizer for NoopFinalizer {
    fn start(self: Arc<Self>, _shutdown: watch::Receiver<bool>) {}

    async fn finalize_blobs(&self) -> Result<(), FinalizerError> {
        Ok(())
    }
}

pub fn make_test_blob(security_params: Vec<SecurityParam>, data: Vec<u8>) -> Blob {
    Blob {
        request_header: BlobRequestHeader { security_params },
        data,
    }
}

pub fn rand_data(len: usize) -> Vec<u8> {
    use ark_std::rand::RngCore as _;
    let mut data = vec![0u8; len];
    thread_rng().fill_bytes(&mut data);
    data
}

pub fn confirmed_receipt(batch_id: u32, block_number: u64, txn_hash: B256) -> TransactionReceipt {
    let mut data = vec![0u8; 32];
    data[28..].copy_from_slice(&batch_id.to_be_bytes());
    TransactionReceipt {
        txn_hash,
        block_number: Some(block_number),
        logs: vec![Log {
            topics: vec![BatchConfirmed::SIGNATURE_HASH, B256::repeat_byte(0x34)],
            data,
        }],
    }
}

pub fn empty_log_receipt(block_number: u64, txn_hash: B256) -> TransactionReceipt {
    TransactionReceipt {
        txn_hash,
        block_number: Some(block_number),
        logs: vec![],
    }
}

pub type TestBatcher = Batcher<
    InMemoryBlobStore,
    MockDispatcher,
    MockChainState,
    MockTransactor,
    MockTxnManager,
>;

pub struct BatcherHarness {
    pub batcher: Arc<TestBatcher>,
    pub blob_store: Arc<InMemoryBlobStore>,
    pub chain: Arc<MockChainState>,
    pub dispatcher: Arc<MockDispatcher>,
    pub txn_manager: Arc<MockTxnManager>,
    pub eth_client: Arc<MockEthClient>,
    pub heartbeats: mpsc::Receiver<tokio::time::Instant>,
}

pub fn make_batcher(max_num_retries_per_blob: u32) -> BatcherHarness {
    let config = BatcherConfig {
        pull_interval: std::time::Duration::from_millis(100),
        batch_size_mb_limit: 100,
        max_num_retries_per_blob,
        num_connections: 1,
        encoding_request_queue_size: 100,
        target_num_chunks: 16,
        max_blobs_to_fetch_from_store: 100,
        finalizer_interval: std::time::Duration::from_millis(100),
        finalizer_pool_size: 2,
    };
    let timeouts = TimeoutConfig {
        encoding_timeout: std::time::Duration::from_secs(10),
        attestation_timeout: std::time::Duration::from_secs(10),
        chain_read_timeout: std::time::Duration::from_secs(10),
        chain_write_timeout: std::time::Duration::from_secs(10),
    };

    let blob_store = Arc::new(InMemoryBlobStore::new());
    let chain = Arc::new(MockChainState::new(NUM_OPERATORS));
    let dispatcher = Arc::new(MockDispatcher::new(Arc::clone(&chain)));
    let txn_manager = Arc::new(MockTxnManager::default());
    let eth_client = Arc::new(MockEthClient::default());
    let encoder: Arc<dyn Encoder> = Arc::new(TesseraEncoder::with_global_parameters(
        Arc::new(GLOBAL_PARAMETERS.clone()),
        true,
    ));
    let (heartbeat_tx, heartbeats) = mpsc::channel(16);

    let batcher = Arc::new(Batcher::new(
        config,
        timeouts,
        Arc::clone(&blob_store),
        Arc::clone(&dispatcher),
        Arc::clone(&chain),
        encoder,
        Arc::new(StdAssignmentCoordinator),
        Arc::new(MockTransactor),
        Arc::clone(&txn_manager),
        Arc::clone(&eth_client) as Arc<dyn EthClient>,
        Arc::new(NoopFinalizer),
        heartbeat_tx,
    ));
    BatcherHarness {
        batcher,
        blob_store,
        chain,
        dispatcher,
        txn_manager,
        eth_client,
        heartbeats,
    }
}
