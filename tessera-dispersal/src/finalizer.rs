use std::{sync::Arc, time::Duration};

use alloy_primitives::B256;
use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    sync::{watch, Semaphore},
    task::JoinSet,
};
use tracing::{error, info, warn};

use tessera_core::blob::{BlobMetadata, BlobStatus};

use crate::{
    store::{BlobStore, StoreError},
    txn_manager::EthClient,
};

const MAX_RETRIES: u32 = 3;
const BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum FinalizerError {
    #[error("error getting latest finalized block: {0}")]
    FinalizedBlock(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Promotes `Confirmed` blobs to `Finalized` once their confirmation block
/// is past the chain's finality frontier, and detects confirmations that
/// were reorged out.
#[async_trait]
pub trait Finalizer: Send + Sync + 'static {
    fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>);

    async fn finalize_blobs(&self) -> Result<(), FinalizerError>;
}

pub struct ChainFinalizer<S> {
    loop_interval: Duration,
    chain_read_timeout: Duration,
    blob_store: Arc<S>,
    eth_client: Arc<dyn EthClient>,
    max_num_retries_per_blob: u32,
    num_blobs_per_fetch: usize,
    pool_size: usize,
}

impl<S: BlobStore> ChainFinalizer<S> {
    pub fn new(
        loop_interval: Duration,
        chain_read_timeout: Duration,
        blob_store: Arc<S>,
        eth_client: Arc<dyn EthClient>,
        max_num_retries_per_blob: u32,
        num_blobs_per_fetch: usize,
        pool_size: usize,
    ) -> Self {
        Self {
            loop_interval,
            chain_read_timeout,
            blob_store,
            eth_client,
            max_num_retries_per_blob,
            num_blobs_per_fetch,
            pool_size,
        }
    }

    async fn latest_finalized_block(&self) -> Result<u64, FinalizerError> {
        let mut last_err = String::new();
        for attempt in 0..MAX_RETRIES {
            match tokio::time::timeout(
                self.chain_read_timeout,
                self.eth_client.latest_finalized_block(),
            )
            .await
            {
                Ok(Ok(block)) => return Ok(block),
                Ok(Err(err)) => last_err = err.to_string(),
                Err(_) => last_err = "finalized block query timed out".to_string(),
            }
            let delay = BASE_DELAY * 2u32.pow(attempt);
            error!(err = %last_err, retry_in = ?delay, "error getting latest finalized block");
            tokio::time::sleep(delay).await;
        }
        Err(FinalizerError::FinalizedBlock(last_err))
    }
}

#[async_trait]
impl<S: BlobStore> Finalizer for ChainFinalizer<S> {
    fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.loop_interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.finalize_blobs().await {
                            error!(err = %e, "failed to finalize blobs");
                        }
                    }
                }
            }
        });
    }

    /// Walk all `Confirmed` blobs and settle each against the finality
    /// frontier. Individual blob errors are logged and skipped; the loop
    /// stays eligible for the next tick.
    async fn finalize_blobs(&self) -> Result<(), FinalizerError> {
        let last_final_block = self.latest_finalized_block().await?;
        let pool = Arc::new(Semaphore::new(self.pool_size.max(1)));
        let mut workers = JoinSet::new();
        let mut total_processed = 0usize;

        let mut start_key = None;
        loop {
            let (page, next) = self
                .blob_store
                .get_blob_metadata_by_status_with_pagination(
                    BlobStatus::Confirmed,
                    self.num_blobs_per_fetch,
                    start_key,
                )
                .await?;
            if page.is_empty() {
                break;
            }
            total_processed += page.len();

            let permit = Arc::clone(&pool)
                .acquire_owned()
                .await
                .expect("finalizer pool closed");
            let blob_store = Arc::clone(&self.blob_store);
            let eth_client = Arc::clone(&self.eth_client);
            let max_retries = self.max_num_retries_per_blob;
            let read_timeout = self.chain_read_timeout;
            workers.spawn(async move {
                let _permit = permit;
                update_blobs(
                    blob_store,
                    eth_client,
                    page,
                    last_final_block,
                    max_retries,
                    read_timeout,
                )
                .await;
            });

            match next {
                Some(key) => start_key = Some(key),
                None => break,
            }
        }
        while workers.join_next().await.is_some() {}

        info!(
            finalized_block_number = last_final_block,
            total_processed, "finalizer pass complete"
        );
        Ok(())
    }
}

async fn update_blobs<S: BlobStore>(
    blob_store: Arc<S>,
    eth_client: Arc<dyn EthClient>,
    metadatas: Vec<BlobMetadata>,
    last_final_block: u64,
    max_retries: u32,
    read_timeout: Duration,
) {
    for metadata in metadatas {
        if metadata.blob_status != BlobStatus::Confirmed {
            error!(
                blob = %metadata.blob_key,
                status = %metadata.blob_status,
                "blob fetched by status Confirmed has a different status"
            );
            continue;
        }
        let metadata = match blob_store.get_blob_metadata(&metadata.blob_key).await {
            Ok(metadata) => metadata,
            Err(err) => {
                error!(err = %err, blob = %metadata.blob_key, "error getting confirmed metadata");
                continue;
            }
        };
        let Some(info) = metadata.confirmation_info.as_ref() else {
            error!(blob = %metadata.blob_key, "confirmed blob carries no confirmation info");
            continue;
        };
        // not yet past finality, check again next tick
        if u64::from(info.confirmation_block_number) > last_final_block {
            continue;
        }

        // the confirmation block may have moved in a reorg
        match transaction_block_number(
            eth_client.as_ref(),
            info.confirmation_txn_hash,
            read_timeout,
        )
        .await
        {
            Ok(None) => {
                // finalized height passed the confirmation, but the
                // transaction is gone: it was reorged out
                warn!(blob = %metadata.blob_key, "confirmation transaction not found, marking blob failed");
                if let Err(err) = blob_store.handle_blob_failure(&metadata, max_retries).await {
                    error!(err = %err, blob = %metadata.blob_key, "error marking blob as failed");
                }
            }
            Ok(Some(block_number)) => {
                if block_number > last_final_block {
                    continue;
                }
                if let Err(err) = blob_store.mark_blob_finalized(&metadata.blob_key).await {
                    error!(err = %err, blob = %metadata.blob_key, "error marking blob as finalized");
                }
            }
            Err(err) => {
                error!(err = %err, blob = %metadata.blob_key, "error getting transaction block number");
            }
        }
    }
}

/// Block number of the transaction, `None` if the chain no longer knows it.
/// Transient errors retry with exponential backoff; not-found returns
/// immediately.
async fn transaction_block_number(
    eth_client: &dyn EthClient,
    hash: B256,
    read_timeout: Duration,
) -> Result<Option<u64>, FinalizerError> {
    let mut last_err = String::new();
    for attempt in 0..MAX_RETRIES {
        match tokio::time::timeout(read_timeout, eth_client.transaction_receipt(hash)).await {
            Ok(Ok(Some(receipt))) => match receipt.block_number {
                Some(block_number) => return Ok(Some(block_number)),
                None => last_err = "receipt has no block number".to_string(),
            },
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(err)) => last_err = err.to_string(),
            Err(_) => last_err = "receipt query timed out".to_string(),
        }
        let delay = BASE_DELAY * 2u32.pow(attempt);
        error!(err = %last_err, retry_in = ?delay, %hash, "error getting transaction receipt");
        tokio::time::sleep(delay).await;
    }
    Err(FinalizerError::FinalizedBlock(last_err))
}
