use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use alloy_primitives::keccak256;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use tessera_core::blob::{
    Blob, BlobKey, BlobMetadata, BlobStatus, ConfirmationInfo, RequestMetadata,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no blob found for key {0}")]
    NotFound(BlobKey),
    #[error("blob {key} is {actual}, expected {expected}")]
    InvalidStatus {
        key: BlobKey,
        actual: BlobStatus,
        expected: BlobStatus,
    },
    #[error("invalid blob request: {0}")]
    InvalidRequest(#[from] tessera_core::blob::BlobError),
    #[error("blob store backend error: {0}")]
    Backend(String),
}

/// Authoritative store of blob payloads and lifecycle metadata. Status
/// transitions are only ever written by the batcher driver and the
/// finalizer; ingest paths create blobs in `Processing` and nothing else.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn store_blob(&self, blob: &Blob, requested_at: u64) -> Result<BlobKey, StoreError>;

    async fn get_blob_content(&self, key: &BlobKey) -> Result<Vec<u8>, StoreError>;

    async fn get_blob_metadata(&self, key: &BlobKey) -> Result<BlobMetadata, StoreError>;

    async fn get_blob_metadata_by_status(
        &self,
        status: BlobStatus,
    ) -> Result<Vec<BlobMetadata>, StoreError>;

    /// Page through blobs of one status in key order. Returns the page and,
    /// when more items remain, the key to pass back as the next start.
    async fn get_blob_metadata_by_status_with_pagination(
        &self,
        status: BlobStatus,
        limit: usize,
        exclusive_start_key: Option<BlobKey>,
    ) -> Result<(Vec<BlobMetadata>, Option<BlobKey>), StoreError>;

    /// Idempotent: confirming an already confirmed blob returns the existing
    /// confirmation info unchanged.
    async fn mark_blob_confirmed(
        &self,
        metadata: &BlobMetadata,
        info: &ConfirmationInfo,
    ) -> Result<BlobMetadata, StoreError>;

    async fn mark_blob_insufficient_signatures(
        &self,
        metadata: &BlobMetadata,
        info: &ConfirmationInfo,
    ) -> Result<BlobMetadata, StoreError>;

    async fn mark_blob_finalized(&self, key: &BlobKey) -> Result<(), StoreError>;

    /// Retry accounting: below the retry budget the blob reverts to
    /// `Processing` with `num_retries` incremented, otherwise it is `Failed`.
    async fn handle_blob_failure(
        &self,
        metadata: &BlobMetadata,
        max_retries: u32,
    ) -> Result<(), StoreError>;
}

struct StoredBlob {
    data: Vec<u8>,
    metadata: BlobMetadata,
}

/// Reference store used by tests and local deployments.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<BTreeMap<BlobKey, StoredBlob>>,
    nonce: AtomicU64,
}

impl InMemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn store_blob(&self, blob: &Blob, requested_at: u64) -> Result<BlobKey, StoreError> {
        blob.request_header.validate()?;
        let key = BlobKey {
            blob_hash: keccak256(&blob.data),
            nonce: self.nonce.fetch_add(1, Ordering::Relaxed),
        };
        let metadata = BlobMetadata {
            blob_key: key,
            blob_status: BlobStatus::Processing,
            num_retries: 0,
            request_metadata: RequestMetadata {
                blob_size: blob.data.len() as u64,
                requested_at,
                security_params: blob.request_header.security_params.clone(),
            },
            confirmation_info: None,
        };
        self.blobs.write().await.insert(
            key,
            StoredBlob {
                data: blob.data.clone(),
                metadata,
            },
        );
        Ok(key)
    }

    async fn get_blob_content(&self, key: &BlobKey) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .read()
            .await
            .get(key)
            .map(|stored| stored.data.clone())
            .ok_or(StoreError::NotFound(*key))
    }

    async fn get_blob_metadata(&self, key: &BlobKey) -> Result<BlobMetadata, StoreError> {
        self.blobs
            .read()
            .await
            .get(key)
            .map(|stored| stored.metadata.clone())
            .ok_or(StoreError::NotFound(*key))
    }

    async fn get_blob_metadata_by_status(
        &self,
        status: BlobStatus,
    ) -> Result<Vec<BlobMetadata>, StoreError> {
        Ok(self
            .blobs
            .read()
            .await
            .values()
            .filter(|stored| stored.metadata.blob_status == status)
            .map(|stored| stored.metadata.clone())
            .collect())
    }

    async fn get_blob_metadata_by_status_with_pagination(
        &self,
        status: BlobStatus,
        limit: usize,
        exclusive_start_key: Option<BlobKey>,
    ) -> Result<(Vec<BlobMetadata>, Option<BlobKey>), StoreError> {
        let blobs = self.blobs.read().await;
        let mut page = Vec::with_capacity(limit);
        for (key, stored) in blobs.iter() {
            if let Some(start) = exclusive_start_key {
                if *key <= start {
                    continue;
                }
            }
            if stored.metadata.blob_status != status {
                continue;
            }
            page.push(stored.metadata.clone());
            if page.len() == limit {
                break;
            }
        }
        let next = (page.len() == limit)
            .then(|| page.last().map(|metadata| metadata.blob_key))
            .flatten();
        Ok((page, next))
    }

    async fn mark_blob_confirmed(
        &self,
        metadata: &BlobMetadata,
        info: &ConfirmationInfo,
    ) -> Result<BlobMetadata, StoreError> {
        let mut blobs = self.blobs.write().await;
        let stored = blobs
            .get_mut(&metadata.blob_key)
            .ok_or(StoreError::NotFound(metadata.blob_key))?;
        match stored.metadata.blob_status {
            // first confirmation wins; repeat calls leave it untouched
            BlobStatus::Confirmed => Ok(stored.metadata.clone()),
            BlobStatus::Processing => {
                stored.metadata.blob_status = BlobStatus::Confirmed;
                stored.metadata.confirmation_info = Some(info.clone());
                Ok(stored.metadata.clone())
            }
            actual => Err(StoreError::InvalidStatus {
                key: metadata.blob_key,
                actual,
                expected: BlobStatus::Processing,
            }),
        }
    }

    async fn mark_blob_insufficient_signatures(
        &self,
        metadata: &BlobMetadata,
        info: &ConfirmationInfo,
    ) -> Result<BlobMetadata, StoreError> {
        let mut blobs = self.blobs.write().await;
        let stored = blobs
            .get_mut(&metadata.blob_key)
            .ok_or(StoreError::NotFound(metadata.blob_key))?;
        if stored.metadata.blob_status == BlobStatus::Processing {
            stored.metadata.blob_status = BlobStatus::InsufficientSignatures;
            stored.metadata.confirmation_info = Some(info.clone());
        }
        Ok(stored.metadata.clone())
    }

    async fn mark_blob_finalized(&self, key: &BlobKey) -> Result<(), StoreError> {
        let mut blobs = self.blobs.write().await;
        let stored = blobs.get_mut(key).ok_or(StoreError::NotFound(*key))?;
        if stored.metadata.blob_status != BlobStatus::Confirmed {
            return Err(StoreError::InvalidStatus {
                key: *key,
                actual: stored.metadata.blob_status,
                expected: BlobStatus::Confirmed,
            });
        }
        stored.metadata.blob_status = BlobStatus::Finalized;
        Ok(())
    }

    async fn handle_blob_failure(
        &self,
        metadata: &BlobMetadata,
        max_retries: u32,
    ) -> Result<(), StoreError> {
        let mut blobs = self.blobs.write().await;
        let stored = blobs
            .get_mut(&metadata.blob_key)
            .ok_or(StoreError::NotFound(metadata.blob_key))?;
        if stored.metadata.num_retries < max_retries {
            stored.metadata.blob_status = BlobStatus::Processing;
            stored.metadata.num_retries += 1;
        } else {
            stored.metadata.blob_status = BlobStatus::Failed;
        }
        Ok(())
    }
}
