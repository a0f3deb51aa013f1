mod support;

use std::time::Duration;

use alloy_primitives::B256;
use tokio::sync::mpsc;

use support::*;
use tessera_core::blob::{BlobStatus, ConfirmationInfo, SecurityParam};
use tessera_dispersal::{
    batcher::BatcherError,
    store::BlobStore as _,
    streamer::{BatchError, EncodingOutcome},
    txn_manager::ReceiptResponse,
};

const TXN_HASH: B256 = B256::repeat_byte(0x56);

/// Drive the encode pipeline by hand: one scan, then fold the expected
/// number of worker results.
async fn drive_encoding(harness: &BatcherHarness, expected_results: usize) {
    let (out, mut results) = mpsc::channel::<EncodingOutcome>(16);
    harness
        .batcher
        .streamer
        .request_encoding(&out)
        .await
        .unwrap();
    for _ in 0..expected_results {
        let outcome = tokio::time::timeout(Duration::from_secs(30), results.recv())
            .await
            .expect("encoding worker timed out")
            .expect("encoding channel closed");
        harness
            .batcher
            .streamer
            .process_encoded_blobs(outcome)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn batcher_iterations() {
    let mut harness = make_batcher(2);
    let blob1 = make_test_blob(
        vec![SecurityParam {
            quorum_id: 0,
            adversary_threshold: 80,
            quorum_threshold: 90,
        }],
        rand_data(1488),
    );
    let blob2 = make_test_blob(
        vec![SecurityParam {
            quorum_id: 1,
            adversary_threshold: 70,
            quorum_threshold: 100,
        }],
        rand_data(600),
    );
    let key1 = harness.blob_store.store_blob(&blob1, 1).await.unwrap();
    let key2 = harness.blob_store.store_blob(&blob2, 2).await.unwrap();

    drive_encoding(&harness, 2).await;
    {
        let store = harness.batcher.streamer.encoded_store.lock().unwrap();
        let (count, size) = store.encoded_result_size();
        assert_eq!(count, 2);
        assert!(size > 0);
    }

    harness.batcher.handle_single_batch().await.unwrap();
    assert_eq!(harness.txn_manager.requests.lock().unwrap().len(), 1);

    harness
        .batcher
        .process_confirmed_batch(ReceiptResponse {
            result: Ok(confirmed_receipt(3, 123, TXN_HASH)),
            metadata: harness.txn_manager.last_metadata(),
        })
        .await
        .unwrap();

    // both blobs confirmed with the on-chain batch id and block
    for key in [key1, key2] {
        let metadata = harness.blob_store.get_blob_metadata(&key).await.unwrap();
        assert_eq!(metadata.blob_status, BlobStatus::Confirmed);
        let info = metadata.confirmation_info.expect("confirmation info persisted");
        assert_eq!(info.batch_id, 3);
        assert_eq!(info.confirmation_block_number, 123);
        assert_eq!(info.confirmation_txn_hash, TXN_HASH);
        assert!(!info.blob_inclusion_proof.is_empty());
        assert_eq!(info.fee, vec![0]);
    }

    // the encoded chunk store ends empty
    {
        let store = harness.batcher.streamer.encoded_store.lock().unwrap();
        let (count, size) = store.encoded_result_size();
        assert_eq!(count, 0);
        assert_eq!(size, 0);
    }

    // confirmed metadata is immutable under repeat confirmation
    let metadata = harness.blob_store.get_blob_metadata(&key1).await.unwrap();
    let original_index = metadata.confirmation_info.as_ref().unwrap().blob_index;
    let mut other_info: ConfirmationInfo = metadata.confirmation_info.clone().unwrap();
    other_info.blob_index = original_index + 1;
    let unchanged = harness
        .blob_store
        .mark_blob_confirmed(&metadata, &other_info)
        .await
        .unwrap();
    assert_eq!(
        unchanged.confirmation_info.unwrap().blob_index,
        original_index
    );

    // every handle_single_batch iteration produced a heartbeat
    assert!(harness.heartbeats.try_recv().is_ok());
}

#[tokio::test]
async fn blob_failures_retry_then_exhaust() {
    let mut harness = make_batcher(2);
    let blob = make_test_blob(
        vec![SecurityParam {
            quorum_id: 0,
            adversary_threshold: 80,
            quorum_threshold: 100,
        }],
        rand_data(1000),
    );
    let key = harness.blob_store.store_blob(&blob, 1).await.unwrap();

    // first attempt: the confirmation transaction itself fails
    drive_encoding(&harness, 1).await;
    harness.batcher.handle_single_batch().await.unwrap();
    let err = harness
        .batcher
        .process_confirmed_batch(ReceiptResponse {
            result: Err("transaction underpriced".into()),
            metadata: harness.txn_manager.last_metadata(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BatcherError::ConfirmationFailed(_)));

    let metadata = harness.blob_store.get_blob_metadata(&key).await.unwrap();
    assert_eq!(metadata.blob_status, BlobStatus::Processing);
    assert_eq!(metadata.num_retries, 1);
    {
        let store = harness.batcher.streamer.encoded_store.lock().unwrap();
        assert_eq!(store.encoded_result_size().0, 0);
    }

    // second attempt: receipt arrives without a block number
    drive_encoding(&harness, 1).await;
    harness.batcher.handle_single_batch().await.unwrap();
    let mut receipt = empty_log_receipt(0, TXN_HASH);
    receipt.block_number = None;
    let err = harness
        .batcher
        .process_confirmed_batch(ReceiptResponse {
            result: Ok(receipt.clone()),
            metadata: harness.txn_manager.last_metadata(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BatcherError::MissingBlockNumber));

    let metadata = harness.blob_store.get_blob_metadata(&key).await.unwrap();
    assert_eq!(metadata.blob_status, BlobStatus::Processing);
    assert_eq!(metadata.num_retries, 2);

    // third failure exhausts the retry budget
    drive_encoding(&harness, 1).await;
    harness.batcher.handle_single_batch().await.unwrap();
    let err = harness
        .batcher
        .process_confirmed_batch(ReceiptResponse {
            result: Ok(receipt),
            metadata: harness.txn_manager.last_metadata(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BatcherError::MissingBlockNumber));

    let metadata = harness.blob_store.get_blob_metadata(&key).await.unwrap();
    assert_eq!(metadata.blob_status, BlobStatus::Failed);
    assert_eq!(metadata.num_retries, 2);

    // one heartbeat per iteration
    let mut heartbeats = 0;
    while harness.heartbeats.try_recv().is_ok() {
        heartbeats += 1;
    }
    assert_eq!(heartbeats, 3);
}

#[tokio::test]
async fn pending_confirmation_blobs_are_not_re_encoded() {
    let harness = make_batcher(2);
    let blob = make_test_blob(
        vec![SecurityParam {
            quorum_id: 0,
            adversary_threshold: 80,
            quorum_threshold: 90,
        }],
        rand_data(1200),
    );
    let key = harness.blob_store.store_blob(&blob, 1).await.unwrap();

    drive_encoding(&harness, 1).await;
    {
        let store = harness.batcher.streamer.encoded_store.lock().unwrap();
        let result = store.get_encoding_result(key, 0).unwrap();
        assert_eq!(
            result.status,
            tessera_dispersal::encoded_store::EncodedResultStatus::PendingDispersal
        );
    }

    harness.batcher.handle_single_batch().await.unwrap();

    // blob store status is untouched until the receipt arrives, but the
    // encoded result has moved to pending confirmation
    let metadata = harness.blob_store.get_blob_metadata(&key).await.unwrap();
    assert_eq!(metadata.blob_status, BlobStatus::Processing);
    {
        let store = harness.batcher.streamer.encoded_store.lock().unwrap();
        let result = store.get_encoding_result(key, 0).unwrap();
        assert_eq!(
            result.status,
            tessera_dispersal::encoded_store::EncodedResultStatus::PendingConfirmation
        );
    }

    // the streamer must not pick the blob up again
    let (out, mut results) = mpsc::channel::<EncodingOutcome>(4);
    harness
        .batcher
        .streamer
        .request_encoding(&out)
        .await
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(200), results.recv())
            .await
            .is_err(),
        "shouldn't have picked up any blobs to encode"
    );

    // and a new batch cannot be formed from it
    let err = harness.batcher.streamer.create_batch().await.unwrap_err();
    assert!(matches!(err, BatchError::NoEncodedResults));

    // same at a later reference block
    harness.chain.set_block_number(12);
    harness
        .batcher
        .streamer
        .request_encoding(&out)
        .await
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(200), results.recv())
            .await
            .is_err()
    );
    let err = harness.batcher.streamer.create_batch().await.unwrap_err();
    assert!(matches!(err, BatchError::NoEncodedResults));
}

#[tokio::test(start_paused = true)]
async fn batch_id_parse_retries_by_refetching_receipt() {
    let harness = make_batcher(2);
    let blob = make_test_blob(
        vec![SecurityParam {
            quorum_id: 0,
            adversary_threshold: 80,
            quorum_threshold: 90,
        }],
        rand_data(900),
    );
    let key = harness.blob_store.store_blob(&blob, 1).await.unwrap();

    drive_encoding(&harness, 1).await;
    harness.batcher.handle_single_batch().await.unwrap();

    // the initial receipt and the first re-fetch carry no usable log, the
    // second re-fetch does
    harness.eth_client.push_receipt(empty_log_receipt(123, TXN_HASH));
    harness
        .eth_client
        .push_receipt(confirmed_receipt(3, 123, TXN_HASH));

    harness
        .batcher
        .process_confirmed_batch(ReceiptResponse {
            result: Ok(empty_log_receipt(123, TXN_HASH)),
            metadata: harness.txn_manager.last_metadata(),
        })
        .await
        .unwrap();

    let metadata = harness.blob_store.get_blob_metadata(&key).await.unwrap();
    assert_eq!(metadata.blob_status, BlobStatus::Confirmed);
    assert_eq!(metadata.confirmation_info.unwrap().batch_id, 3);
}

#[tokio::test]
async fn partially_attested_batch_confirms_and_marks_shortfall() {
    let mut harness = make_batcher(2);
    // one operator abstains: quorum percentages land at 90
    harness.dispatcher.set_non_signers(&[9]);

    let reachable = make_test_blob(
        vec![SecurityParam {
            quorum_id: 0,
            adversary_threshold: 80,
            quorum_threshold: 90,
        }],
        rand_data(1100),
    );
    let unreachable = make_test_blob(
        vec![SecurityParam {
            quorum_id: 1,
            adversary_threshold: 70,
            quorum_threshold: 100,
        }],
        rand_data(700),
    );
    let key_ok = harness.blob_store.store_blob(&reachable, 1).await.unwrap();
    let key_short = harness
        .blob_store
        .store_blob(&unreachable, 2)
        .await
        .unwrap();

    drive_encoding(&harness, 2).await;
    harness.batcher.handle_single_batch().await.unwrap();
    harness
        .batcher
        .process_confirmed_batch(ReceiptResponse {
            result: Ok(confirmed_receipt(7, 200, TXN_HASH)),
            metadata: harness.txn_manager.last_metadata(),
        })
        .await
        .unwrap();

    let metadata = harness.blob_store.get_blob_metadata(&key_ok).await.unwrap();
    assert_eq!(metadata.blob_status, BlobStatus::Confirmed);
    let metadata = harness
        .blob_store
        .get_blob_metadata(&key_short)
        .await
        .unwrap();
    assert_eq!(metadata.blob_status, BlobStatus::InsufficientSignatures);
    // shortfall is terminal for the attempt: the blob is not retried
    assert_eq!(metadata.num_retries, 0);
    let info = metadata.confirmation_info.expect("shortfall info persisted");
    assert_eq!(info.quorum_results[&1].percent_signed, 90);

    let _ = harness.heartbeats.try_recv();
}

#[tokio::test]
async fn whole_batch_fails_when_no_quorum_reaches_threshold() {
    let harness = make_batcher(2);
    // only half the stake signs against a 90 percent threshold
    harness.dispatcher.set_non_signers(&[0, 1, 2, 3, 4]);

    let blob = make_test_blob(
        vec![SecurityParam {
            quorum_id: 0,
            adversary_threshold: 40,
            quorum_threshold: 90,
        }],
        rand_data(800),
    );
    let key = harness.blob_store.store_blob(&blob, 1).await.unwrap();

    drive_encoding(&harness, 1).await;
    let err = harness.batcher.handle_single_batch().await.unwrap_err();
    assert!(matches!(err, BatcherError::Aggregation(_)));

    // batch failure goes through retry accounting and purges encodings
    let metadata = harness.blob_store.get_blob_metadata(&key).await.unwrap();
    assert_eq!(metadata.blob_status, BlobStatus::Processing);
    assert_eq!(metadata.num_retries, 1);
    {
        let store = harness.batcher.streamer.encoded_store.lock().unwrap();
        assert_eq!(store.encoded_result_size().0, 0);
    }
}
