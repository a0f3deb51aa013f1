pub mod aggregator;
pub mod batcher;
pub mod dispatcher;
pub mod encoded_store;
pub mod finalizer;
pub mod store;
pub mod streamer;
pub mod txn_manager;

pub use aggregator::SignatureAggregator;
pub use batcher::{Batcher, BatcherConfig, ConfirmationMetadata, TimeoutConfig};
pub use dispatcher::{Dispatcher, EncodedBlob, SigningReply};
pub use finalizer::{ChainFinalizer, Finalizer};
pub use store::{BlobStore, InMemoryBlobStore};
pub use streamer::{Batch, EncodingStreamer, StreamerConfig};
pub use txn_manager::{
    EthClient, GasPriceTxnManager, ReceiptResponse, Transaction, TransactionReceipt, Transactor,
    TxnManager, TxnRequest,
};
