use rst_common::standard::async_trait::async_trait;
use rst_common::with_errors::thiserror::{self, Error};

/// `StorageError` is the base error type for the storage seam
///
/// [`StorageError::DataNotFound`] is a sentinel: callers that expect a key to
/// be absent (the first sighting of a protocol thread) match on it instead of
/// treating it as a failure
#[derive(Debug, PartialEq, Error, Clone)]
pub enum StorageError {
    #[error("data not found")]
    DataNotFound,

    #[error("unable to open store: {0}")]
    OpenStoreError(String),

    #[error("unable to put data: {0}")]
    PutError(String),

    #[error("unable to get data: {0}")]
    GetError(String),
}

/// `Store` is a flat key/value store holding serialized protocol entities
///
/// Implementations must provide atomic `put`/`get` per key. Transactions are
/// not required, the engine serializes access per protocol thread itself.
#[async_trait]
pub trait Store: Clone + Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Fetches the value stored under `key`, [`StorageError::DataNotFound`]
    /// when the key was never written
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Returns all entries whose key starts with `prefix`
    async fn iterate(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

/// `StorageProvider` opens named stores
///
/// Opening the same name twice must yield handles over the same underlying
/// data
pub trait StorageProvider: Clone + Send + Sync {
    type Store: Store;

    fn open_store(&self, name: &str) -> Result<Self::Store, StorageError>;
}
