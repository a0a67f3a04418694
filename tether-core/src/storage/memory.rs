use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::types::{StorageError, StorageProvider, Store};

use rst_common::standard::async_trait::async_trait;

/// `MemoryStore` is the in-memory [`Store`] adapter
///
/// Cloned handles share the same underlying map, matching the provider
/// contract that a store name always resolves to the same data
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|err| StorageError::PutError(err.to_string()))?;

        data.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let data = self
            .data
            .read()
            .map_err(|err| StorageError::GetError(err.to_string()))?;

        data.get(key).cloned().ok_or(StorageError::DataNotFound)
    }

    async fn iterate(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let data = self
            .data
            .read()
            .map_err(|err| StorageError::GetError(err.to_string()))?;

        let mut entries: Vec<(String, Vec<u8>)> = data
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();

        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

/// `MemoryProvider` hands out [`MemoryStore`] instances keyed by name
#[derive(Clone, Debug, Default)]
pub struct MemoryProvider {
    stores: Arc<RwLock<HashMap<String, MemoryStore>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageProvider for MemoryProvider {
    type Store = MemoryStore;

    fn open_store(&self, name: &str) -> Result<Self::Store, StorageError> {
        let mut stores = self
            .stores
            .write()
            .map_err(|err| StorageError::OpenStoreError(err.to_string()))?;

        Ok(stores.entry(name.to_string()).or_default().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rst_common::with_tokio::tokio;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryStore::new();
        store.put("key-1", b"value-1".to_vec()).await.unwrap();

        let value = store.get("key-1").await;
        assert!(value.is_ok());
        assert_eq!(value.unwrap(), b"value-1".to_vec());
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = MemoryStore::new();
        let value = store.get("missing").await;

        assert!(value.is_err());
        assert_eq!(value.unwrap_err(), StorageError::DataNotFound);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = MemoryStore::new();
        store.put("key-1", b"old".to_vec()).await.unwrap();
        store.put("key-1", b"new".to_vec()).await.unwrap();

        assert_eq!(store.get("key-1").await.unwrap(), b"new".to_vec());
    }

    #[tokio::test]
    async fn test_iterate_prefix() {
        let store = MemoryStore::new();
        store.put("conn:a", b"1".to_vec()).await.unwrap();
        store.put("conn:b", b"2".to_vec()).await.unwrap();
        store.put("inv:a", b"3".to_vec()).await.unwrap();

        let entries = store.iterate("conn:").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "conn:a");
        assert_eq!(entries[1].0, "conn:b");
    }

    #[tokio::test]
    async fn test_provider_shares_store_data() {
        let provider = MemoryProvider::new();

        let store_1 = provider.open_store("didexchange").unwrap();
        store_1.put("key-1", b"shared".to_vec()).await.unwrap();

        let store_2 = provider.open_store("didexchange").unwrap();
        assert_eq!(store_2.get("key-1").await.unwrap(), b"shared".to_vec());

        let other = provider.open_store("other").unwrap();
        assert_eq!(
            other.get("key-1").await.unwrap_err(),
            StorageError::DataNotFound
        );
    }
}
