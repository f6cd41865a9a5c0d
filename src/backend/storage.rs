//! Namespaced CAS view handed to job handlers.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use super::record::USER_PREFIX;
use super::CasStorage;
use crate::store::{CasStore, Entry};
use crate::types::{Error, Result};

/// Pass-through to a [`CasStore`] confined to the `/user/` namespace, so
/// handlers cannot touch job records or leases.
pub struct NamespacedStorage<S: CasStore> {
    store: Arc<S>,
}

impl<S: CasStore> NamespacedStorage<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    fn full_key(key: &str) -> Result<String> {
        if key.is_empty() || key.starts_with('/') {
            return Err(Error::validation(format!("invalid storage key: {:?}", key)));
        }
        Ok(format!("{}{}", USER_PREFIX, key))
    }

    fn strip(mut entry: Entry) -> Entry {
        if let Some(key) = entry.key.strip_prefix(USER_PREFIX) {
            entry.key = key.to_string();
        }
        entry
    }
}

impl<S: CasStore> fmt::Debug for NamespacedStorage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespacedStorage")
            .field("prefix", &USER_PREFIX)
            .finish()
    }
}

#[async_trait]
impl<S: CasStore> CasStorage for NamespacedStorage<S> {
    async fn get(&self, key: &str) -> Result<Entry> {
        let entry = self.store.get(&Self::full_key(key)?).await?;
        Ok(Self::strip(entry))
    }

    async fn set(&self, key: &str, value: Bytes, expected_version: Option<u64>) -> Result<u64> {
        self.store.set(&Self::full_key(key)?, value, expected_version).await
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<u64> {
        self.store.create(&Self::full_key(key)?, value).await
    }

    async fn delete(&self, key: &str, expected_version: Option<u64>) -> Result<()> {
        self.store.delete(&Self::full_key(key)?, expected_version).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_keys_are_namespaced() {
        let store = Arc::new(MemoryStore::new());
        let storage = NamespacedStorage::new(store.clone());

        storage.create("sent/email-1", Bytes::from_static(b"{}")).await.unwrap();
        assert!(store.get("/user/sent/email-1").await.is_ok());

        let entry = storage.get("sent/email-1").await.unwrap();
        assert_eq!(entry.key, "sent/email-1");
        assert_eq!(entry.version, 1);
    }

    #[tokio::test]
    async fn test_rejects_absolute_keys() {
        let storage = NamespacedStorage::new(Arc::new(MemoryStore::new()));
        let err = storage.get("/jobs/x").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_get_json_missing_is_none() {
        let storage = NamespacedStorage::new(Arc::new(MemoryStore::new()));
        assert!(storage.get_json("nothing").await.unwrap().is_none());

        storage.set("doc", Bytes::from_static(b"{\"n\":1}"), None).await.unwrap();
        let (doc, version) = storage.get_json("doc").await.unwrap().unwrap();
        assert_eq!(doc["n"], 1);
        assert_eq!(version, 1);
    }
}
