//! In-memory local key store.
//!
//! Entries are zeroized when removed or overwritten.

use dashmap::DashMap;
use zeroize::Zeroizing;

use super::LocalKeyStore;
use crate::types::StoreError;

#[derive(Default)]
pub struct MemoryKeyStore {
    entries: DashMap<String, Zeroizing<Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl LocalKeyStore for MemoryKeyStore {
    async fn save(&self, identity: &str, secret_key: &[u8]) -> Result<(), StoreError> {
        self.entries
            .insert(identity.to_string(), Zeroizing::new(secret_key.to_vec()));
        Ok(())
    }

    async fn load(&self, identity: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        Ok(self.entries.get(identity).map(|entry| entry.value().clone()))
    }

    async fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(identity).is_some())
    }

    async fn exists(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.entries.contains_key(identity))
    }
}
