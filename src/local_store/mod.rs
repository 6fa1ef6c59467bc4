//! Local Key Store
//!
//! Persists exactly one secret key blob per identity on the local device.
//! The store never interprets the bytes; import/export is the crypto
//! provider's job.
//!
//! # Implementations
//!
//! - [`MemoryKeyStore`]: process-local, backed by a `DashMap`
//! - [`FileKeyStore`]: one JSON file per identity under a directory

pub mod file;
pub mod memory;

use zeroize::Zeroizing;

use crate::types::StoreError;

pub use file::FileKeyStore;
pub use memory::MemoryKeyStore;

/// Local secret key storage keyed by identity.
#[async_trait::async_trait]
pub trait LocalKeyStore: Send + Sync {
    /// Save the key for `identity`, replacing any existing entry.
    async fn save(&self, identity: &str, secret_key: &[u8]) -> Result<(), StoreError>;

    /// Load the key for `identity`, `None` when absent.
    async fn load(&self, identity: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError>;

    /// Remove the key for `identity`. Returns whether an entry existed.
    async fn remove(&self, identity: &str) -> Result<bool, StoreError>;

    async fn exists(&self, identity: &str) -> Result<bool, StoreError>;
}
