//! Cloud Key-Value Store
//!
//! Each account (identity) holds one encrypted envelope containing a map of
//! named entries. A session is opened with a key pair: opening syncs and
//! decrypts the envelope, and every write re-encrypts it for the session
//! keys. An envelope that the session keys cannot decrypt is reported as
//! [`CloudError::DecryptionFailed`], which callers treat as a wrong password.

pub mod memory;

use crate::crypto::KeyPair;
use crate::token::AccessToken;
use crate::types::CloudError;

pub use memory::MemoryCloudStore;

/// Cloud store entry point.
#[async_trait::async_trait]
pub trait CloudStore: Send + Sync {
    /// Open a session scoped to `keys` and sync the account's entries.
    async fn open_session(
        &self,
        token: &AccessToken,
        keys: &KeyPair,
    ) -> Result<Box<dyn CloudSession>, CloudError>;

    /// Delete the whole account value without decrypting it.
    ///
    /// Returns whether anything was stored.
    async fn reset(&self, token: &AccessToken) -> Result<bool, CloudError>;
}

/// An open, decrypted view of one account.
#[async_trait::async_trait]
pub trait CloudSession: Send + Sync {
    /// Store `value` under `name`, overwriting any existing entry.
    async fn store(&mut self, name: &str, value: &[u8]) -> Result<(), CloudError>;

    /// Fails with [`CloudError::EntryNotFound`] when absent.
    async fn retrieve(&self, name: &str) -> Result<Vec<u8>, CloudError>;

    /// Fails with [`CloudError::EntryNotFound`] when absent.
    async fn delete(&mut self, name: &str) -> Result<(), CloudError>;

    fn entry_names(&self) -> Vec<String>;

    fn contains(&self, name: &str) -> bool {
        self.entry_names().iter().any(|n| n == name)
    }

    /// Re-encrypt every entry for `new_keys`; later writes use them too.
    async fn rotate_recipients(&mut self, new_keys: &KeyPair) -> Result<(), CloudError>;
}
