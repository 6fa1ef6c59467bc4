//! In-memory cloud store with optional JSON persistence.
//!
//! The stored value per account is a signed, encrypted MessagePack map of
//! entries. The store only ever sees ciphertext.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use zeroize::Zeroizing;

use super::{CloudSession, CloudStore};
use crate::crypto::{CryptoProvider, KeyPair};
use crate::persist;
use crate::token::AccessToken;
use crate::types::{base64_bytes, CloudError, CryptoError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredValue {
    #[serde(with = "base64_bytes")]
    ciphertext: Vec<u8>,
    revision: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CloudState {
    accounts: HashMap<String, StoredValue>,
}

struct Shared {
    state: RwLock<CloudState>,
    crypto: Arc<dyn CryptoProvider>,
    persist_path: Option<PathBuf>,
}

impl Shared {
    async fn persist(&self, state: &CloudState) -> Result<(), CloudError> {
        if let Some(path) = &self.persist_path {
            persist::save_json(path, state)
                .await
                .map_err(|e| CloudError::Unavailable(format!("cannot save {}: {e}", path.display())))?;
        }
        Ok(())
    }
}

fn authorize(token: &AccessToken) -> Result<(), CloudError> {
    if token.is_expired() {
        return Err(CloudError::Unauthorized("access token expired".into()));
    }
    Ok(())
}

// =============================================================================
// Store
// =============================================================================

pub struct MemoryCloudStore {
    shared: Arc<Shared>,
}

impl MemoryCloudStore {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(CloudState::default()),
                crypto,
                persist_path: None,
            }),
        }
    }

    /// Open a store persisted at `path`, loading any existing snapshot.
    pub async fn open(
        path: impl AsRef<Path>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self, CloudError> {
        let path = path.as_ref().to_path_buf();
        let state: CloudState = persist::load_json(&path)
            .await
            .map_err(|e| CloudError::Unavailable(format!("cannot load {}: {e}", path.display())))?;

        Ok(Self {
            shared: Arc::new(Shared {
                state: RwLock::new(state),
                crypto,
                persist_path: Some(path),
            }),
        })
    }

    /// Whether an account currently holds a value.
    pub async fn has_account(&self, identity: &str) -> bool {
        self.shared.state.read().await.accounts.contains_key(identity)
    }
}

#[async_trait::async_trait]
impl CloudStore for MemoryCloudStore {
    async fn open_session(
        &self,
        token: &AccessToken,
        keys: &KeyPair,
    ) -> Result<Box<dyn CloudSession>, CloudError> {
        authorize(token)?;

        let stored = self
            .shared
            .state
            .read()
            .await
            .accounts
            .get(token.identity())
            .cloned();

        let (entries, revision) = match stored {
            Some(value) => {
                let plaintext = Zeroizing::new(
                    self.shared
                        .crypto
                        .decrypt(&value.ciphertext, &keys.private_key, Some(&keys.public_key))
                        .map_err(|e| match e {
                            CryptoError::Serialization(msg) => CloudError::Serialization(msg),
                            _ => CloudError::DecryptionFailed,
                        })?,
                );
                let entries: BTreeMap<String, Vec<u8>> = rmp_serde::from_slice(&plaintext)
                    .map_err(|e| CloudError::Serialization(e.to_string()))?;
                (entries, value.revision)
            }
            None => (BTreeMap::new(), 0),
        };

        debug!(
            identity = %token.identity(),
            entries = entries.len(),
            revision,
            "Opened cloud session"
        );

        Ok(Box::new(MemoryCloudSession {
            shared: self.shared.clone(),
            account: token.identity().to_string(),
            keys: keys.clone(),
            entries,
        }))
    }

    async fn reset(&self, token: &AccessToken) -> Result<bool, CloudError> {
        authorize(token)?;
        let mut state = self.shared.state.write().await;
        let existed = state.accounts.remove(token.identity()).is_some();
        if existed {
            self.shared.persist(&state).await?;
            debug!(identity = %token.identity(), "Reset cloud account");
        }
        Ok(existed)
    }
}

// =============================================================================
// Session
// =============================================================================

struct MemoryCloudSession {
    shared: Arc<Shared>,
    account: String,
    keys: KeyPair,
    entries: BTreeMap<String, Vec<u8>>,
}

impl Drop for MemoryCloudSession {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        for value in self.entries.values_mut() {
            value.zeroize();
        }
    }
}

impl MemoryCloudSession {
    /// Encrypt the current entries for the session keys and write them back.
    async fn push(&self) -> Result<(), CloudError> {
        let mut state = self.shared.state.write().await;

        if self.entries.is_empty() {
            state.accounts.remove(&self.account);
        } else {
            let plaintext = Zeroizing::new(
                rmp_serde::to_vec(&self.entries)
                    .map_err(|e| CloudError::Serialization(e.to_string()))?,
            );
            let ciphertext = self
                .shared
                .crypto
                .encrypt(&plaintext, &[self.keys.public_key], Some(&self.keys.private_key))
                .map_err(|e| CloudError::Serialization(e.to_string()))?;

            let revision = state
                .accounts
                .get(&self.account)
                .map(|v| v.revision + 1)
                .unwrap_or(1);
            state.accounts.insert(
                self.account.clone(),
                StoredValue {
                    ciphertext,
                    revision,
                    updated_at: Utc::now(),
                },
            );
        }

        self.shared.persist(&state).await
    }
}

#[async_trait::async_trait]
impl CloudSession for MemoryCloudSession {
    async fn store(&mut self, name: &str, value: &[u8]) -> Result<(), CloudError> {
        self.entries.insert(name.to_string(), value.to_vec());
        self.push().await
    }

    async fn retrieve(&self, name: &str) -> Result<Vec<u8>, CloudError> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::EntryNotFound(name.to_string()))
    }

    async fn delete(&mut self, name: &str) -> Result<(), CloudError> {
        if self.entries.remove(name).is_none() {
            return Err(CloudError::EntryNotFound(name.to_string()));
        }
        self.push().await
    }

    fn entry_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    async fn rotate_recipients(&mut self, new_keys: &KeyPair) -> Result<(), CloudError> {
        self.keys = new_keys.clone();
        self.push().await?;
        debug!(
            identity = %self.account,
            key_id = %new_keys.public_key.key_id_hex(),
            "Rotated cloud recipients"
        );
        Ok(())
    }
}
