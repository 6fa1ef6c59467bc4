//! Identity Session Manager
//!
//! Owns one identity's key lifecycle: registration, rotation, cloud backup and
//! restore, password change, cleanup, plus encrypt/decrypt and public key
//! lookup on top of the local key.
//!
//! # Concurrency
//!
//! Every mutating operation holds the instance's [`SingleFlight`] guard for
//! its whole duration. A second mutating call while one is in flight fails
//! immediately with [`KeywardError::Multithread`]; the in-flight call is
//! unaffected. Coordination across processes or devices is the caller's
//! responsibility; the directory's `previous_card_id` chain shows divergence
//! after the fact.
//!
//! # Partial failure
//!
//! The local key is written before the card is published. If publishing
//! fails the key stays local and the next `register`/`rotate_private_key`
//! reuses it.

pub mod guard;

use std::collections::HashSet;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::brain_key::{BrainKey, DerivationContext, PasswordDerivation};
use crate::cloud::CloudStore;
use crate::config::ManagerConfig;
use crate::crypto::{CryptoProvider, KeyPair, PublicKey};
use crate::directory::{Card, CardDirectory, CardRequest};
use crate::local_store::LocalKeyStore;
use crate::lookup::{IdentityQuery, LookupAggregator, LookupOutcome};
use crate::token::{AccessToken, TokenContext, TokenProvider, TokenService};
use crate::types::{CloudError, CryptoError, DirectoryError, KeywardError, Result, TokenError};

pub use guard::{FlightGuard, SingleFlight};

/// External collaborators the manager composes
#[derive(Clone)]
pub struct Collaborators {
    pub tokens: Arc<dyn TokenProvider>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub local_store: Arc<dyn LocalKeyStore>,
    pub directory: Arc<dyn CardDirectory>,
    pub cloud: Arc<dyn CloudStore>,
    pub derivation: Arc<dyn PasswordDerivation>,
}

pub struct IdentityManager {
    identity: String,
    tokens: Arc<dyn TokenProvider>,
    crypto: Arc<dyn CryptoProvider>,
    local_store: Arc<dyn LocalKeyStore>,
    directory: Arc<dyn CardDirectory>,
    cloud: Arc<dyn CloudStore>,
    brain_key: BrainKey,
    lookup: LookupAggregator,
    flight: SingleFlight,
}

impl IdentityManager {
    pub fn new(
        identity: impl Into<String>,
        config: ManagerConfig,
        collaborators: Collaborators,
    ) -> Self {
        let identity = identity.into();
        let Collaborators {
            tokens,
            crypto,
            local_store,
            directory,
            cloud,
            derivation,
        } = collaborators;

        let brain_key = BrainKey::new(
            derivation,
            crypto.clone(),
            DerivationContext::new(config.application, identity.clone()),
        )
        .with_retry_delay(config.brain_key_retry_delay)
        .with_throttling_code(config.throttling_code);

        let lookup = LookupAggregator::new(directory.clone(), crypto.clone());

        Self {
            identity,
            tokens,
            crypto,
            local_store,
            directory,
            cloud,
            brain_key,
            lookup,
            flight: SingleFlight::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub async fn has_local_private_key(&self) -> Result<bool> {
        Ok(self.local_store.exists(&self.identity).await?)
    }

    /// Active cards of this identity, oldest first.
    pub async fn active_cards(&self) -> Result<Vec<Card>> {
        let token = self.token(TokenService::Directory, "search").await?;
        self.search_own_cards(&token).await
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Publish the first card for this identity.
    ///
    /// An existing local key is reused; otherwise a new key pair is generated
    /// and saved locally before publishing. Fails with
    /// [`KeywardError::IdentityAlreadyExists`] when an active card exists.
    pub async fn register(&self) -> Result<Card> {
        let _guard = self.flight.try_acquire("register")?;
        let token = self.token(TokenService::Directory, "register").await?;

        let (cards, local) =
            tokio::try_join!(self.search_own_cards(&token), self.load_local_key())?;

        if !cards.is_empty() {
            return Err(KeywardError::IdentityAlreadyExists(self.identity.clone()));
        }

        let keys = match local {
            Some(keys) => {
                debug!(
                    identity = %self.identity,
                    key_id = %keys.public_key.key_id_hex(),
                    "Reusing unpublished local key"
                );
                keys
            }
            None => self.generate_and_save().await?,
        };

        let request = CardRequest::signed(&self.identity, &keys, None, self.crypto.as_ref());
        let card = self
            .directory
            .publish(&token, request)
            .await
            .map_err(|e| match e {
                // Another instance published between our search and publish
                DirectoryError::Conflict(_) => {
                    KeywardError::IdentityAlreadyExists(self.identity.clone())
                }
                other => other.into(),
            })?;

        info!(
            identity = %self.identity,
            card_id = %card.id,
            key_id = %keys.public_key.key_id_hex(),
            "Registered identity"
        );
        Ok(card)
    }

    /// Replace the active card with one for a new key.
    ///
    /// A local key that differs from the active card's key (saved by an
    /// earlier rotation whose publish failed) is published as is.
    pub async fn rotate_private_key(&self) -> Result<Card> {
        let _guard = self.flight.try_acquire("rotate")?;
        let token = self.token(TokenService::Directory, "rotate").await?;

        let current = self.single_active_card(&token).await?;
        let current_key = current.public_key(self.crypto.as_ref())?;

        let keys = match self.load_local_key().await? {
            Some(keys) if keys.public_key != current_key => {
                debug!(
                    identity = %self.identity,
                    key_id = %keys.public_key.key_id_hex(),
                    "Reusing unpublished local key for rotation"
                );
                keys
            }
            _ => self.generate_and_save().await?,
        };

        let request = CardRequest::signed(
            &self.identity,
            &keys,
            Some(current.id.clone()),
            self.crypto.as_ref(),
        );
        let card = self
            .directory
            .publish(&token, request)
            .await
            .map_err(|e| match e {
                DirectoryError::Conflict(_) => KeywardError::CardSuperseded {
                    identity: self.identity.clone(),
                    card_id: current.id.clone(),
                },
                other => other.into(),
            })?;

        info!(
            identity = %self.identity,
            card_id = %card.id,
            previous_card_id = %current.id,
            key_id = %keys.public_key.key_id_hex(),
            "Rotated private key"
        );
        Ok(card)
    }

    /// Revoke every active card and remove the local key.
    ///
    /// Returns the number of revoked cards. Cloud backups are left alone.
    pub async fn unregister(&self) -> Result<usize> {
        let _guard = self.flight.try_acquire("unregister")?;
        let token = self.token(TokenService::Directory, "unregister").await?;

        let cards = self.search_own_cards(&token).await?;
        if cards.is_empty() {
            return Err(KeywardError::RegisterRequired);
        }

        for card in &cards {
            self.directory.revoke(&token, &card.id).await?;
        }
        self.local_store.remove(&self.identity).await?;

        info!(identity = %self.identity, revoked = cards.len(), "Unregistered identity");
        Ok(cards.len())
    }

    // =========================================================================
    // Backup
    // =========================================================================

    /// Store the local key in the cloud, encrypted under `password`.
    ///
    /// Repeating with the same password overwrites the previous backup.
    pub async fn backup_private_key(&self, password: &str) -> Result<()> {
        let _guard = self.flight.try_acquire("backup")?;
        let keys = self.require_local_key().await?;
        let token = self.token(TokenService::Cloud, "backup").await?;

        let mut session = self
            .brain_key
            .open_session(self.cloud.as_ref(), &token, password)
            .await?;
        let exported = self.crypto.export_private_key(&keys.private_key);
        session.store(&self.identity, &exported).await?;

        info!(
            identity = %self.identity,
            key_id = %keys.public_key.key_id_hex(),
            "Backed up private key"
        );
        Ok(())
    }

    /// Restore the local key from the cloud backup.
    pub async fn restore_private_key(&self, password: &str) -> Result<()> {
        let _guard = self.flight.try_acquire("restore")?;
        if self.local_store.exists(&self.identity).await? {
            return Err(KeywardError::PrivateKeyAlreadyExists);
        }
        let token = self.token(TokenService::Cloud, "restore").await?;

        let session = self
            .brain_key
            .open_session(self.cloud.as_ref(), &token, password)
            .await?;
        let exported = Zeroizing::new(
            session
                .retrieve(&self.identity)
                .await
                .map_err(no_backup_if_missing)?,
        );

        let keys = self.crypto.import_private_key(&exported)?;
        let stored = self.crypto.export_private_key(&keys.private_key);
        self.local_store.save(&self.identity, &stored).await?;

        info!(
            identity = %self.identity,
            key_id = %keys.public_key.key_id_hex(),
            "Restored private key from backup"
        );
        Ok(())
    }

    /// Delete the cloud backup; fails with
    /// [`KeywardError::PrivateKeyNoBackup`] when there is none.
    pub async fn reset_private_key_backup(&self, password: &str) -> Result<()> {
        let _guard = self.flight.try_acquire("reset_backup")?;
        let token = self.token(TokenService::Cloud, "reset_backup").await?;

        let mut session = self
            .brain_key
            .open_session(self.cloud.as_ref(), &token, password)
            .await?;
        session
            .delete(&self.identity)
            .await
            .map_err(no_backup_if_missing)?;

        info!(identity = %self.identity, "Reset private key backup");
        Ok(())
    }

    /// Re-encrypt the backup for keys derived from `new_password`.
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> Result<()> {
        let _guard = self.flight.try_acquire("change_password")?;
        let token = self.token(TokenService::Cloud, "change_password").await?;

        let mut session = self
            .brain_key
            .open_session(self.cloud.as_ref(), &token, old_password)
            .await?;
        if !session.contains(&self.identity) {
            return Err(KeywardError::PrivateKeyNoBackup);
        }

        let new_keys = self.brain_key.derive(new_password).await?;
        session.rotate_recipients(&new_keys).await?;

        info!(
            identity = %self.identity,
            entries = session.entry_names().len(),
            "Changed backup password"
        );
        Ok(())
    }

    /// Remove the cloud backup (if any) and the local key.
    ///
    /// Never fails because something is already absent. Returns whether a
    /// local key was removed.
    pub async fn cleanup(&self) -> Result<bool> {
        let _guard = self.flight.try_acquire("cleanup")?;
        let token = self.token(TokenService::Cloud, "cleanup").await?;

        let backup_removed = self.cloud.reset(&token).await?;
        let local_removed = self.local_store.remove(&self.identity).await?;

        info!(
            identity = %self.identity,
            local_removed,
            backup_removed,
            "Cleaned up identity"
        );
        Ok(local_removed)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Look up one identity (bare key) or a batch (keys in input order).
    pub async fn lookup_public_keys(
        &self,
        query: impl Into<IdentityQuery>,
    ) -> Result<LookupOutcome> {
        let query = query.into();
        if matches!(&query, IdentityQuery::Batch(identities) if identities.is_empty()) {
            return Err(KeywardError::EmptyArray("identities"));
        }

        let token = self.token(TokenService::Directory, "lookup").await?;
        self.lookup.lookup(&token, query).await
    }

    pub async fn lookup_public_key(&self, identity: &str) -> Result<PublicKey> {
        match self.lookup_public_keys(identity).await? {
            LookupOutcome::Single(key) => Ok(key),
            LookupOutcome::Batch(mut found) => found
                .pop()
                .map(|k| k.public_key)
                .ok_or(KeywardError::EmptyArray("identities")),
        }
    }

    // =========================================================================
    // Encryption
    // =========================================================================

    /// Encrypt and sign `data` with the local key.
    ///
    /// The caller's own key is always a recipient; `None` encrypts to self
    /// only, while an explicitly empty slice is rejected.
    pub async fn encrypt(&self, data: &[u8], recipients: Option<&[PublicKey]>) -> Result<Vec<u8>> {
        if matches!(recipients, Some([])) {
            return Err(KeywardError::EmptyArray("recipients"));
        }
        let keys = self.require_local_key().await?;

        let mut seen = HashSet::new();
        let all: Vec<PublicKey> = std::iter::once(keys.public_key)
            .chain(recipients.unwrap_or_default().iter().copied())
            .filter(|key| seen.insert(*key))
            .collect();

        Ok(self.crypto.encrypt(data, &all, Some(&keys.private_key))?)
    }

    /// Decrypt `data` with the local key, verifying the signature against
    /// `sender`, or against our own key when no sender is given.
    pub async fn decrypt(&self, data: &[u8], sender: Option<&PublicKey>) -> Result<Vec<u8>> {
        let keys = self.require_local_key().await?;
        let sender = sender.unwrap_or(&keys.public_key);
        Ok(self.crypto.decrypt(data, &keys.private_key, Some(sender))?)
    }

    pub async fn encrypt_text(&self, text: &str, recipients: Option<&[PublicKey]>) -> Result<String> {
        let ciphertext = self.encrypt(text.as_bytes(), recipients).await?;
        Ok(BASE64.encode(ciphertext))
    }

    pub async fn decrypt_text(&self, encoded: &str, sender: Option<&PublicKey>) -> Result<String> {
        let ciphertext = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::Serialization(format!("invalid base64: {e}")))?;
        let plaintext = self.decrypt(&ciphertext, sender).await?;
        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::Decryption("plaintext is not UTF-8".into()).into())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn token(&self, service: TokenService, operation: &'static str) -> Result<AccessToken> {
        let context = TokenContext {
            identity: self.identity.clone(),
            service,
            operation,
        };
        let token = self.tokens.get_token(&context).await?;
        if token.identity() != self.identity {
            return Err(TokenError(format!(
                "token provider returned a token for {} instead of {}",
                token.identity(),
                self.identity
            ))
            .into());
        }
        Ok(token)
    }

    async fn search_own_cards(&self, token: &AccessToken) -> Result<Vec<Card>> {
        Ok(self.directory.search(token, &self.identity).await?)
    }

    async fn single_active_card(&self, token: &AccessToken) -> Result<Card> {
        let mut cards = self.search_own_cards(token).await?;
        match cards.len() {
            0 => Err(KeywardError::RegisterRequired),
            1 => Ok(cards.remove(0)),
            count => Err(KeywardError::MultipleCards {
                identity: self.identity.clone(),
                count,
            }),
        }
    }

    async fn load_local_key(&self) -> Result<Option<KeyPair>> {
        match self.local_store.load(&self.identity).await? {
            Some(bytes) => Ok(Some(self.crypto.import_private_key(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn require_local_key(&self) -> Result<KeyPair> {
        self.load_local_key()
            .await?
            .ok_or(KeywardError::RegisterRequired)
    }

    async fn generate_and_save(&self) -> Result<KeyPair> {
        let keys = self.crypto.generate_key_pair()?;
        let exported = self.crypto.export_private_key(&keys.private_key);
        self.local_store.save(&self.identity, &exported).await?;
        debug!(
            identity = %self.identity,
            key_id = %keys.public_key.key_id_hex(),
            "Generated and saved new key pair"
        );
        Ok(keys)
    }
}

fn no_backup_if_missing(err: CloudError) -> KeywardError {
    match err {
        CloudError::EntryNotFound(_) => KeywardError::PrivateKeyNoBackup,
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain_key::Argon2Derivation;
    use crate::cloud::MemoryCloudStore;
    use crate::config::Argon2Params;
    use crate::crypto::Curve25519Crypto;
    use crate::directory::MemoryDirectory;
    use crate::local_store::MemoryKeyStore;
    use crate::token::LocalTokenProvider;
    use std::time::Duration;

    fn manager(identity: &str) -> IdentityManager {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(Curve25519Crypto::new());
        let collaborators = Collaborators {
            tokens: Arc::new(LocalTokenProvider::new(identity, Duration::from_secs(60))),
            crypto: crypto.clone(),
            local_store: Arc::new(MemoryKeyStore::new()),
            directory: Arc::new(MemoryDirectory::new(crypto.clone())),
            cloud: Arc::new(MemoryCloudStore::new(crypto)),
            derivation: Arc::new(
                Argon2Derivation::new(Argon2Params {
                    memory_kib: 64,
                    iterations: 1,
                    parallelism: 1,
                })
                .unwrap(),
            ),
        };
        IdentityManager::new(identity, ManagerConfig::default(), collaborators)
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let m = manager("alice");
        m.register().await.unwrap();
        assert!(m.has_local_private_key().await.unwrap());

        let result = m.register().await;
        assert!(matches!(result, Err(KeywardError::IdentityAlreadyExists(id)) if id == "alice"));
    }

    #[tokio::test]
    async fn test_operations_require_registration() {
        let m = manager("alice");
        assert!(matches!(m.rotate_private_key().await, Err(KeywardError::RegisterRequired)));
        assert!(matches!(m.backup_private_key("pw").await, Err(KeywardError::RegisterRequired)));
        assert!(matches!(m.encrypt(b"x", None).await, Err(KeywardError::RegisterRequired)));
        assert!(matches!(m.unregister().await, Err(KeywardError::RegisterRequired)));
    }

    #[tokio::test]
    async fn test_empty_recipients_rejected_before_key_check() {
        let m = manager("alice");
        let result = m.encrypt(b"x", Some(&[][..])).await;
        assert!(matches!(result, Err(KeywardError::EmptyArray("recipients"))));
    }

    #[tokio::test]
    async fn test_rotate_reuses_unpublished_local_key() {
        let m = manager("alice");
        let first = m.register().await.unwrap();

        // Simulate a rotation that saved a key but never published it
        let pending = m.crypto.generate_key_pair().unwrap();
        m.local_store
            .save("alice", &m.crypto.export_private_key(&pending.private_key))
            .await
            .unwrap();

        let second = m.rotate_private_key().await.unwrap();
        assert_eq!(second.previous_card_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(second.public_key(m.crypto.as_ref()).unwrap(), pending.public_key);
    }

    #[tokio::test]
    async fn test_unregister_revokes_and_removes_local_key() {
        let m = manager("alice");
        m.register().await.unwrap();

        assert_eq!(m.unregister().await.unwrap(), 1);
        assert!(!m.has_local_private_key().await.unwrap());
        assert!(m.active_cards().await.unwrap().is_empty());

        // Can register again afterwards
        m.register().await.unwrap();
    }

    #[tokio::test]
    async fn test_text_roundtrip() {
        let m = manager("alice");
        m.register().await.unwrap();

        let encoded = m.encrypt_text("hello", None).await.unwrap();
        assert_eq!(m.decrypt_text(&encoded, None).await.unwrap(), "hello");
        assert!(m.decrypt_text("not base64!", None).await.is_err());
    }
}
