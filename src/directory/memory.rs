//! In-memory card directory with optional JSON persistence.
//!
//! Enforces the directory-side invariants: self-signatures must verify,
//! tokens may only publish or revoke cards of their own identity, and an
//! identity never ends up with two active cards.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{Card, CardDirectory, CardRequest};
use crate::crypto::CryptoProvider;
use crate::persist;
use crate::token::AccessToken;
use crate::types::DirectoryError;

#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryState {
    cards: HashMap<String, Card>,
    superseded: HashSet<String>,
    revoked: HashSet<String>,
}

impl DirectoryState {
    fn is_active(&self, card_id: &str) -> bool {
        !self.superseded.contains(card_id) && !self.revoked.contains(card_id)
    }

    fn active_cards(&self, identity: &str) -> Vec<Card> {
        let mut cards: Vec<Card> = self
            .cards
            .values()
            .filter(|card| card.identity == identity && self.is_active(&card.id))
            .cloned()
            .collect();
        cards.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        cards
    }
}

pub struct MemoryDirectory {
    state: RwLock<DirectoryState>,
    crypto: Arc<dyn CryptoProvider>,
    persist_path: Option<PathBuf>,
}

impl MemoryDirectory {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
            crypto,
            persist_path: None,
        }
    }

    /// Open a directory persisted at `path`, loading any existing snapshot.
    pub async fn open(
        path: impl AsRef<Path>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self, DirectoryError> {
        let path = path.as_ref().to_path_buf();
        let state: DirectoryState = persist::load_json(&path)
            .await
            .map_err(|e| DirectoryError::Unavailable(format!("cannot load {}: {e}", path.display())))?;

        debug!(path = %path.display(), cards = state.cards.len(), "Loaded directory snapshot");

        Ok(Self {
            state: RwLock::new(state),
            crypto,
            persist_path: Some(path),
        })
    }

    async fn persist(&self, state: &DirectoryState) -> Result<(), DirectoryError> {
        if let Some(path) = &self.persist_path {
            persist::save_json(path, state)
                .await
                .map_err(|e| DirectoryError::Unavailable(format!("cannot save {}: {e}", path.display())))?;
        }
        Ok(())
    }

    fn authorize(token: &AccessToken) -> Result<(), DirectoryError> {
        if token.is_expired() {
            return Err(DirectoryError::Unauthorized("access token expired".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CardDirectory for MemoryDirectory {
    async fn publish(
        &self,
        token: &AccessToken,
        request: CardRequest,
    ) -> Result<Card, DirectoryError> {
        Self::authorize(token)?;
        if token.identity() != request.identity {
            return Err(DirectoryError::Unauthorized(format!(
                "token for {} cannot publish cards for {}",
                token.identity(),
                request.identity
            )));
        }

        let card = Card::from_request(request);
        card.verify_self_signature(self.crypto.as_ref())
            .map_err(|_| DirectoryError::InvalidSignature(card.identity.clone()))?;

        let mut state = self.state.write().await;
        let active = state.active_cards(&card.identity);

        match &card.previous_card_id {
            Some(previous) => {
                if !active.iter().any(|c| &c.id == previous) {
                    return Err(DirectoryError::Conflict(format!(
                        "previous card {previous} is not the active card of {}",
                        card.identity
                    )));
                }
                state.superseded.insert(previous.clone());
            }
            None if !active.is_empty() => {
                return Err(DirectoryError::Conflict(format!(
                    "{} already has an active card",
                    card.identity
                )));
            }
            None => {}
        }

        state.cards.insert(card.id.clone(), card.clone());
        self.persist(&state).await?;

        info!(
            identity = %card.identity,
            card_id = %card.id,
            previous_card_id = ?card.previous_card_id,
            "Published card"
        );
        Ok(card)
    }

    async fn search(
        &self,
        token: &AccessToken,
        identity: &str,
    ) -> Result<Vec<Card>, DirectoryError> {
        Self::authorize(token)?;
        Ok(self.state.read().await.active_cards(identity))
    }

    async fn get(&self, token: &AccessToken, card_id: &str) -> Result<Card, DirectoryError> {
        Self::authorize(token)?;
        self.state
            .read()
            .await
            .cards
            .get(card_id)
            .cloned()
            .ok_or_else(|| DirectoryError::CardNotFound(card_id.to_string()))
    }

    async fn revoke(&self, token: &AccessToken, card_id: &str) -> Result<(), DirectoryError> {
        Self::authorize(token)?;

        let mut state = self.state.write().await;
        let card = state
            .cards
            .get(card_id)
            .filter(|_| state.is_active(card_id))
            .cloned()
            .ok_or_else(|| DirectoryError::CardNotFound(card_id.to_string()))?;

        if card.identity != token.identity() {
            return Err(DirectoryError::Unauthorized(format!(
                "token for {} cannot revoke cards of {}",
                token.identity(),
                card.identity
            )));
        }

        state.revoked.insert(card_id.to_string());
        self.persist(&state).await?;

        info!(identity = %card.identity, card_id = %card_id, "Revoked card");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Curve25519Crypto;
    use tempfile::TempDir;

    fn token(identity: &str) -> AccessToken {
        AccessToken::new(identity, "test", None)
    }

    fn directory() -> (MemoryDirectory, Arc<dyn CryptoProvider>) {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(Curve25519Crypto::new());
        (MemoryDirectory::new(crypto.clone()), crypto)
    }

    #[tokio::test]
    async fn test_publish_and_search() {
        let (dir, crypto) = directory();
        let keys = crypto.generate_key_pair().unwrap();

        let card = dir
            .publish(&token("alice"), CardRequest::signed("alice", &keys, None, crypto.as_ref()))
            .await
            .unwrap();

        let found = dir.search(&token("bob"), "alice").await.unwrap();
        assert_eq!(found, vec![card]);
        assert!(dir.search(&token("bob"), "carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_card_without_previous_conflicts() {
        let (dir, crypto) = directory();
        let first = crypto.generate_key_pair().unwrap();
        let second = crypto.generate_key_pair().unwrap();

        dir.publish(&token("alice"), CardRequest::signed("alice", &first, None, crypto.as_ref()))
            .await
            .unwrap();

        let result = dir
            .publish(&token("alice"), CardRequest::signed("alice", &second, None, crypto.as_ref()))
            .await;
        assert!(matches!(result, Err(DirectoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_rotation_supersedes_previous() {
        let (dir, crypto) = directory();
        let first = crypto.generate_key_pair().unwrap();
        let second = crypto.generate_key_pair().unwrap();

        let old = dir
            .publish(&token("alice"), CardRequest::signed("alice", &first, None, crypto.as_ref()))
            .await
            .unwrap();
        let new = dir
            .publish(
                &token("alice"),
                CardRequest::signed("alice", &second, Some(old.id.clone()), crypto.as_ref()),
            )
            .await
            .unwrap();

        let active = dir.search(&token("alice"), "alice").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, new.id);
        assert_eq!(active[0].previous_card_id.as_deref(), Some(old.id.as_str()));

        // Superseded card is still retrievable
        assert_eq!(dir.get(&token("alice"), &old.id).await.unwrap(), old);

        // Superseding a non-active card is rejected
        let third = crypto.generate_key_pair().unwrap();
        let result = dir
            .publish(
                &token("alice"),
                CardRequest::signed("alice", &third, Some(old.id.clone()), crypto.as_ref()),
            )
            .await;
        assert!(matches!(result, Err(DirectoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_publish_rejects_foreign_identity_and_bad_signature() {
        let (dir, crypto) = directory();
        let keys = crypto.generate_key_pair().unwrap();

        let result = dir
            .publish(&token("mallory"), CardRequest::signed("alice", &keys, None, crypto.as_ref()))
            .await;
        assert!(matches!(result, Err(DirectoryError::Unauthorized(_))));

        let mut request = CardRequest::signed("alice", &keys, None, crypto.as_ref());
        request.signature[0] ^= 0xff;
        let result = dir.publish(&token("alice"), request).await;
        assert!(matches!(result, Err(DirectoryError::InvalidSignature(_))));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let (dir, _) = directory();
        let expired = AccessToken::new(
            "alice",
            "old",
            Some(chrono::Utc::now() - chrono::Duration::seconds(5)),
        );
        let result = dir.search(&expired, "alice").await;
        assert!(matches!(result, Err(DirectoryError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_revoke() {
        let (dir, crypto) = directory();
        let keys = crypto.generate_key_pair().unwrap();
        let card = dir
            .publish(&token("alice"), CardRequest::signed("alice", &keys, None, crypto.as_ref()))
            .await
            .unwrap();

        let result = dir.revoke(&token("bob"), &card.id).await;
        assert!(matches!(result, Err(DirectoryError::Unauthorized(_))));

        dir.revoke(&token("alice"), &card.id).await.unwrap();
        assert!(dir.search(&token("alice"), "alice").await.unwrap().is_empty());

        let result = dir.revoke(&token("alice"), &card.id).await;
        assert!(matches!(result, Err(DirectoryError::CardNotFound(_))));
    }

    #[tokio::test]
    async fn test_persisted_directory_reloads() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("directory.json");
        let crypto: Arc<dyn CryptoProvider> = Arc::new(Curve25519Crypto::new());
        let keys = crypto.generate_key_pair().unwrap();

        let card = {
            let dir = MemoryDirectory::open(&path, crypto.clone()).await.unwrap();
            dir.publish(&token("alice"), CardRequest::signed("alice", &keys, None, crypto.as_ref()))
                .await
                .unwrap()
        };

        let reopened = MemoryDirectory::open(&path, crypto.clone()).await.unwrap();
        let found = reopened.search(&token("alice"), "alice").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, card.id);
        assert!(found[0].verify_self_signature(crypto.as_ref()).is_ok());
    }
}
