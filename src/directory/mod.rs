//! Card Directory
//!
//! Public identity → public key bindings ("cards"). A card is immutable once
//! published; rotation publishes a new card whose `previous_card_id` points at
//! the card it supersedes, so each identity has a singly-linked history and
//! at most one active card.
//!
//! Cards are self-signed: the signature over the card snapshot is made with
//! the private key matching `public_key`.

pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{CryptoProvider, KeyPair, PublicKey};
use crate::token::AccessToken;
use crate::types::{base64_bytes, CryptoError, DirectoryError};

pub use memory::MemoryDirectory;

// =============================================================================
// Cards
// =============================================================================

/// A published card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub identity: String,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    pub previous_card_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

/// A signed card waiting to be published
#[derive(Debug, Clone)]
pub struct CardRequest {
    pub identity: String,
    pub public_key: Vec<u8>,
    pub previous_card_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub signature: Vec<u8>,
}

/// Canonical bytes covered by the card id and self-signature.
///
/// Length-prefixed fields followed by the creation time in milliseconds.
pub fn card_snapshot(
    identity: &str,
    public_key: &[u8],
    previous_card_id: Option<&str>,
    created_at: &DateTime<Utc>,
) -> Vec<u8> {
    let previous = previous_card_id.unwrap_or_default();
    let mut out = Vec::with_capacity(identity.len() + public_key.len() + previous.len() + 20);
    for field in [identity.as_bytes(), public_key, previous.as_bytes()] {
        out.extend_from_slice(&(field.len() as u32).to_be_bytes());
        out.extend_from_slice(field);
    }
    out.extend_from_slice(&created_at.timestamp_millis().to_be_bytes());
    out
}

impl CardRequest {
    /// Build and self-sign a card request for `key_pair`.
    pub fn signed(
        identity: &str,
        key_pair: &KeyPair,
        previous_card_id: Option<String>,
        crypto: &dyn CryptoProvider,
    ) -> Self {
        let public_key = crypto.export_public_key(&key_pair.public_key);
        let created_at = Utc::now();
        let snapshot = card_snapshot(
            identity,
            &public_key,
            previous_card_id.as_deref(),
            &created_at,
        );
        let signature = crypto.sign(&snapshot, &key_pair.private_key);

        Self {
            identity: identity.to_string(),
            public_key,
            previous_card_id,
            created_at,
            signature,
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        card_snapshot(
            &self.identity,
            &self.public_key,
            self.previous_card_id.as_deref(),
            &self.created_at,
        )
    }
}

impl Card {
    /// Materialize a published card; the id is the hex SHA-256 of the snapshot.
    pub fn from_request(request: CardRequest) -> Self {
        let id = hex::encode(Sha256::digest(request.snapshot()));
        Self {
            id,
            identity: request.identity,
            public_key: request.public_key,
            previous_card_id: request.previous_card_id,
            created_at: request.created_at,
            signature: request.signature,
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        card_snapshot(
            &self.identity,
            &self.public_key,
            self.previous_card_id.as_deref(),
            &self.created_at,
        )
    }

    pub fn public_key(&self, crypto: &dyn CryptoProvider) -> Result<PublicKey, CryptoError> {
        crypto.import_public_key(&self.public_key)
    }

    /// Check the self-signature against the card's own public key.
    pub fn verify_self_signature(&self, crypto: &dyn CryptoProvider) -> Result<(), CryptoError> {
        let key = self.public_key(crypto)?;
        crypto.verify(&self.snapshot(), &self.signature, &key)
    }
}

// =============================================================================
// Directory Trait
// =============================================================================

/// Public card directory.
#[async_trait::async_trait]
pub trait CardDirectory: Send + Sync {
    /// Publish a card. When `previous_card_id` is set, that card must be the
    /// identity's active card and becomes superseded.
    async fn publish(&self, token: &AccessToken, request: CardRequest)
        -> Result<Card, DirectoryError>;

    /// Active (non-superseded, non-revoked) cards for `identity`, oldest first.
    async fn search(&self, token: &AccessToken, identity: &str)
        -> Result<Vec<Card>, DirectoryError>;

    /// Fetch any card by id, including superseded ones.
    async fn get(&self, token: &AccessToken, card_id: &str) -> Result<Card, DirectoryError>;

    /// Revoke an active card owned by the token's identity.
    async fn revoke(&self, token: &AccessToken, card_id: &str) -> Result<(), DirectoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Curve25519Crypto;

    #[test]
    fn test_card_id_and_signature() {
        let crypto = Curve25519Crypto::new();
        let keys = crypto.generate_key_pair().unwrap();

        let request = CardRequest::signed("alice", &keys, None, &crypto);
        let card = Card::from_request(request);

        assert_eq!(card.id.len(), 64);
        assert!(card.verify_self_signature(&crypto).is_ok());
        assert_eq!(card.public_key(&crypto).unwrap(), keys.public_key);
    }

    #[test]
    fn test_tampered_card_fails_verification() {
        let crypto = Curve25519Crypto::new();
        let keys = crypto.generate_key_pair().unwrap();

        let mut card = Card::from_request(CardRequest::signed("alice", &keys, None, &crypto));
        card.identity = "mallory".to_string();

        assert!(card.verify_self_signature(&crypto).is_err());
    }

    #[test]
    fn test_snapshot_distinguishes_previous_card() {
        let now = Utc::now();
        let a = card_snapshot("alice", b"key", None, &now);
        let b = card_snapshot("alice", b"key", Some("abc"), &now);
        assert_ne!(a, b);
    }
}
