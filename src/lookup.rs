//! Batch public key lookup.
//!
//! Every identity is searched independently and concurrently. One identity
//! failing never cancels the others: the outcome is either every key (in
//! input order) or a [`LookupError`] holding both the resolved keys and the
//! per-identity rejections.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::debug;

use crate::crypto::{CryptoProvider, PublicKey};
use crate::directory::CardDirectory;
use crate::token::AccessToken;
use crate::types::{CryptoError, DirectoryError, KeywardError, Result};

// =============================================================================
// Query / Outcome
// =============================================================================

/// One identity or an ordered batch of identities
#[derive(Debug, Clone)]
pub enum IdentityQuery {
    Single(String),
    Batch(Vec<String>),
}

impl From<&str> for IdentityQuery {
    fn from(identity: &str) -> Self {
        Self::Single(identity.to_string())
    }
}

impl From<String> for IdentityQuery {
    fn from(identity: String) -> Self {
        Self::Single(identity)
    }
}

impl From<Vec<String>> for IdentityQuery {
    fn from(identities: Vec<String>) -> Self {
        Self::Batch(identities)
    }
}

impl From<&[&str]> for IdentityQuery {
    fn from(identities: &[&str]) -> Self {
        Self::Batch(identities.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for IdentityQuery {
    fn from(identities: [&str; N]) -> Self {
        Self::Batch(identities.iter().map(|s| s.to_string()).collect())
    }
}

/// A single query resolves to a bare key, a batch to the ordered list.
#[derive(Debug, Clone)]
pub enum LookupOutcome {
    Single(PublicKey),
    Batch(Vec<LookedUpKey>),
}

impl LookupOutcome {
    /// Keys in input order, regardless of query shape.
    pub fn into_keys(self) -> Vec<PublicKey> {
        match self {
            Self::Single(key) => vec![key],
            Self::Batch(found) => found.into_iter().map(|k| k.public_key).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookedUpKey {
    pub identity: String,
    pub card_id: String,
    pub public_key: PublicKey,
}

// =============================================================================
// Errors
// =============================================================================

/// Why one identity in a lookup could not be resolved
#[derive(Debug, thiserror::Error)]
pub enum LookupFailure {
    /// The directory has no active card for the identity
    #[error("no card published")]
    NotFound,

    #[error("{0} active cards")]
    MultipleCards(usize),

    #[error("{0}")]
    Directory(DirectoryError),

    #[error("card key is invalid: {0}")]
    InvalidKey(CryptoError),
}

#[derive(Debug)]
pub struct LookupRejection {
    pub identity: String,
    pub reason: LookupFailure,
}

/// At least one identity failed to resolve.
#[derive(Debug, thiserror::Error)]
#[error(
    "Public key lookup failed for {} identities ({} resolved)",
    .rejected.len(),
    .resolved.len()
)]
pub struct LookupError {
    /// Successfully resolved keys, in input order
    pub resolved: Vec<LookedUpKey>,
    /// Failed identities, in input order
    pub rejected: Vec<LookupRejection>,
}

impl LookupError {
    pub fn is_not_found(&self, identity: &str) -> bool {
        self.rejected
            .iter()
            .any(|r| r.identity == identity && matches!(r.reason, LookupFailure::NotFound))
    }
}

// =============================================================================
// Aggregator
// =============================================================================

pub struct LookupAggregator {
    directory: Arc<dyn CardDirectory>,
    crypto: Arc<dyn CryptoProvider>,
}

impl LookupAggregator {
    pub fn new(directory: Arc<dyn CardDirectory>, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self { directory, crypto }
    }

    /// Resolve `query`. An empty batch fails before any directory call.
    pub async fn lookup(&self, token: &AccessToken, query: IdentityQuery) -> Result<LookupOutcome> {
        match query {
            IdentityQuery::Single(identity) => {
                let mut found = self.lookup_batch(token, vec![identity]).await?;
                match found.pop() {
                    Some(key) => Ok(LookupOutcome::Single(key.public_key)),
                    None => Err(KeywardError::EmptyArray("identities")),
                }
            }
            IdentityQuery::Batch(identities) => {
                Ok(LookupOutcome::Batch(self.lookup_batch(token, identities).await?))
            }
        }
    }

    async fn lookup_batch(
        &self,
        token: &AccessToken,
        identities: Vec<String>,
    ) -> Result<Vec<LookedUpKey>> {
        if identities.is_empty() {
            return Err(KeywardError::EmptyArray("identities"));
        }

        let mut seen = HashSet::new();
        let identities: Vec<String> = identities
            .into_iter()
            .filter(|identity| seen.insert(identity.clone()))
            .collect();

        let results = join_all(
            identities
                .iter()
                .map(|identity| self.resolve(token, identity)),
        )
        .await;

        let mut resolved = Vec::with_capacity(identities.len());
        let mut rejected = Vec::new();
        for (identity, result) in identities.into_iter().zip(results) {
            match result {
                Ok(found) => resolved.push(found),
                Err(reason) => rejected.push(LookupRejection { identity, reason }),
            }
        }

        debug!(
            resolved = resolved.len(),
            rejected = rejected.len(),
            "Looked up public keys"
        );

        if rejected.is_empty() {
            Ok(resolved)
        } else {
            Err(LookupError { resolved, rejected }.into())
        }
    }

    async fn resolve(
        &self,
        token: &AccessToken,
        identity: &str,
    ) -> std::result::Result<LookedUpKey, LookupFailure> {
        let mut cards = self
            .directory
            .search(token, identity)
            .await
            .map_err(LookupFailure::Directory)?;

        let card = match cards.len() {
            0 => return Err(LookupFailure::NotFound),
            1 => cards.remove(0),
            n => return Err(LookupFailure::MultipleCards(n)),
        };

        let public_key = card
            .public_key(self.crypto.as_ref())
            .map_err(LookupFailure::InvalidKey)?;

        Ok(LookedUpKey {
            identity: card.identity,
            card_id: card.id,
            public_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Curve25519Crypto;
    use crate::directory::{Card, CardRequest, MemoryDirectory};

    struct Fixture {
        directory: Arc<MemoryDirectory>,
        crypto: Arc<dyn CryptoProvider>,
        aggregator: LookupAggregator,
    }

    fn fixture() -> Fixture {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(Curve25519Crypto::new());
        let directory = Arc::new(MemoryDirectory::new(crypto.clone()));
        let aggregator = LookupAggregator::new(directory.clone(), crypto.clone());
        Fixture {
            directory,
            crypto,
            aggregator,
        }
    }

    fn token(identity: &str) -> AccessToken {
        AccessToken::new(identity, "test", None)
    }

    async fn publish(f: &Fixture, identity: &str) -> (Card, PublicKey) {
        let keys = f.crypto.generate_key_pair().unwrap();
        let card = f
            .directory
            .publish(
                &token(identity),
                CardRequest::signed(identity, &keys, None, f.crypto.as_ref()),
            )
            .await
            .unwrap();
        (card, keys.public_key)
    }

    #[tokio::test]
    async fn test_single_identity_returns_bare_key() {
        let f = fixture();
        let (_, key) = publish(&f, "alice").await;

        let outcome = f.aggregator.lookup(&token("bob"), "alice".into()).await.unwrap();
        assert!(matches!(outcome, LookupOutcome::Single(k) if k == key));
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let f = fixture();
        let (_, alice) = publish(&f, "alice").await;
        let (card, bob) = publish(&f, "bob").await;

        let outcome = f
            .aggregator
            .lookup(&token("carol"), ["bob", "alice"].into())
            .await
            .unwrap();
        let LookupOutcome::Batch(found) = outcome else {
            panic!("expected batch outcome");
        };
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].public_key, bob);
        assert_eq!(found[0].card_id, card.id);
        assert_eq!(found[1].public_key, alice);
    }

    #[tokio::test]
    async fn test_partial_failure_reports_both_lists() {
        let f = fixture();
        let (_, alice) = publish(&f, "alice").await;

        let err = f
            .aggregator
            .lookup(&token("alice"), ["alice", "bob", "carol"].into())
            .await
            .unwrap_err();

        let KeywardError::Lookup(err) = err else {
            panic!("expected lookup error, got {err:?}");
        };
        assert_eq!(err.resolved.len(), 1);
        assert_eq!(err.resolved[0].public_key, alice);
        let rejected: Vec<&str> = err.rejected.iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(rejected, vec!["bob", "carol"]);
        assert!(err.is_not_found("bob"));
        assert!(err.is_not_found("carol"));
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let f = fixture();
        let result = f
            .aggregator
            .lookup(&token("alice"), IdentityQuery::Batch(vec![]))
            .await;
        assert!(matches!(result, Err(KeywardError::EmptyArray("identities"))));
    }

    #[tokio::test]
    async fn test_duplicates_collapsed() {
        let f = fixture();
        publish(&f, "alice").await;

        let outcome = f
            .aggregator
            .lookup(&token("alice"), ["alice", "alice"].into())
            .await
            .unwrap();
        assert_eq!(outcome.into_keys().len(), 1);
    }

    #[tokio::test]
    async fn test_directory_errors_kept_as_is() {
        struct DownDirectory;

        #[async_trait::async_trait]
        impl CardDirectory for DownDirectory {
            async fn publish(
                &self,
                _token: &AccessToken,
                _request: CardRequest,
            ) -> std::result::Result<Card, DirectoryError> {
                Err(DirectoryError::Unavailable("down".into()))
            }

            async fn search(
                &self,
                _token: &AccessToken,
                _identity: &str,
            ) -> std::result::Result<Vec<Card>, DirectoryError> {
                Err(DirectoryError::Unavailable("down".into()))
            }

            async fn get(
                &self,
                _token: &AccessToken,
                card_id: &str,
            ) -> std::result::Result<Card, DirectoryError> {
                Err(DirectoryError::CardNotFound(card_id.to_string()))
            }

            async fn revoke(
                &self,
                _token: &AccessToken,
                _card_id: &str,
            ) -> std::result::Result<(), DirectoryError> {
                Err(DirectoryError::Unavailable("down".into()))
            }
        }

        let aggregator =
            LookupAggregator::new(Arc::new(DownDirectory), Arc::new(Curve25519Crypto::new()));
        let err = aggregator
            .lookup(&token("alice"), "bob".into())
            .await
            .unwrap_err();

        let KeywardError::Lookup(err) = err else {
            panic!("expected lookup error");
        };
        assert!(matches!(
            err.rejected[0].reason,
            LookupFailure::Directory(DirectoryError::Unavailable(_))
        ));
        assert!(!err.is_not_found("bob"));
    }
}
