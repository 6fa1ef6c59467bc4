//! Public key lookup through the identity manager

use std::sync::Arc;
use std::time::Duration;

use keyward::brain_key::Argon2Derivation;
use keyward::cloud::MemoryCloudStore;
use keyward::config::{Argon2Params, ManagerConfig};
use keyward::crypto::{CryptoProvider, Curve25519Crypto};
use keyward::directory::MemoryDirectory;
use keyward::local_store::MemoryKeyStore;
use keyward::lookup::{IdentityQuery, LookupFailure, LookupOutcome};
use keyward::token::LocalTokenProvider;
use keyward::{Collaborators, IdentityManager, KeywardError};

fn managers(identities: &[&str]) -> Vec<IdentityManager> {
    let crypto: Arc<dyn CryptoProvider> = Arc::new(Curve25519Crypto::new());
    let directory = Arc::new(MemoryDirectory::new(crypto.clone()));
    let cloud = Arc::new(MemoryCloudStore::new(crypto.clone()));

    identities
        .iter()
        .map(|identity| {
            let collaborators = Collaborators {
                tokens: Arc::new(LocalTokenProvider::new(*identity, Duration::from_secs(60))),
                crypto: crypto.clone(),
                local_store: Arc::new(MemoryKeyStore::new()),
                directory: directory.clone(),
                cloud: cloud.clone(),
                derivation: Arc::new(
                    Argon2Derivation::new(Argon2Params {
                        memory_kib: 64,
                        iterations: 1,
                        parallelism: 1,
                    })
                    .unwrap(),
                ),
            };
            IdentityManager::new(*identity, ManagerConfig::default(), collaborators)
        })
        .collect()
}

#[tokio::test]
async fn test_batch_with_unregistered_identities() {
    let all = managers(&["a", "b", "c"]);
    all[0].register().await.unwrap();
    let key_a = all[0].lookup_public_key("a").await.unwrap();

    let err = all[0]
        .lookup_public_keys(["a", "b", "c"])
        .await
        .unwrap_err();
    let KeywardError::Lookup(err) = err else {
        panic!("expected lookup error, got {err:?}");
    };

    let resolved: Vec<_> = err.resolved.iter().map(|k| k.public_key).collect();
    assert_eq!(resolved, vec![key_a]);

    let rejected: Vec<(&str, bool)> = err
        .rejected
        .iter()
        .map(|r| (r.identity.as_str(), matches!(r.reason, LookupFailure::NotFound)))
        .collect();
    assert_eq!(rejected, vec![("b", true), ("c", true)]);
}

#[tokio::test]
async fn test_single_identity_is_bare_key() {
    let all = managers(&["a", "b"]);
    all[0].register().await.unwrap();
    all[1].register().await.unwrap();

    let single = all[1].lookup_public_keys("a").await.unwrap();
    assert!(matches!(single, LookupOutcome::Single(_)));

    let batch = all[1].lookup_public_keys(["b", "a"]).await.unwrap();
    let LookupOutcome::Batch(found) = batch else {
        panic!("expected batch outcome");
    };
    let order: Vec<&str> = found.iter().map(|k| k.identity.as_str()).collect();
    assert_eq!(order, vec!["b", "a"]);
}

#[tokio::test]
async fn test_empty_lookup_rejected() {
    let all = managers(&["a"]);
    let result = all[0].lookup_public_keys(IdentityQuery::Batch(Vec::new())).await;
    assert!(matches!(result, Err(KeywardError::EmptyArray("identities"))));
}

#[tokio::test]
async fn test_lookup_follows_rotation() {
    let all = managers(&["a", "b"]);
    all[0].register().await.unwrap();
    let before = all[1].lookup_public_key("a").await.unwrap();

    all[0].rotate_private_key().await.unwrap();
    let after = all[1].lookup_public_key("a").await.unwrap();
    assert_ne!(before, after);
}
