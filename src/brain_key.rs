//! Password-derived key pairs ("brain keys").
//!
//! A brain key is a deterministic function of `(application, identity,
//! password)`, used to wrap the cloud backup without ever storing the
//! password. Derivation runs through a [`PasswordDerivation`] service; when
//! that service signals throttling the call is retried exactly once after a
//! fixed delay.
//!
//! # Local derivation
//!
//! [`Argon2Derivation`] derives the seed with Argon2id, salted with
//! `SHA-256(SALT_DOMAIN || application || 0x00 || identity)`, on a blocking
//! thread.

use std::sync::Arc;
use std::time::Duration;

use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::cloud::{CloudSession, CloudStore};
use crate::config::Argon2Params;
use crate::crypto::{CryptoProvider, KeyPair, SEED_LEN};
use crate::token::AccessToken;
use crate::types::{CloudError, DerivationError, KeywardError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Error code the derivation service returns when it is rate limiting
pub const THROTTLING_ERROR_CODE: u32 = 60007;

/// Delay before the single retry of a throttled derivation
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

const SALT_DOMAIN: &[u8] = b"keyward/brain-key/v1";

// =============================================================================
// Derivation Service
// =============================================================================

/// Identity-scoped input to the derivation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationContext {
    pub application: String,
    pub identity: String,
}

impl DerivationContext {
    pub fn new(application: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            identity: identity.into(),
        }
    }

    pub fn salt(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(SALT_DOMAIN);
        hasher.update(self.application.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.identity.as_bytes());
        hasher.finalize().into()
    }
}

/// Deterministic password → seed derivation.
#[async_trait::async_trait]
pub trait PasswordDerivation: Send + Sync {
    /// Same context and password must always yield the same seed.
    async fn derive_seed(
        &self,
        context: &DerivationContext,
        password: &str,
    ) -> std::result::Result<Zeroizing<Vec<u8>>, DerivationError>;
}

/// Local Argon2id derivation
#[derive(Debug, Clone)]
pub struct Argon2Derivation {
    params: Argon2Params,
}

impl Argon2Derivation {
    pub fn new(params: Argon2Params) -> std::result::Result<Self, DerivationError> {
        params.validate().map_err(DerivationError::InvalidParams)?;
        Ok(Self { params })
    }
}

#[async_trait::async_trait]
impl PasswordDerivation for Argon2Derivation {
    async fn derive_seed(
        &self,
        context: &DerivationContext,
        password: &str,
    ) -> std::result::Result<Zeroizing<Vec<u8>>, DerivationError> {
        let params = Params::new(
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
            Some(SEED_LEN),
        )
        .map_err(|e| DerivationError::InvalidParams(format!("Invalid Argon2 params: {e}")))?;

        let salt = context.salt();
        let password = Zeroizing::new(password.as_bytes().to_vec());

        tokio::task::spawn_blocking(move || {
            let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
            let mut seed = Zeroizing::new(vec![0u8; SEED_LEN]);
            argon2
                .hash_password_into(&password, &salt, &mut seed)
                .map_err(|e| DerivationError::Service {
                    code: 0,
                    message: format!("Key derivation failed: {e}"),
                })?;
            Ok(seed)
        })
        .await
        .map_err(|e| DerivationError::Task(e.to_string()))?
    }
}

// =============================================================================
// Brain Key Provider
// =============================================================================

/// Derives brain keys and opens cloud sessions with them.
pub struct BrainKey {
    derivation: Arc<dyn PasswordDerivation>,
    crypto: Arc<dyn CryptoProvider>,
    context: DerivationContext,
    retry_delay: Duration,
    throttling_code: u32,
}

impl BrainKey {
    pub fn new(
        derivation: Arc<dyn PasswordDerivation>,
        crypto: Arc<dyn CryptoProvider>,
        context: DerivationContext,
    ) -> Self {
        Self {
            derivation,
            crypto,
            context,
            retry_delay: DEFAULT_RETRY_DELAY,
            throttling_code: THROTTLING_ERROR_CODE,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_throttling_code(mut self, code: u32) -> Self {
        self.throttling_code = code;
        self
    }

    pub fn context(&self) -> &DerivationContext {
        &self.context
    }

    /// Derive the key pair for `password`.
    ///
    /// A throttled derivation is retried once after the fixed delay; a second
    /// throttle, or any other error, is returned to the caller.
    pub async fn derive(&self, password: &str) -> Result<KeyPair> {
        let mut retried = false;
        loop {
            match self.derivation.derive_seed(&self.context, password).await {
                Ok(seed) => {
                    let keys = self.crypto.key_pair_from_seed(&seed)?;
                    debug!(
                        identity = %self.context.identity,
                        key_id = %keys.public_key.key_id_hex(),
                        "Derived brain key"
                    );
                    return Ok(keys);
                }
                Err(DerivationError::Service { code, .. })
                    if code == self.throttling_code && !retried =>
                {
                    warn!(
                        identity = %self.context.identity,
                        delay_ms = self.retry_delay.as_millis() as u64,
                        "Brain key derivation throttled, retrying once"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    retried = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Derive keys for `password` and open a cloud session with them.
    ///
    /// A session whose keys cannot decrypt the existing backup maps to
    /// [`KeywardError::WrongPassword`].
    pub async fn open_session(
        &self,
        cloud: &dyn CloudStore,
        token: &AccessToken,
        password: &str,
    ) -> Result<Box<dyn CloudSession>> {
        let keys = self.derive(password).await?;
        open_with_keys(cloud, token, &keys).await
    }
}

/// Open a cloud session, remapping a decryption mismatch to a wrong password.
async fn open_with_keys(
    cloud: &dyn CloudStore,
    token: &AccessToken,
    keys: &KeyPair,
) -> Result<Box<dyn CloudSession>> {
    cloud.open_session(token, keys).await.map_err(|e| match e {
        CloudError::DecryptionFailed => KeywardError::WrongPassword,
        other => other.into(),
    })
}
