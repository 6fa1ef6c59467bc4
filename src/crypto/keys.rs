//! Identity key types.
//!
//! A private key is a 32-byte seed. Both halves of the identity key are
//! derived from it:
//!
//! - **Signing**: the Ed25519 signing key is the seed itself
//! - **Agreement**: the X25519 secret is `SHA-256(EXCHANGE_DOMAIN || seed)`
//!
//! Public keys export as 64 bytes: Ed25519 verifying key followed by the
//! X25519 public key.

use std::fmt;

use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as ExchangePublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::types::CryptoError;

/// Private key (seed) length
pub const SEED_LEN: usize = 32;

/// Exported public key length (Ed25519 || X25519)
pub const PUBLIC_KEY_LEN: usize = 64;

/// Length of the short key identifier used in envelopes and logs
pub const KEY_ID_LEN: usize = 8;

const EXCHANGE_DOMAIN: &[u8] = b"keyward/x25519/v1";

// =============================================================================
// Private Key
// =============================================================================

/// Identity private key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    seed: [u8; SEED_LEN],
}

impl PrivateKey {
    pub fn from_seed(seed: [u8; SEED_LEN]) -> Self {
        Self { seed }
    }

    /// Import an exported private key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let seed: [u8; SEED_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "private key must be {} bytes, got {}",
                SEED_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self { seed })
    }

    /// Export the private key. The returned buffer is zeroized on drop.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.seed.to_vec())
    }

    pub fn public_key(&self) -> PublicKey {
        let verifying = self.signing_key().verifying_key();
        let exchange = ExchangePublicKey::from(&self.exchange_secret());
        PublicKey {
            signing: verifying.to_bytes(),
            exchange: exchange.to_bytes(),
        }
    }

    pub(crate) fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.seed)
    }

    pub(crate) fn exchange_secret(&self) -> StaticSecret {
        let mut hasher = Sha256::new();
        hasher.update(EXCHANGE_DOMAIN);
        hasher.update(self.seed);
        let mut scalar: [u8; 32] = hasher.finalize().into();
        let secret = StaticSecret::from(scalar);
        scalar.zeroize();
        secret
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

// =============================================================================
// Public Key
// =============================================================================

/// Identity public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    signing: [u8; 32],
    exchange: [u8; 32],
}

impl PublicKey {
    /// Import an exported public key, rejecting invalid Ed25519 points.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "public key must be {} bytes, got {}",
                PUBLIC_KEY_LEN,
                bytes.len()
            )));
        }

        let mut signing = [0u8; 32];
        let mut exchange = [0u8; 32];
        signing.copy_from_slice(&bytes[..32]);
        exchange.copy_from_slice(&bytes[32..]);

        VerifyingKey::from_bytes(&signing)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid signing key: {e}")))?;

        Ok(Self { signing, exchange })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PUBLIC_KEY_LEN);
        out.extend_from_slice(&self.signing);
        out.extend_from_slice(&self.exchange);
        out
    }

    /// Short identifier: first 8 bytes of SHA-256 over the exported key.
    pub fn key_id(&self) -> [u8; KEY_ID_LEN] {
        let digest = Sha256::digest(self.to_bytes());
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&digest[..KEY_ID_LEN]);
        id
    }

    pub fn key_id_hex(&self) -> String {
        hex::encode(self.key_id())
    }

    pub(crate) fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.signing)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid signing key: {e}")))
    }

    pub(crate) fn exchange_key(&self) -> ExchangePublicKey {
        ExchangePublicKey::from(self.exchange)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.key_id_hex())
    }
}

// =============================================================================
// Key Pair
// =============================================================================

#[derive(Clone, Debug)]
pub struct KeyPair {
    pub private_key: PrivateKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    pub fn from_private_key(private_key: PrivateKey) -> Self {
        let public_key = private_key.public_key();
        Self {
            private_key,
            public_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_roundtrip() {
        let private_key = PrivateKey::from_seed([7u8; SEED_LEN]);
        let public_key = private_key.public_key();

        let bytes = public_key.to_bytes();
        assert_eq!(bytes.len(), PUBLIC_KEY_LEN);
        assert_eq!(PublicKey::from_bytes(&bytes).unwrap(), public_key);
    }

    #[test]
    fn test_same_seed_same_keys() {
        let a = PrivateKey::from_seed([1u8; SEED_LEN]).public_key();
        let b = PrivateKey::from_seed([1u8; SEED_LEN]).public_key();
        let c = PrivateKey::from_seed([2u8; SEED_LEN]).public_key();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_rejects_wrong_lengths() {
        assert!(PrivateKey::from_bytes(&[0u8; 31]).is_err());
        assert!(PublicKey::from_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_debug_does_not_leak_seed() {
        let private_key = PrivateKey::from_seed([9u8; SEED_LEN]);
        assert_eq!(format!("{:?}", private_key), "PrivateKey(..)");
    }
}
