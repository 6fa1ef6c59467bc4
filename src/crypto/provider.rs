//! Crypto provider used by the identity manager and the in-memory
//! collaborators.
//!
//! # Algorithms
//!
//! - **Signing**: Ed25519 over the plaintext (sign-then-encrypt)
//! - **Key wrapping**: ephemeral X25519 agreement + HKDF-SHA256 per recipient
//! - **Encryption**: ChaCha20-Poly1305 with a random content key
//!
//! Envelopes are MessagePack encoded.

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use ed25519_dalek::{Signature, Signer, Verifier};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as ExchangePublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::keys::{KeyPair, PrivateKey, PublicKey, SEED_LEN};
use crate::types::CryptoError;

// =============================================================================
// Constants
// =============================================================================

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Content key length (32 bytes)
pub const CONTENT_KEY_LEN: usize = 32;

/// Ed25519 signature length (64 bytes)
pub const SIGNATURE_LEN: usize = 64;

const ENVELOPE_VERSION: u8 = 1;
const WRAP_INFO: &[u8] = b"keyward/envelope/wrap/v1";

// =============================================================================
// Provider Trait
// =============================================================================

/// Cryptographic operations the lifecycle manager delegates.
///
/// Implementations are swapped in tests to inject failures.
pub trait CryptoProvider: Send + Sync {
    fn generate_key_pair(&self) -> Result<KeyPair, CryptoError>;

    /// Deterministically build a key pair from derived seed material.
    fn key_pair_from_seed(&self, seed: &[u8]) -> Result<KeyPair, CryptoError>;

    fn export_private_key(&self, key: &PrivateKey) -> Zeroizing<Vec<u8>>;

    fn import_private_key(&self, bytes: &[u8]) -> Result<KeyPair, CryptoError>;

    fn export_public_key(&self, key: &PublicKey) -> Vec<u8>;

    fn import_public_key(&self, bytes: &[u8]) -> Result<PublicKey, CryptoError>;

    /// Encrypt `data` for every recipient, signing the plaintext when a
    /// signer is given.
    fn encrypt(
        &self,
        data: &[u8],
        recipients: &[PublicKey],
        signer: Option<&PrivateKey>,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt `data`. When `sender` is given the signature must be present
    /// and valid for that key.
    fn decrypt(
        &self,
        data: &[u8],
        recipient: &PrivateKey,
        sender: Option<&PublicKey>,
    ) -> Result<Vec<u8>, CryptoError>;

    fn sign(&self, data: &[u8], key: &PrivateKey) -> Vec<u8>;

    fn verify(&self, data: &[u8], signature: &[u8], key: &PublicKey) -> Result<(), CryptoError>;
}

// =============================================================================
// Envelope Format
// =============================================================================

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u8,
    recipients: Vec<RecipientSlot>,
    nonce: Vec<u8>,
    body: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct RecipientSlot {
    key_id: Vec<u8>,
    ephemeral_public: Vec<u8>,
    nonce: Vec<u8>,
    wrapped_key: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SignedBody {
    plaintext: Vec<u8>,
    signature: Option<Vec<u8>>,
}

// =============================================================================
// Helpers
// =============================================================================

/// Generate cryptographically secure random bytes.
pub fn generate_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn wrapping_key(
    shared_secret: &[u8],
    ephemeral_public: &[u8],
    recipient_exchange: &[u8],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(ephemeral_public);
    salt.extend_from_slice(recipient_exchange);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(WRAP_INFO, &mut okm[..])
        .map_err(|e| CryptoError::Encryption(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

fn seal(key: &[u8; 32], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))
}

fn open(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::Serialization(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LEN,
            nonce.len()
        )));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption("authentication tag mismatch".into()))
}

// =============================================================================
// Curve25519 Provider
// =============================================================================

/// Default provider: Ed25519 signatures, X25519 key wrapping,
/// ChaCha20-Poly1305 payload encryption.
#[derive(Debug, Default, Clone)]
pub struct Curve25519Crypto;

impl Curve25519Crypto {
    pub fn new() -> Self {
        Self
    }

    fn wrap_for(
        &self,
        recipient: &PublicKey,
        content_key: &[u8; CONTENT_KEY_LEN],
    ) -> Result<RecipientSlot, CryptoError> {
        let ephemeral = StaticSecret::from(generate_random_bytes::<32>());
        let ephemeral_public = ExchangePublicKey::from(&ephemeral);
        let recipient_exchange = recipient.exchange_key();
        let shared = ephemeral.diffie_hellman(&recipient_exchange);

        let kek = wrapping_key(
            shared.as_bytes(),
            ephemeral_public.as_bytes(),
            recipient_exchange.as_bytes(),
        )?;
        let nonce: [u8; NONCE_LEN] = generate_random_bytes();
        let wrapped_key = seal(&kek, &nonce, content_key)?;

        Ok(RecipientSlot {
            key_id: recipient.key_id().to_vec(),
            ephemeral_public: ephemeral_public.as_bytes().to_vec(),
            nonce: nonce.to_vec(),
            wrapped_key,
        })
    }

    fn unwrap_slot(
        &self,
        slot: &RecipientSlot,
        recipient: &PrivateKey,
    ) -> Result<Zeroizing<[u8; CONTENT_KEY_LEN]>, CryptoError> {
        let ephemeral: [u8; 32] = slot
            .ephemeral_public
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Serialization("invalid ephemeral key length".into()))?;

        let own_secret = recipient.exchange_secret();
        let own_public = ExchangePublicKey::from(&own_secret);
        let shared = own_secret.diffie_hellman(&ExchangePublicKey::from(ephemeral));

        let kek = wrapping_key(shared.as_bytes(), &ephemeral, own_public.as_bytes())?;
        let content_key = Zeroizing::new(open(&kek, &slot.nonce, &slot.wrapped_key)?);

        let mut key = Zeroizing::new([0u8; CONTENT_KEY_LEN]);
        if content_key.len() != CONTENT_KEY_LEN {
            return Err(CryptoError::Decryption("invalid content key length".into()));
        }
        key.copy_from_slice(&content_key);
        Ok(key)
    }
}

impl CryptoProvider for Curve25519Crypto {
    fn generate_key_pair(&self) -> Result<KeyPair, CryptoError> {
        let seed: [u8; SEED_LEN] = generate_random_bytes();
        Ok(KeyPair::from_private_key(PrivateKey::from_seed(seed)))
    }

    fn key_pair_from_seed(&self, seed: &[u8]) -> Result<KeyPair, CryptoError> {
        Ok(KeyPair::from_private_key(PrivateKey::from_bytes(seed)?))
    }

    fn export_private_key(&self, key: &PrivateKey) -> Zeroizing<Vec<u8>> {
        key.to_bytes()
    }

    fn import_private_key(&self, bytes: &[u8]) -> Result<KeyPair, CryptoError> {
        Ok(KeyPair::from_private_key(PrivateKey::from_bytes(bytes)?))
    }

    fn export_public_key(&self, key: &PublicKey) -> Vec<u8> {
        key.to_bytes()
    }

    fn import_public_key(&self, bytes: &[u8]) -> Result<PublicKey, CryptoError> {
        PublicKey::from_bytes(bytes)
    }

    fn encrypt(
        &self,
        data: &[u8],
        recipients: &[PublicKey],
        signer: Option<&PrivateKey>,
    ) -> Result<Vec<u8>, CryptoError> {
        if recipients.is_empty() {
            return Err(CryptoError::Encryption("no recipients".into()));
        }

        let body = SignedBody {
            plaintext: data.to_vec(),
            signature: signer.map(|key| self.sign(data, key)),
        };
        let body_bytes = Zeroizing::new(rmp_serde::to_vec(&body)?);

        let content_key = Zeroizing::new(generate_random_bytes::<CONTENT_KEY_LEN>());
        let nonce: [u8; NONCE_LEN] = generate_random_bytes();
        let sealed_body = seal(&content_key, &nonce, &body_bytes)?;

        let recipients = recipients
            .iter()
            .map(|recipient| self.wrap_for(recipient, &content_key))
            .collect::<Result<Vec<_>, _>>()?;

        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            recipients,
            nonce: nonce.to_vec(),
            body: sealed_body,
        };
        Ok(rmp_serde::to_vec(&envelope)?)
    }

    fn decrypt(
        &self,
        data: &[u8],
        recipient: &PrivateKey,
        sender: Option<&PublicKey>,
    ) -> Result<Vec<u8>, CryptoError> {
        let envelope: Envelope = rmp_serde::from_slice(data)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(CryptoError::Serialization(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }

        let key_id = recipient.public_key().key_id();
        let mut content_key = None;
        let mut last_error = CryptoError::NotARecipient;
        for slot in envelope.recipients.iter().filter(|s| s.key_id == key_id) {
            match self.unwrap_slot(slot, recipient) {
                Ok(key) => {
                    content_key = Some(key);
                    break;
                }
                Err(e) => last_error = e,
            }
        }
        let content_key = content_key.ok_or(last_error)?;

        let body_bytes = Zeroizing::new(open(&content_key, &envelope.nonce, &envelope.body)?);
        let body: SignedBody = rmp_serde::from_slice(&body_bytes)?;

        if let Some(sender) = sender {
            let signature = body.signature.as_ref().ok_or(CryptoError::SignatureMissing)?;
            self.verify(&body.plaintext, signature, sender)?;
        }

        Ok(body.plaintext)
    }

    fn sign(&self, data: &[u8], key: &PrivateKey) -> Vec<u8> {
        key.signing_key().sign(data).to_bytes().to_vec()
    }

    fn verify(&self, data: &[u8], signature: &[u8], key: &PublicKey) -> Result<(), CryptoError> {
        let signature: [u8; SIGNATURE_LEN] = signature
            .try_into()
            .map_err(|_| CryptoError::SignatureInvalid)?;
        key.verifying_key()?
            .verify(data, &Signature::from_bytes(&signature))
            .map_err(|_| CryptoError::SignatureInvalid)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let crypto = Curve25519Crypto::new();
        let a = crypto.generate_key_pair().unwrap();
        let b = crypto.generate_key_pair().unwrap();

        // Should generate different keys
        assert_ne!(a.public_key, b.public_key);
        assert_eq!(a.private_key.public_key(), a.public_key);
    }

    #[test]
    fn test_encrypt_decrypt_signed() {
        let crypto = Curve25519Crypto::new();
        let alice = crypto.generate_key_pair().unwrap();
        let bob = crypto.generate_key_pair().unwrap();

        let ciphertext = crypto
            .encrypt(b"hello bob", &[bob.public_key], Some(&alice.private_key))
            .unwrap();

        let plaintext = crypto
            .decrypt(&ciphertext, &bob.private_key, Some(&alice.public_key))
            .unwrap();
        assert_eq!(plaintext, b"hello bob");
    }

    #[test]
    fn test_multiple_recipients() {
        let crypto = Curve25519Crypto::new();
        let alice = crypto.generate_key_pair().unwrap();
        let bob = crypto.generate_key_pair().unwrap();
        let carol = crypto.generate_key_pair().unwrap();

        let ciphertext = crypto
            .encrypt(b"group", &[bob.public_key, carol.public_key], Some(&alice.private_key))
            .unwrap();

        for reader in [&bob, &carol] {
            let plaintext = crypto
                .decrypt(&ciphertext, &reader.private_key, Some(&alice.public_key))
                .unwrap();
            assert_eq!(plaintext, b"group");
        }
    }

    #[test]
    fn test_non_recipient_cannot_decrypt() {
        let crypto = Curve25519Crypto::new();
        let bob = crypto.generate_key_pair().unwrap();
        let eve = crypto.generate_key_pair().unwrap();

        let ciphertext = crypto.encrypt(b"secret", &[bob.public_key], None).unwrap();
        let result = crypto.decrypt(&ciphertext, &eve.private_key, None);

        assert!(matches!(result, Err(CryptoError::NotARecipient)));
    }

    #[test]
    fn test_signature_required_when_sender_given() {
        let crypto = Curve25519Crypto::new();
        let alice = crypto.generate_key_pair().unwrap();
        let bob = crypto.generate_key_pair().unwrap();

        let unsigned = crypto.encrypt(b"anon", &[bob.public_key], None).unwrap();
        let result = crypto.decrypt(&unsigned, &bob.private_key, Some(&alice.public_key));
        assert!(matches!(result, Err(CryptoError::SignatureMissing)));

        // Signed by someone else
        let mallory = crypto.generate_key_pair().unwrap();
        let forged = crypto
            .encrypt(b"trust me", &[bob.public_key], Some(&mallory.private_key))
            .unwrap();
        let result = crypto.decrypt(&forged, &bob.private_key, Some(&alice.public_key));
        assert!(matches!(result, Err(CryptoError::SignatureInvalid)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let crypto = Curve25519Crypto::new();
        let bob = crypto.generate_key_pair().unwrap();

        let mut ciphertext = crypto.encrypt(b"payload", &[bob.public_key], None).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;

        assert!(crypto.decrypt(&ciphertext, &bob.private_key, None).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let crypto = Curve25519Crypto::new();
        let keys = crypto.generate_key_pair().unwrap();

        let signature = crypto.sign(b"card snapshot", &keys.private_key);
        assert_eq!(signature.len(), SIGNATURE_LEN);
        assert!(crypto.verify(b"card snapshot", &signature, &keys.public_key).is_ok());
        assert!(crypto.verify(b"other snapshot", &signature, &keys.public_key).is_err());
    }

    #[test]
    fn test_seed_is_deterministic() {
        let crypto = Curve25519Crypto::new();
        let seed = [42u8; SEED_LEN];
        let a = crypto.key_pair_from_seed(&seed).unwrap();
        let b = crypto.key_pair_from_seed(&seed).unwrap();
        assert_eq!(a.public_key, b.public_key);
        assert_eq!(
            crypto.export_private_key(&a.private_key).as_slice(),
            crypto.export_private_key(&b.private_key).as_slice()
        );
    }
}
