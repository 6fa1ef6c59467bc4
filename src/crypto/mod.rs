//! Identity key cryptography
//!
//! Key types plus the `CryptoProvider` seam the manager and the in-memory
//! collaborators encrypt, sign and verify through.

pub mod keys;
pub mod provider;

pub use keys::{KeyPair, PrivateKey, PublicKey, KEY_ID_LEN, PUBLIC_KEY_LEN, SEED_LEN};
pub use provider::{generate_random_bytes, CryptoProvider, Curve25519Crypto, NONCE_LEN};
