//! Error types for Keyward
//!
//! `KeywardError` is the closed set of outcomes a caller of the identity
//! manager has to handle. Each collaborator (local store, directory, cloud
//! store, crypto, password derivation, token provider) has its own error enum
//! which is wrapped transparently, so unexpected failures keep their original
//! information.

use crate::lookup::LookupError;

/// Main error type for identity lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum KeywardError {
    #[error("Registration required: no local private key or published card for this identity")]
    RegisterRequired,

    #[error("Identity already exists: {0} already has an active card")]
    IdentityAlreadyExists(String),

    #[error("Another identity lifecycle operation is already in progress on this instance")]
    Multithread,

    #[error("Private key already exists in local storage")]
    PrivateKeyAlreadyExists,

    #[error("Private key backup does not exist")]
    PrivateKeyNoBackup,

    #[error("Wrong backup password: derived keys cannot open the cloud backup")]
    WrongPassword,

    #[error("Empty collection: {0} must contain at least one element")]
    EmptyArray(&'static str),

    #[error("Identity {identity} has {count} active cards")]
    MultipleCards { identity: String, count: usize },

    /// Another instance rotated first; the card this rotation chained to is
    /// no longer active
    #[error("Card {card_id} of {identity} was superseded concurrently")]
    CardSuperseded { identity: String, card_id: String },

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error(transparent)]
    Token(#[from] TokenError),
}

// =============================================================================
// Collaborator errors
// =============================================================================

/// Errors from the local key store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Local key store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Local key entry is corrupt: {0}")]
    Corrupt(String),
}

/// Errors from the card directory
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Directory request unauthorized: {0}")]
    Unauthorized(String),

    #[error("Card not found: {0}")]
    CardNotFound(String),

    #[error("Card conflict: {0}")]
    Conflict(String),

    #[error("Card self-signature is invalid for {0}")]
    InvalidSignature(String),

    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the cloud key-value store
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("Cloud request unauthorized: {0}")]
    Unauthorized(String),

    #[error("Cloud entry does not exist: {0}")]
    EntryNotFound(String),

    /// The session keys cannot decrypt the stored envelope
    #[error("Cloud envelope cannot be decrypted with the session keys")]
    DecryptionFailed,

    #[error("Cloud value is malformed: {0}")]
    Serialization(String),

    #[error("Cloud store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the crypto provider
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Data is not encrypted for this key")]
    NotARecipient,

    #[error("Signature is missing")]
    SignatureMissing,

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Malformed encrypted data: {0}")]
    Serialization(String),
}

/// Errors from the password derivation service
#[derive(Debug, thiserror::Error)]
pub enum DerivationError {
    /// Service-side failure; `code` distinguishes throttling from other failures
    #[error("Password derivation failed ({code}): {message}")]
    Service { code: u32, message: String },

    #[error("Invalid derivation parameters: {0}")]
    InvalidParams(String),

    #[error("Derivation task failed: {0}")]
    Task(String),
}

/// Errors from the caller-supplied token provider
#[derive(Debug, thiserror::Error)]
#[error("Token provider error: {0}")]
pub struct TokenError(pub String);

impl From<rmp_serde::encode::Error> for CryptoError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CryptoError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for Keyward operations
pub type Result<T> = std::result::Result<T, KeywardError>;
