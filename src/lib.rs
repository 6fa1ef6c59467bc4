//! Keyward - identity key lifecycle manager
//!
//! Manages one identity's end-to-end encryption key: generation, registration
//! with a public card directory, password-protected cloud backup, rotation,
//! restoration and batch public key lookup, under a single-writer guard.
//!
//! ## Components
//!
//! - **Manager**: `IdentityManager`, the lifecycle operations and the guard
//! - **Brain key**: password-derived key pairs with throttling retry
//! - **Cloud**: encrypted key-value backup sessions
//! - **Directory**: self-signed, rotation-chained identity cards
//! - **Lookup**: concurrent multi-identity public key resolution
//! - **Local store**: the device-local secret key
//!
//! Every collaborator sits behind a trait so hosts can plug in their own
//! directory, cloud store, token issuer or derivation service.

pub mod brain_key;
pub mod cloud;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod local_store;
pub mod lookup;
pub mod manager;
pub mod token;
pub mod types;

pub(crate) mod persist;

pub use config::{Args, ManagerConfig};
pub use manager::{Collaborators, IdentityManager};
pub use types::{KeywardError, Result};
