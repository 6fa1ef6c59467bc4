//! Configuration for Keyward
//!
//! Library-side settings (`ManagerConfig`, `Argon2Params`) plus the CLI
//! arguments and environment variable handling using clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::brain_key::{DEFAULT_RETRY_DELAY, THROTTLING_ERROR_CODE};

/// Application name used in the brain key derivation context
pub const DEFAULT_APPLICATION: &str = "keyward";

// =============================================================================
// Library configuration
// =============================================================================

/// Identity manager settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Scopes password derivation; changing it orphans existing backups
    pub application: String,
    /// Delay before the single retry of a throttled derivation
    pub brain_key_retry_delay: Duration,
    /// Derivation service error code that signals throttling
    pub throttling_code: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            application: DEFAULT_APPLICATION.to_string(),
            brain_key_retry_delay: DEFAULT_RETRY_DELAY,
            throttling_code: THROTTLING_ERROR_CODE,
        }
    }
}

/// Argon2id cost parameters for local password derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    /// Memory cost in KiB
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for Argon2Params {
    fn default() -> Self {
        // 64 MiB, 3 passes, 4 lanes
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

impl Argon2Params {
    pub fn validate(&self) -> Result<(), String> {
        if self.iterations == 0 {
            return Err("Argon2 iterations must be at least 1".to_string());
        }
        if self.parallelism == 0 {
            return Err("Argon2 parallelism must be at least 1".to_string());
        }
        if self.memory_kib < 8 * self.parallelism {
            return Err(format!(
                "Argon2 memory must be at least {} KiB for {} lanes",
                8 * self.parallelism,
                self.parallelism
            ));
        }
        Ok(())
    }
}

// =============================================================================
// CLI
// =============================================================================

/// Keyward - identity key lifecycle manager
///
/// Registers, rotates, backs up and restores an end-to-end encryption identity
/// key against a local sandbox directory and cloud store.
#[derive(Parser, Debug, Clone)]
#[command(name = "keyward")]
#[command(about = "Identity key lifecycle manager")]
pub struct Args {
    /// Directory holding the local key store and sandbox collaborators
    #[arg(long, env = "KEYWARD_DATA_DIR", default_value = ".keyward")]
    pub data_dir: PathBuf,

    /// Identity this invocation acts as
    #[arg(long, env = "KEYWARD_IDENTITY")]
    pub identity: String,

    /// Application name scoping password derivation
    #[arg(long, env = "KEYWARD_APPLICATION", default_value = DEFAULT_APPLICATION)]
    pub application: String,

    /// Access token lifetime in seconds
    #[arg(long, env = "TOKEN_TTL_SECONDS", default_value = "300")]
    pub token_ttl_seconds: u64,

    /// Delay before retrying a throttled derivation, in milliseconds
    #[arg(long, env = "BRAIN_KEY_RETRY_DELAY_MS", default_value = "2000")]
    pub brain_key_retry_delay_ms: u64,

    /// Argon2 configuration
    #[command(flatten)]
    pub argon2: Argon2Args,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Argon2 cost configuration
#[derive(Parser, Debug, Clone)]
pub struct Argon2Args {
    /// Argon2 memory cost in KiB
    #[arg(long, env = "ARGON2_MEMORY_KIB", default_value = "65536")]
    pub argon2_memory_kib: u32,

    /// Argon2 passes
    #[arg(long, env = "ARGON2_ITERATIONS", default_value = "3")]
    pub argon2_iterations: u32,

    /// Argon2 lanes
    #[arg(long, env = "ARGON2_PARALLELISM", default_value = "4")]
    pub argon2_parallelism: u32,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show local key and card state
    Status,
    /// Generate (or reuse) a key and publish the first card
    Register,
    /// Publish a new key superseding the active card
    Rotate,
    /// Revoke all active cards and remove the local key
    Unregister,
    /// Store the local key in the cloud under a password
    Backup {
        #[arg(long, env = "KEYWARD_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Restore the local key from the cloud backup
    Restore {
        #[arg(long, env = "KEYWARD_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Delete the cloud backup
    ResetBackup {
        #[arg(long, env = "KEYWARD_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Re-encrypt the cloud backup under a new password
    ChangePassword {
        #[arg(long, env = "KEYWARD_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, env = "KEYWARD_NEW_PASSWORD", hide_env_values = true)]
        new_password: String,
    },
    /// Remove the local key and any cloud backup
    Cleanup,
    /// Print public key ids for one or more identities
    Lookup {
        #[arg(required = true)]
        identities: Vec<String>,
    },
    /// Encrypt text, printing base64
    Encrypt {
        text: String,
        /// Additional recipients; the caller is always included
        #[arg(long = "recipient")]
        recipients: Vec<String>,
    },
    /// Decrypt base64 produced by `encrypt`
    Decrypt {
        ciphertext: String,
        /// Verify the signature against this identity instead of our own
        #[arg(long)]
        sender: Option<String>,
    },
}

impl Args {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            application: self.application.clone(),
            brain_key_retry_delay: Duration::from_millis(self.brain_key_retry_delay_ms),
            throttling_code: THROTTLING_ERROR_CODE,
        }
    }

    pub fn argon2_params(&self) -> Argon2Params {
        Argon2Params {
            memory_kib: self.argon2.argon2_memory_kib,
            iterations: self.argon2.argon2_iterations,
            parallelism: self.argon2.argon2_parallelism,
        }
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_seconds)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.identity.trim().is_empty() {
            return Err("KEYWARD_IDENTITY must not be empty".to_string());
        }

        if self.application.trim().is_empty() {
            return Err("KEYWARD_APPLICATION must not be empty".to_string());
        }

        if self.token_ttl_seconds == 0 {
            return Err("TOKEN_TTL_SECONDS must be greater than zero".to_string());
        }

        self.argon2_params().validate()?;

        if let Command::ChangePassword {
            password,
            new_password,
        } = &self.command
        {
            if password == new_password {
                return Err("New password must differ from the current password".to_string());
            }
        }

        Ok(())
    }
}
