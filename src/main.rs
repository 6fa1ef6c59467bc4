//! Keyward - identity key lifecycle manager
//!
//! Drives one `IdentityManager` against a local data directory: the secret key
//! lives in a file key store, the card directory and cloud store are
//! JSON-persisted sandboxes next to it.

use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keyward::{
    brain_key::Argon2Derivation,
    cloud::MemoryCloudStore,
    config::{Args, Command},
    crypto::{CryptoProvider, Curve25519Crypto, PublicKey},
    directory::MemoryDirectory,
    local_store::FileKeyStore,
    lookup::{IdentityQuery, LookupOutcome},
    token::LocalTokenProvider,
    Collaborators, IdentityManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Logs go to stderr so command output stays clean on stdout
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("keyward={},warn", args.log_level).into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let manager = build_manager(&args).await?;
    run(&manager, args.command).await
}

async fn build_manager(args: &Args) -> anyhow::Result<IdentityManager> {
    let crypto: Arc<dyn CryptoProvider> = Arc::new(Curve25519Crypto::new());
    let data_dir = &args.data_dir;

    debug!(data_dir = %data_dir.display(), identity = %args.identity, "Opening sandbox");

    let collaborators = Collaborators {
        tokens: Arc::new(LocalTokenProvider::new(args.identity.clone(), args.token_ttl())),
        crypto: crypto.clone(),
        local_store: Arc::new(FileKeyStore::new(data_dir.join("keys"))),
        directory: Arc::new(MemoryDirectory::open(data_dir.join("directory.json"), crypto.clone()).await?),
        cloud: Arc::new(MemoryCloudStore::open(data_dir.join("cloud.json"), crypto).await?),
        derivation: Arc::new(Argon2Derivation::new(args.argon2_params())?),
    };

    Ok(IdentityManager::new(
        args.identity.clone(),
        args.manager_config(),
        collaborators,
    ))
}

async fn run(manager: &IdentityManager, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Status => {
            let has_local = manager.has_local_private_key().await?;
            let cards = manager.active_cards().await?;
            println!("identity:  {}", manager.identity());
            println!("local key: {}", if has_local { "present" } else { "absent" });
            if cards.is_empty() {
                println!("card:      none");
            }
            for card in cards {
                println!("card:      {} (previous: {})", card.id, card.previous_card_id.as_deref().unwrap_or("-"));
            }
        }
        Command::Register => {
            let card = manager.register().await?;
            println!("registered {} with card {}", manager.identity(), card.id);
        }
        Command::Rotate => {
            let card = manager.rotate_private_key().await?;
            println!(
                "rotated {} to card {} (previous: {})",
                manager.identity(),
                card.id,
                card.previous_card_id.as_deref().unwrap_or("-")
            );
        }
        Command::Unregister => {
            let revoked = manager.unregister().await?;
            println!("revoked {revoked} card(s) for {}", manager.identity());
        }
        Command::Backup { password } => {
            manager.backup_private_key(&password).await?;
            println!("backed up private key for {}", manager.identity());
        }
        Command::Restore { password } => {
            manager.restore_private_key(&password).await?;
            println!("restored private key for {}", manager.identity());
        }
        Command::ResetBackup { password } => {
            manager.reset_private_key_backup(&password).await?;
            println!("deleted private key backup for {}", manager.identity());
        }
        Command::ChangePassword {
            password,
            new_password,
        } => {
            manager.change_password(&password, &new_password).await?;
            println!("changed backup password for {}", manager.identity());
        }
        Command::Cleanup => {
            let removed = manager.cleanup().await?;
            println!(
                "cleaned up {} (local key {})",
                manager.identity(),
                if removed { "removed" } else { "was absent" }
            );
        }
        Command::Lookup { mut identities } => {
            let query = if identities.len() == 1 {
                IdentityQuery::Single(identities.remove(0))
            } else {
                IdentityQuery::Batch(identities)
            };
            let single = match &query {
                IdentityQuery::Single(identity) => identity.clone(),
                IdentityQuery::Batch(_) => String::new(),
            };
            match manager.lookup_public_keys(query).await? {
                LookupOutcome::Single(key) => println!("{}\t{}", single, key.key_id_hex()),
                LookupOutcome::Batch(found) => {
                    for key in found {
                        println!("{}\t{}\t{}", key.identity, key.public_key.key_id_hex(), key.card_id);
                    }
                }
            }
        }
        Command::Encrypt { text, recipients } => {
            let recipients = resolve_recipients(manager, recipients).await?;
            let encoded = manager.encrypt_text(&text, recipients.as_deref()).await?;
            println!("{encoded}");
        }
        Command::Decrypt { ciphertext, sender } => {
            let sender = match sender {
                Some(identity) => Some(manager.lookup_public_key(&identity).await?),
                None => None,
            };
            let text = manager.decrypt_text(&ciphertext, sender.as_ref()).await?;
            println!("{text}");
        }
    }
    Ok(())
}

async fn resolve_recipients(
    manager: &IdentityManager,
    identities: Vec<String>,
) -> anyhow::Result<Option<Vec<PublicKey>>> {
    if identities.is_empty() {
        return Ok(None);
    }
    let outcome = manager.lookup_public_keys(identities).await?;
    Ok(Some(outcome.into_keys()))
}
