//! File-backed local key store.
//!
//! Each identity maps to `<dir>/<sha256(identity)>.key`, a small JSON
//! document holding the base64 secret. Files are written through a temporary
//! file and rename, and restricted to the owner on unix.

use std::io;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use super::LocalKeyStore;
use crate::types::StoreError;

#[derive(Serialize, Deserialize)]
struct LocalKeyEntry {
    identity: String,
    secret_key: String,
    saved_at: DateTime<Utc>,
}

impl Drop for LocalKeyEntry {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, identity: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(identity.as_bytes()));
        self.dir.join(format!("{name}.key"))
    }

    async fn read_entry(&self, identity: &str) -> Result<Option<LocalKeyEntry>, StoreError> {
        let bytes = match tokio::fs::read(self.entry_path(identity)).await {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: LocalKeyEntry = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupt(format!("invalid key entry: {e}")))?;

        if entry.identity != identity {
            return Err(StoreError::Corrupt(format!(
                "key entry belongs to {}, expected {}",
                entry.identity, identity
            )));
        }
        Ok(Some(entry))
    }
}

#[async_trait::async_trait]
impl LocalKeyStore for FileKeyStore {
    async fn save(&self, identity: &str, secret_key: &[u8]) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let entry = LocalKeyEntry {
            identity: identity.to_string(),
            secret_key: BASE64.encode(secret_key),
            saved_at: Utc::now(),
        };
        let bytes = Zeroizing::new(
            serde_json::to_vec(&entry)
                .map_err(|e| StoreError::Corrupt(format!("cannot encode key entry: {e}")))?,
        );

        let path = self.entry_path(identity);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes.as_slice()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp, &path).await?;
        debug!(identity = %identity, path = %path.display(), "Saved local private key");
        Ok(())
    }

    async fn load(&self, identity: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        let Some(entry) = self.read_entry(identity).await? else {
            return Ok(None);
        };

        let secret = BASE64
            .decode(&entry.secret_key)
            .map_err(|e| StoreError::Corrupt(format!("invalid secret encoding: {e}")))?;
        Ok(Some(Zeroizing::new(secret)))
    }

    async fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.entry_path(identity)).await {
            Ok(()) => {
                debug!(identity = %identity, "Removed local private key");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.entry_path(identity)).await?)
    }
}
