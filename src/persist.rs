//! JSON snapshot files for the sandbox collaborators.

use std::io;
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

/// Load a JSON snapshot, falling back to `T::default()` when the file is absent.
pub(crate) async fn load_json<T: DeserializeOwned + Default>(path: &Path) -> io::Result<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e),
    }
}

/// Write a JSON snapshot via a temporary file and rename.
pub(crate) async fn save_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
