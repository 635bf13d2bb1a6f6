//! JSON file registry store.

use crate::fleet::ports::{
    RegistrySnapshot, RegistryStore, RegistryStoreError, RegistryStoreResult,
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use std::io::Write;
use uuid::Uuid;

/// Registry store backed by one pretty-printed JSON file.
///
/// Saves go to a sibling temporary file which is synced and then renamed
/// over the target, so readers never observe a partially written snapshot.
#[derive(Debug, Clone)]
pub struct JsonFileRegistryStore {
    path: Utf8PathBuf,
}

impl JsonFileRegistryStore {
    /// Creates a store writing to `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the snapshot path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

fn split_path(path: &Utf8Path) -> RegistryStoreResult<(&Utf8Path, &str)> {
    let file_name = path.file_name().ok_or_else(|| {
        RegistryStoreError::io(std::io::Error::other("registry path must include a file name"))
    })?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    Ok((parent, file_name))
}

fn read_snapshot(path: &Utf8Path) -> RegistryStoreResult<Option<RegistrySnapshot>> {
    let (parent, file_name) = split_path(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(RegistryStoreError::io(err)),
    };
    let bytes = match dir.read(file_name) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(RegistryStoreError::io(err)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(RegistryStoreError::corrupt)
}

/// Writes `bytes` to a new file and flushes it to disk before returning.
fn write_synced(dir: &Dir, name: &str, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = dir.create(name)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn write_snapshot(path: &Utf8Path, snapshot: &RegistrySnapshot) -> RegistryStoreResult<()> {
    let (parent, file_name) = split_path(path)?;
    let bytes = serde_json::to_vec_pretty(snapshot).map_err(RegistryStoreError::io)?;
    Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(RegistryStoreError::io)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(RegistryStoreError::io)?;

    let temp_name = format!(".{file_name}.{}.tmp", Uuid::new_v4().simple());
    let replaced = write_synced(&dir, &temp_name, &bytes)
        .and_then(|()| dir.rename(&temp_name, &dir, file_name));
    if let Err(err) = replaced {
        if let Err(cleanup_err) = dir.remove_file(&temp_name) {
            tracing::warn!(file = %temp_name, error = %cleanup_err, "could not remove temporary snapshot");
        }
        return Err(RegistryStoreError::io(err));
    }
    Ok(())
}

#[async_trait]
impl RegistryStore for JsonFileRegistryStore {
    async fn load(&self) -> RegistryStoreResult<Option<RegistrySnapshot>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_snapshot(&path))
            .await
            .map_err(RegistryStoreError::io)?
    }

    async fn save(&self, snapshot: &RegistrySnapshot) -> RegistryStoreResult<()> {
        let path = self.path.clone();
        let owned = snapshot.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&path, &owned))
            .await
            .map_err(RegistryStoreError::io)?
    }
}
