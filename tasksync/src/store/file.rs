//! On-disk [`DocumentStore`] with atomic replacement.

use std::path::{Path, PathBuf};

use tasksync_proto::remote::DeviceId;

use super::{DocumentStore, StoreError};

/// File name of the document snapshot inside the data directory.
pub const SNAPSHOT_FILE: &str = "document.json";

/// File name of the persisted device identifier.
const DEVICE_ID_FILE: &str = "device-id";

/// Stores the snapshot in a single file.
///
/// Writes go to a sibling temp file which is flushed to stable storage and
/// then renamed over the snapshot, so a crash mid-write leaves the previous
/// snapshot intact.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Creates a store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Creates a store for the default snapshot file inside `data_dir`.
    #[must_use]
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(SNAPSHOT_FILE))
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl DocumentStore for FileStore {
    async fn write(&self, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error(parent))?;
        }

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, bytes).await.map_err(io_error(&tmp))?;
        tokio::fs::OpenOptions::new()
            .write(true)
            .open(&tmp)
            .await
            .map_err(io_error(&tmp))?
            .sync_all()
            .await
            .map_err(io_error(&tmp))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(io_error(&self.path))?;

        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "snapshot written");
        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&self.path)(e)),
        }
    }

    async fn remove(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "snapshot removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&self.path)(e)),
        }
    }
}

/// Returns the device identifier stored in `data_dir`, creating and
/// persisting a fresh one on first use.
///
/// # Errors
///
/// Returns [`StoreError::Io`] if the identifier cannot be read or written.
pub fn load_or_create_device_id(data_dir: &Path) -> Result<DeviceId, StoreError> {
    let path = data_dir.join(DEVICE_ID_FILE);
    match std::fs::read_to_string(&path) {
        Ok(contents) if !contents.trim().is_empty() => return Ok(DeviceId::new(contents.trim())),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_error(&path)(e)),
    }

    let id = DeviceId::generate();
    std::fs::create_dir_all(data_dir).map_err(io_error(data_dir))?;
    std::fs::write(&path, id.as_str()).map_err(io_error(&path))?;
    tracing::info!(device_id = %id, "generated new device id");
    Ok(id)
}
