//! Local persistence of the full document snapshot.
//!
//! Defines the [`DocumentStore`] byte-level binding plus helpers that encode
//! and decode a [`Document`] through it. Implementations:
//! - [`file::FileStore`]: atomic write-to-temp-then-rename on disk
//! - [`memory::InMemoryStore`]: in-memory store for tests, with write
//!   counting and failure injection

pub mod file;
pub mod memory;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tasksync_proto::codec::{self, CodecError, SchemaVersion};
use tasksync_proto::model::Document;

/// Errors that can occur during local persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The store is unavailable (disk full, permissions, injected failure).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The snapshot could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Durable single-writer storage for the serialized document.
pub trait DocumentStore: Send + Sync + 'static {
    /// Atomically replaces the stored snapshot with `bytes`.
    ///
    /// A failure part-way through must leave the previous snapshot intact.
    fn write(&self, bytes: &[u8]) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Reads the stored snapshot, or `None` if nothing has been written.
    fn read(&self) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    /// Deletes the stored snapshot. Deleting a missing snapshot succeeds.
    fn remove(&self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

impl<S: DocumentStore> DocumentStore for Arc<S> {
    fn write(&self, bytes: &[u8]) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).write(bytes)
    }

    fn read(&self) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send {
        (**self).read()
    }

    fn remove(&self) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).remove()
    }
}

/// Encodes and durably writes `doc`.
///
/// # Errors
///
/// Returns [`StoreError`] if encoding or the write fails.
pub async fn save_document<S: DocumentStore>(store: &S, doc: &Document) -> Result<(), StoreError> {
    let bytes = codec::encode_document(doc)?;
    store.write(&bytes).await
}

/// Loads the stored document, accepting the legacy schema as a fallback.
///
/// Returns `Ok(None)` if nothing has been stored yet.
///
/// # Errors
///
/// Returns [`StoreError`] if the read fails or the bytes match no schema.
pub async fn load_document<S: DocumentStore>(
    store: &S,
) -> Result<Option<(Document, SchemaVersion)>, StoreError> {
    let Some(bytes) = store.read().await? else {
        return Ok(None);
    };
    Ok(Some(codec::decode_document(&bytes)?))
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryStore;
    use super::*;
    use tasksync_proto::model::TaskList;

    #[tokio::test]
    async fn load_from_empty_store_is_none() {
        let store = InMemoryStore::new();
        assert!(load_document(&store).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load() {
        let store = InMemoryStore::new();
        let doc = Document {
            lists: vec![TaskList::new("Inbox", 1)],
            ..Document::default()
        };
        save_document(&store, &doc).await.unwrap();
        let (loaded, version) = load_document(&store).await.unwrap().unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(version, SchemaVersion::Current);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_codec_error() {
        let store = InMemoryStore::new();
        store.write(b"not a document").await.unwrap();
        let err = load_document(&store).await.unwrap_err();
        assert!(matches!(err, StoreError::Codec(_)));
    }
}
