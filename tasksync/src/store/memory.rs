//! In-memory [`DocumentStore`] for tests.

use parking_lot::Mutex;

use super::{DocumentStore, StoreError};

#[derive(Debug, Default)]
struct Inner {
    data: Option<Vec<u8>>,
    writes: usize,
    fail_writes: bool,
}

/// Keeps the snapshot in memory and counts successful writes.
///
/// Writes can be made to fail with [`set_fail_writes`](Self::set_fail_writes)
/// to exercise the persistence-failure path; a failed write leaves the
/// previous snapshot untouched.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `bytes`.
    #[must_use]
    pub fn with_contents(bytes: Vec<u8>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: Some(bytes),
                ..Inner::default()
            }),
        }
    }

    /// Number of successful writes so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.inner.lock().writes
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.inner.lock().data.clone()
    }

    /// Makes subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }
}

impl DocumentStore for InMemoryStore {
    async fn write(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.fail_writes {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        inner.data = Some(bytes.to_vec());
        inner.writes += 1;
        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.lock().data.clone())
    }

    async fn remove(&self) -> Result<(), StoreError> {
        self.inner.lock().data = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_write_keeps_previous_contents() {
        let store = InMemoryStore::new();
        store.write(b"first").await.unwrap();
        store.set_fail_writes(true);
        assert!(store.write(b"second").await.is_err());
        assert_eq!(store.contents().as_deref(), Some(&b"first"[..]));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn remove_clears_contents() {
        let store = InMemoryStore::with_contents(b"x".to_vec());
        store.remove().await.unwrap();
        assert!(store.read().await.unwrap().is_none());
        store.remove().await.unwrap();
    }
}
