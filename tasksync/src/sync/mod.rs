//! Synchronization core: merge engine, mutations and the orchestrator.
//!
//! - [`merge`]: pure last-writer-wins merge of two documents
//! - [`mutation`]: value-level edits and document operations
//! - [`orchestrator`]: the actor that owns the live document

pub mod merge;
pub mod mutation;
pub mod orchestrator;

use std::fmt;

use tasksync_proto::model::{ItemId, ListId};

use crate::auth::Identity;
use crate::store::StoreError;
use crate::transport::TransportError;

pub use self::orchestrator::{SyncConfig, SyncEngine, SyncHandle};

/// Connectivity as shown to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SyncStatus {
    /// Signed out, or not yet reached the remote.
    #[default]
    Disconnected,
    /// The remote is reachable and local state is saved.
    Connected,
    /// Something needs attention (repeated network failure, rejected
    /// credentials, failing local writes).
    Error(String),
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
            Self::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

/// Whether an account is signed in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthState {
    /// No account.
    #[default]
    SignedOut,
    /// Syncing as this identity.
    SignedIn(Identity),
}

impl AuthState {
    /// The signed-in identity, if any.
    #[must_use]
    pub const fn identity(&self) -> Option<&Identity> {
        match self {
            Self::SignedOut => None,
            Self::SignedIn(identity) => Some(identity),
        }
    }
}

/// Errors returned to callers of the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// No list has this id.
    #[error("list {0} not found")]
    ListNotFound(ListId),

    /// No item has this id.
    #[error("item {0} not found")]
    ItemNotFound(ItemId),

    /// An item mutation was requested without an item id.
    #[error("item mutation requires an item id")]
    ItemRequired,

    /// Writing the local snapshot failed.
    #[error("failed to save: {0}")]
    Persist(String),

    /// Publishing to the remote failed.
    #[error("failed to sync: {0}")]
    Transport(#[from] TransportError),

    /// The engine task has exited.
    #[error("sync engine stopped")]
    EngineStopped,
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        Self::Persist(e.to_string())
    }
}
