//! Shared definitions for `TaskSync`: the synchronized document model,
//! tombstone bookkeeping, the persisted snapshot codec and the remote
//! wire format.

pub mod codec;
pub mod model;
pub mod remote;
pub mod tombstone;
