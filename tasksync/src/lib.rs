//! `TaskSync`: offline-first, multi-writer task list synchronization.
//!
//! The engine keeps one [`Document`](tasksync_proto::model::Document) per
//! signed-in account, persists it locally, and converges with every other
//! device through a single shared remote snapshot using last-writer-wins
//! merging and tombstone-based deletion tracking.

pub mod auth;
pub mod clock;
pub mod config;
pub mod remote;
pub mod store;
pub mod sync;
pub mod transport;
