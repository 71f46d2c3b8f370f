//! `TaskSync` relay library.
//!
//! Exposes the document server for use in tests and embedding. The server
//! keeps one opaque document per account, stamps every write with a
//! strictly increasing version and the writing device, and fans updates out
//! to WebSocket subscribers. It never merges: conflict resolution happens on
//! the clients.

pub mod config;
pub mod relay;
pub mod store;
