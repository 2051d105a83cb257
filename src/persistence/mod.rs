//! The `persistence` module keeps the messages of durable queues on disk.
//!
//! This is what lets messages survive a broker restart: a message published
//! to a durable queue stays stored until it is acknowledged or purged, and
//! is loaded back when the queue is declared again.
//!
//! It uses `sled` as an embedded key-value store.

pub mod sled_store;

pub use sled_store::{Persistence, StoredMessage};
