//! Persistence layer backed by `sled`
//!
//! Each durable queue gets its own tree named `queue/<name>`. Keys are the
//! big-endian sequence number of the message so iteration yields messages in
//! publish order.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::{Db, Tree};

use crate::utils::error::BrokerError;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub seq: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Value,
    #[serde(default)]
    pub original_routing_key: Option<String>,
    #[serde(default)]
    pub redelivered: bool,
    #[serde(default)]
    pub redeliveries: u8,
}

#[derive(Clone)]
pub struct Persistence {
    db: Db,
}

impl Persistence {
    /// Open or create a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BrokerError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// A database removed when dropped.
    pub fn temporary() -> Result<Self, BrokerError> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }

    /// Monotonic id, unique across restarts of the same database.
    pub fn next_id(&self) -> Result<u64, BrokerError> {
        Ok(self.db.generate_id()?)
    }

    fn tree(&self, queue: &str) -> Result<Tree, BrokerError> {
        Ok(self.db.open_tree(format!("queue/{queue}"))?)
    }

    pub fn store_message(&self, queue: &str, message: &StoredMessage) -> Result<(), BrokerError> {
        let serialized = serde_json::to_vec(message)?;
        self.tree(queue)?
            .insert(message.seq.to_be_bytes(), serialized)?;
        Ok(())
    }

    pub fn remove_message(&self, queue: &str, seq: u64) -> Result<(), BrokerError> {
        self.tree(queue)?.remove(seq.to_be_bytes())?;
        Ok(())
    }

    /// Every message still stored for `queue`, oldest first. Entries that no
    /// longer decode are skipped.
    pub fn load_messages(&self, queue: &str) -> Result<Vec<StoredMessage>, BrokerError> {
        Ok(self
            .tree(queue)?
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(_, val)| serde_json::from_slice(&val).ok())
            .collect())
    }

    pub fn flush(&self) -> Result<(), BrokerError> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .finish()
    }
}
