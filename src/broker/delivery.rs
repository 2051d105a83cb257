//! A message handed to a consumer.
//!
//! `Delivery` is the canonical envelope passed from the broker to a worker.
//! The `delivery_tag` is what the consumer acknowledges; it is only
//! meaningful on the connection that received the delivery.
//!
//! Notes on fields:
//! - `routing_key`: the key the message was published with, or the
//!   dead-letter key when it could not be routed
//! - `original_routing_key`: set on dead-lettered messages only
//! - `redelivered`: the message was handed out before and never acknowledged

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub body: Value,
    #[serde(default)]
    pub redelivered: bool,
    #[serde(default)]
    pub original_routing_key: Option<String>,
}
