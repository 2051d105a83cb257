//! Exchange and queue descriptors
//!
//! Every participant routes through a single direct exchange; queues are
//! identified by the `(exchange, routing_key)` they are bound with and, in
//! this system, share their name with that routing key.

use serde::{Deserialize, Serialize};

/// The exchange shared by every worker.
pub const EXCHANGE: &str = "textroute";
/// Log records queued by any process, replayed by the router.
pub const LOGS: &str = "logs";
/// Catch-all for messages whose routing key matches no bound queue.
pub const DEAD_LETTER: &str = "ae.undeliver";
pub const INCOMING_MESSAGES: &str = "incoming_messages";
pub const OUTGOING_MESSAGES: &str = "outgoing_messages";

/// Name (and routing key) of the relay queue of the transport `name`.
pub fn transport_queue(name: &str) -> String {
    format!("{name}_transport")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    /// Routing key unroutable messages are re-published under.
    pub dead_letter_key: Option<String>,
}

impl Exchange {
    pub fn direct(name: &str, durable: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: ExchangeKind::Direct,
            durable,
            dead_letter_key: None,
        }
    }

    pub fn with_dead_letter(mut self, routing_key: &str) -> Self {
        self.dead_letter_key = Some(routing_key.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    pub exchange: String,
    pub routing_key: String,
    pub durable: bool,
}

impl Queue {
    /// A queue named after its routing key, bound to `exchange`.
    pub fn bound(name: &str, exchange: &str, durable: bool) -> Self {
        Self {
            name: name.to_string(),
            exchange: exchange.to_string(),
            routing_key: name.to_string(),
            durable,
        }
    }
}
