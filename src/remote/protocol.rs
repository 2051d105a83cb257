use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::Delivery;
use crate::broker::topology::{Exchange, Queue};

/// A request sent by a client, tagged with an id echoed back in the reply.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "declare_exchange")]
    DeclareExchange { exchange: Exchange },
    #[serde(rename = "declare_queue")]
    DeclareQueue { queue: Queue },
    #[serde(rename = "publish")]
    Publish {
        exchange: String,
        routing_key: String,
        body: Value,
    },
    #[serde(rename = "consume")]
    Consume { queue: String },
    #[serde(rename = "cancel")]
    Cancel { queue: String },
    #[serde(rename = "ack")]
    Ack { delivery_tag: u64 },
    #[serde(rename = "get")]
    Get { queue: String },
    #[serde(rename = "purge")]
    Purge { queue: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "reply")]
    Reply { id: u64, outcome: Outcome },
    /// Pushed whenever a consumed queue has a message for this client.
    #[serde(rename = "deliver")]
    Deliver { delivery: Delivery },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "status")]
pub enum Outcome {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "purged")]
    Purged { count: usize },
    #[serde(rename = "got")]
    Got { delivery: Option<Delivery> },
    #[serde(rename = "error")]
    Error { message: String },
}
