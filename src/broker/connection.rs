//! Connection to the message broker.
//!
//! A `Connection` carries exactly one channel; every worker owns one and
//! never shares it. The transport is chosen from the `message_broker`
//! settings:
//! - `memory`: process-local queues, option `virtual_host`
//! - `ws`: a `textroute broker` server, option `url`

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::broker::delivery::Delivery;
use crate::broker::engine::SharedEngine;
use crate::broker::memory::{self, DEFAULT_VIRTUAL_HOST, MemoryChannel};
use crate::broker::topology::{Exchange, Queue};
use crate::config::BrokerSettings;
use crate::remote::client::RemoteChannel;
use crate::utils::error::BrokerError;

pub const DEFAULT_BROKER_URL: &str = "ws://127.0.0.1:5673";

#[derive(Debug)]
pub enum Connection {
    Memory(MemoryChannel),
    Remote(RemoteChannel),
}

impl Connection {
    pub fn open(settings: &BrokerSettings) -> Result<Self, BrokerError> {
        let option = |key: &str| settings.options.get(key).and_then(Value::as_str);

        match settings.transport.as_str() {
            "memory" => {
                let vhost = option("virtual_host").unwrap_or(DEFAULT_VIRTUAL_HOST);
                Ok(Connection::Memory(MemoryChannel::open(
                    memory::virtual_host(vhost),
                )))
            }
            "ws" | "websocket" => {
                let url = option("url").unwrap_or(DEFAULT_BROKER_URL);
                Ok(Connection::Remote(RemoteChannel::connect(url)?))
            }
            other => Err(BrokerError::UnsupportedTransport(other.to_string())),
        }
    }

    /// Connect directly to an engine living in this process.
    pub fn to_engine(engine: Arc<SharedEngine>) -> Self {
        Connection::Memory(MemoryChannel::open(engine))
    }

    pub fn declare_exchange(&mut self, exchange: &Exchange) -> Result<(), BrokerError> {
        match self {
            Connection::Memory(channel) => channel.declare_exchange(exchange),
            Connection::Remote(channel) => channel.declare_exchange(exchange),
        }
    }

    pub fn declare_queue(&mut self, queue: &Queue) -> Result<(), BrokerError> {
        match self {
            Connection::Memory(channel) => channel.declare_queue(queue),
            Connection::Remote(channel) => channel.declare_queue(queue),
        }
    }

    pub fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: Value,
    ) -> Result<(), BrokerError> {
        match self {
            Connection::Memory(channel) => channel.publish(exchange, routing_key, body),
            Connection::Remote(channel) => channel.publish(exchange, routing_key, body),
        }
    }

    pub fn consume(&mut self, queue: &str) -> Result<(), BrokerError> {
        match self {
            Connection::Memory(channel) => channel.consume(queue),
            Connection::Remote(channel) => channel.consume(queue),
        }
    }

    pub fn cancel(&mut self, queue: &str) -> Result<(), BrokerError> {
        match self {
            Connection::Memory(channel) => channel.cancel(queue),
            Connection::Remote(channel) => channel.cancel(queue),
        }
    }

    pub fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        match self {
            Connection::Memory(channel) => channel.ack(delivery_tag),
            Connection::Remote(channel) => channel.ack(delivery_tag),
        }
    }

    /// Fetch a single message without consuming the queue.
    pub fn get(&mut self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        match self {
            Connection::Memory(channel) => channel.get(queue),
            Connection::Remote(channel) => channel.get(queue),
        }
    }

    pub fn purge(&mut self, queue: &str) -> Result<usize, BrokerError> {
        match self {
            Connection::Memory(channel) => channel.purge(queue),
            Connection::Remote(channel) => channel.purge(queue),
        }
    }

    /// Wait up to `timeout` for the next delivery on any consumed queue.
    /// Fails with [`BrokerError::Timeout`] when nothing arrived.
    pub fn drain_events(&mut self, timeout: Duration) -> Result<Delivery, BrokerError> {
        match self {
            Connection::Memory(channel) => channel.drain_events(timeout),
            Connection::Remote(channel) => channel.drain_events(timeout),
        }
    }

    /// Close the connection. Unacknowledged deliveries go back to their
    /// queues. Fails with [`BrokerError::Closed`] if the broker side is
    /// already gone.
    pub fn release(self) -> Result<(), BrokerError> {
        match self {
            Connection::Memory(channel) => channel.release(),
            Connection::Remote(channel) => channel.release(),
        }
    }
}
