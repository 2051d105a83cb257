//! In-process broker transport.
//!
//! Engines are looked up by virtual host name, so every connection opened in
//! the same process with the same `virtual_host` option shares one set of
//! queues. Nothing is shared across processes.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::Mutex;

use crate::broker::delivery::Delivery;
use crate::broker::engine::{ConnectionId, Engine, SharedEngine};
use crate::broker::topology::{Exchange, Queue};
use crate::utils::error::BrokerError;

pub const DEFAULT_VIRTUAL_HOST: &str = "default";

static VIRTUAL_HOSTS: LazyLock<Mutex<HashMap<String, Arc<SharedEngine>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// The engine of the virtual host `name`, created on first use.
pub fn virtual_host(name: &str) -> Arc<SharedEngine> {
    VIRTUAL_HOSTS
        .lock()
        .entry(name.to_string())
        .or_insert_with(|| SharedEngine::new(Engine::new()))
        .clone()
}

#[derive(Debug)]
pub struct MemoryChannel {
    engine: Arc<SharedEngine>,
    id: ConnectionId,
}

impl MemoryChannel {
    pub fn open(engine: Arc<SharedEngine>) -> Self {
        let id = engine.with(|e| e.open_connection());
        Self { engine, id }
    }

    pub fn engine(&self) -> &Arc<SharedEngine> {
        &self.engine
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn declare_exchange(&mut self, exchange: &Exchange) -> Result<(), BrokerError> {
        self.engine.with(|e| e.declare_exchange(exchange.clone()));
        Ok(())
    }

    pub fn declare_queue(&mut self, queue: &Queue) -> Result<(), BrokerError> {
        self.engine.with(|e| e.declare_queue(queue.clone()))
    }

    pub fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: serde_json::Value,
    ) -> Result<(), BrokerError> {
        self.engine
            .with(|e| e.publish(exchange, routing_key, body))
            .map(|_| ())
    }

    pub fn consume(&mut self, queue: &str) -> Result<(), BrokerError> {
        let id = self.id;
        self.engine.with(|e| e.consume(id, queue))
    }

    pub fn cancel(&mut self, queue: &str) -> Result<(), BrokerError> {
        let id = self.id;
        self.engine.with(|e| e.cancel(id, queue));
        Ok(())
    }

    pub fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        let id = self.id;
        self.engine.with(|e| e.ack(id, delivery_tag))
    }

    pub fn get(&mut self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let id = self.id;
        self.engine.with(|e| e.get(id, queue))
    }

    pub fn purge(&mut self, queue: &str) -> Result<usize, BrokerError> {
        self.engine.with(|e| e.purge(queue))
    }

    pub fn drain_events(&mut self, timeout: Duration) -> Result<Delivery, BrokerError> {
        self.engine.wait_for_delivery(self.id, timeout)
    }

    pub fn release(self) -> Result<(), BrokerError> {
        let id = self.id;
        self.engine.with(|e| {
            if !e.is_open(id) {
                return Err(BrokerError::Closed);
            }
            e.close_connection(id);
            Ok(())
        })
    }
}
