//! Broker engine
//!
//! This module contains the broker implementation responsible for:
//! - declaring direct exchanges and the queues bound to them
//! - routing published messages to every queue bound to their routing key,
//!   and unroutable ones to the exchange's dead-letter key
//! - handing messages to consumers and tracking them until acknowledged
//! - requeueing unacknowledged deliveries when their connection goes away or
//!   when they stay unacknowledged for too long
//! - persisting messages of durable queues via the `Persistence` store
//!
//! Concurrency and usage notes:
//! - The `Engine` API is synchronous. Processes that share one engine
//!   between several connections hold it behind a [`SharedEngine`], which
//!   also wakes up whoever waits for deliveries.
//! - Connections are identified by an opaque [`ConnectionId`]; delivery tags
//!   are only valid on the connection that received them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, warn};

use crate::broker::delivery::Delivery;
use crate::broker::topology::{Exchange, Queue};
use crate::persistence::{Persistence, StoredMessage};
use crate::utils::error::BrokerError;

pub type ConnectionId = u64;

#[derive(Debug, Clone)]
pub struct PendingAck {
    pub queue: String,
    pub message: StoredMessage,
    pub connection: ConnectionId,
    pub sent_at: i64,
}

#[derive(Debug)]
struct QueueState {
    queue: Queue,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug, Default)]
pub struct Engine {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, QueueState>,
    bindings: HashMap<(String, String), Vec<String>>,
    consumers: HashMap<ConnectionId, Vec<String>>,
    pub pending_acks: HashMap<u64, PendingAck>,
    /// Tags requeued by the ack-timeout sweep, with the connection that
    /// still holds them.
    expired_tags: HashMap<u64, ConnectionId>,
    next_tag: u64,
    next_connection: ConnectionId,
    next_seq: u64,
    persistence: Option<Persistence>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_with_persistence(persistence: Persistence) -> Self {
        Self {
            persistence: Some(persistence),
            ..Self::default()
        }
    }

    pub fn open_connection(&mut self) -> ConnectionId {
        self.next_connection += 1;
        self.consumers.insert(self.next_connection, Vec::new());
        self.next_connection
    }

    pub fn is_open(&self, connection: ConnectionId) -> bool {
        self.consumers.contains_key(&connection)
    }

    /// Drop a connection: its consumers are cancelled and every delivery it
    /// did not acknowledge goes back to the head of its queue. Returns the
    /// number of requeued messages.
    pub fn close_connection(&mut self, connection: ConnectionId) -> usize {
        self.consumers.remove(&connection);
        self.expired_tags.retain(|_, owner| *owner != connection);

        let mut tags: Vec<u64> = self
            .pending_acks
            .iter()
            .filter(|(_, pending)| pending.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();
        // Newest first so that pushing to the front restores delivery order.
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let mut requeued = 0;
        for tag in tags {
            if let Some(pending) = self.pending_acks.remove(&tag) {
                if let Some(state) = self.queues.get_mut(&pending.queue) {
                    let mut message = pending.message;
                    message.redelivered = true;
                    state.ready.push_front(message);
                    requeued += 1;
                }
            }
        }

        if requeued > 0 {
            debug!("Requeued {requeued} unacknowledged messages of connection {connection}");
        }
        requeued
    }

    /// Declaring an existing exchange is a no-op.
    pub fn declare_exchange(&mut self, exchange: Exchange) {
        self.exchanges
            .entry(exchange.name.clone())
            .or_insert(exchange);
    }

    /// Declare a queue and bind it. Re-declaring is a no-op apart from adding
    /// a missing binding. A durable queue reloads the messages its store
    /// still holds.
    pub fn declare_queue(&mut self, queue: Queue) -> Result<(), BrokerError> {
        if !self.exchanges.contains_key(&queue.exchange) {
            return Err(BrokerError::UnknownExchange(queue.exchange.clone()));
        }

        let binding = (queue.exchange.clone(), queue.routing_key.clone());
        let bound = self.bindings.entry(binding).or_default();
        if !bound.contains(&queue.name) {
            bound.push(queue.name.clone());
        }

        if !self.queues.contains_key(&queue.name) {
            let mut ready = VecDeque::new();
            if queue.durable {
                if let Some(persistence) = &self.persistence {
                    for mut message in persistence.load_messages(&queue.name)? {
                        self.next_seq = self.next_seq.max(message.seq + 1);
                        message.redelivered = true;
                        ready.push_back(message);
                    }
                }
            }
            self.queues
                .insert(queue.name.clone(), QueueState { queue, ready });
        }
        Ok(())
    }

    /// Route a message. Returns the number of queues it reached, which is
    /// zero only if neither its routing key nor the dead-letter key of the
    /// exchange has a queue bound.
    pub fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: Value,
    ) -> Result<usize, BrokerError> {
        self.route(exchange, routing_key, body, None)
    }

    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: Value,
        original_routing_key: Option<String>,
    ) -> Result<usize, BrokerError> {
        let dead_letter_key = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?
            .dead_letter_key
            .clone();

        let targets = self.bound_queues(exchange, routing_key);
        if targets.is_empty() {
            return match dead_letter_key {
                Some(key) if key != routing_key && original_routing_key.is_none() => {
                    warn!("No queue bound to '{routing_key}', dead-lettering to '{key}'");
                    self.route(exchange, &key, body, Some(routing_key.to_string()))
                }
                _ => {
                    warn!("Message to '{routing_key}' dropped: no queue bound");
                    Ok(0)
                }
            };
        }

        for queue_name in &targets {
            let message = StoredMessage {
                seq: self.next_seq()?,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.clone(),
                original_routing_key: original_routing_key.clone(),
                redelivered: false,
                redeliveries: 0,
            };
            self.enqueue(queue_name, message)?;
        }
        Ok(targets.len())
    }

    fn bound_queues(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        self.bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn next_seq(&mut self) -> Result<u64, BrokerError> {
        let seq = match &self.persistence {
            Some(persistence) => persistence.next_id()?.max(self.next_seq),
            None => self.next_seq,
        };
        self.next_seq = seq + 1;
        Ok(seq)
    }

    fn enqueue(&mut self, queue_name: &str, message: StoredMessage) -> Result<(), BrokerError> {
        let state = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::UnknownQueue(queue_name.to_string()))?;
        if state.queue.durable {
            if let Some(persistence) = &self.persistence {
                persistence.store_message(queue_name, &message)?;
            }
        }
        state.ready.push_back(message);
        Ok(())
    }

    /// Register `connection` as a consumer of `queue`.
    pub fn consume(&mut self, connection: ConnectionId, queue: &str) -> Result<(), BrokerError> {
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        let consumed = self
            .consumers
            .get_mut(&connection)
            .ok_or(BrokerError::Closed)?;
        if !consumed.iter().any(|name| name == queue) {
            consumed.push(queue.to_string());
        }
        Ok(())
    }

    pub fn cancel(&mut self, connection: ConnectionId, queue: &str) {
        if let Some(consumed) = self.consumers.get_mut(&connection) {
            consumed.retain(|name| name != queue);
        }
    }

    /// Next message for one of the queues `connection` consumes, if any.
    /// Queues are scanned in a rotating order so a busy queue cannot starve
    /// the others.
    pub fn next_delivery(&mut self, connection: ConnectionId) -> Option<Delivery> {
        let consumed = self.consumers.get_mut(&connection)?;
        let position = consumed.iter().position(|name| {
            self.queues
                .get(name)
                .is_some_and(|state| !state.ready.is_empty())
        })?;
        let queue = consumed.remove(position);
        consumed.push(queue.clone());

        let message = self.queues.get_mut(&queue)?.ready.pop_front()?;
        Some(self.deliver(connection, &queue, message))
    }

    /// Fetch one message from `queue` without registering a consumer.
    pub fn get(
        &mut self,
        connection: ConnectionId,
        queue: &str,
    ) -> Result<Option<Delivery>, BrokerError> {
        let state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        let message = state.ready.pop_front();
        Ok(message.map(|message| self.deliver(connection, queue, message)))
    }

    fn deliver(&mut self, connection: ConnectionId, queue: &str, message: StoredMessage) -> Delivery {
        self.next_tag += 1;
        let delivery = Delivery {
            delivery_tag: self.next_tag,
            queue: queue.to_string(),
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            redelivered: message.redelivered,
            original_routing_key: message.original_routing_key.clone(),
        };
        self.pending_acks.insert(
            self.next_tag,
            PendingAck {
                queue: queue.to_string(),
                message,
                connection,
                sent_at: chrono::Utc::now().timestamp_millis(),
            },
        );
        delivery
    }

    /// Acknowledge a delivery. A late ack for a delivery the ack-timeout
    /// sweep already requeued is accepted and ignored: the message will be
    /// delivered again.
    pub fn ack(&mut self, connection: ConnectionId, delivery_tag: u64) -> Result<(), BrokerError> {
        if self.expired_tags.get(&delivery_tag) == Some(&connection) {
            self.expired_tags.remove(&delivery_tag);
            warn!("Late ack for delivery {delivery_tag}, the message was already requeued");
            return Ok(());
        }
        match self.pending_acks.get(&delivery_tag) {
            Some(pending) if pending.connection == connection => {}
            _ => return Err(BrokerError::UnknownDelivery(delivery_tag)),
        }
        if let Some(pending) = self.pending_acks.remove(&delivery_tag) {
            self.forget(&pending.queue, pending.message.seq)?;
        }
        Ok(())
    }

    fn forget(&self, queue: &str, seq: u64) -> Result<(), BrokerError> {
        let durable = self.queues.get(queue).is_some_and(|s| s.queue.durable);
        if durable {
            if let Some(persistence) = &self.persistence {
                persistence.remove_message(queue, seq)?;
            }
        }
        Ok(())
    }

    /// Remove every ready message from `queue`. Messages already handed to a
    /// consumer are not affected.
    pub fn purge(&mut self, queue: &str) -> Result<usize, BrokerError> {
        let state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        let purged: Vec<StoredMessage> = state.ready.drain(..).collect();
        for message in &purged {
            self.forget(queue, message.seq)?;
        }
        Ok(purged.len())
    }

    /// Number of messages waiting in `queue`, not counting unacknowledged
    /// deliveries.
    pub fn message_count(&self, queue: &str) -> Result<usize, BrokerError> {
        self.queues
            .get(queue)
            .map(|state| state.ready.len())
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))
    }

    /// Requeue deliveries left unacknowledged for longer than `ack_timeout`.
    /// A message requeued more than `max_redeliveries` times is dead-lettered
    /// instead. Returns `(requeued, dead_lettered)`.
    pub fn requeue_expired(
        &mut self,
        now_ms: i64,
        ack_timeout: Duration,
        max_redeliveries: u8,
    ) -> Result<(usize, usize), BrokerError> {
        let timeout_ms = i64::try_from(ack_timeout.as_millis()).unwrap_or(i64::MAX);
        let mut expired: Vec<u64> = self
            .pending_acks
            .iter()
            .filter(|(_, pending)| now_ms - pending.sent_at > timeout_ms)
            .map(|(tag, _)| *tag)
            .collect();
        expired.sort_unstable_by(|a, b| b.cmp(a));

        let (mut requeued, mut dead_lettered) = (0, 0);
        for tag in expired {
            let Some(pending) = self.pending_acks.remove(&tag) else {
                continue;
            };
            self.expired_tags.insert(tag, pending.connection);
            let mut message = pending.message;
            if message.redeliveries >= max_redeliveries {
                warn!(
                    "Message {} dropped from '{}' after {} redeliveries",
                    message.seq, pending.queue, max_redeliveries
                );
                self.forget(&pending.queue, message.seq)?;
                self.dead_letter(message)?;
                dead_lettered += 1;
                continue;
            }
            message.redelivered = true;
            message.redeliveries += 1;
            if let Some(state) = self.queues.get_mut(&pending.queue) {
                state.ready.push_front(message);
                requeued += 1;
            }
        }
        Ok((requeued, dead_lettered))
    }

    fn dead_letter(&mut self, message: StoredMessage) -> Result<(), BrokerError> {
        let key = self
            .exchanges
            .get(&message.exchange)
            .and_then(|exchange| exchange.dead_letter_key.clone());
        match key {
            Some(key) if key != message.routing_key => {
                self.route(
                    &message.exchange,
                    &key,
                    message.body,
                    Some(message.routing_key),
                )?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// An engine shared by several connections of the same process.
///
/// Every mutation goes through [`SharedEngine::with`], which wakes up both
/// blocking waiters (memory connections) and async waiters (the WebSocket
/// server sessions).
#[derive(Debug)]
pub struct SharedEngine {
    engine: Mutex<Engine>,
    activity: Condvar,
    notify: Notify,
}

impl SharedEngine {
    pub fn new(engine: Engine) -> Arc<Self> {
        Arc::new(Self {
            engine: Mutex::new(engine),
            activity: Condvar::new(),
            notify: Notify::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> R {
        let result = f(&mut self.engine.lock());
        self.activity.notify_all();
        self.notify.notify_waiters();
        result
    }

    /// Future resolved at the next mutation of the engine.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Block until a message is delivered to `connection` or `timeout`
    /// elapses.
    pub fn wait_for_delivery(
        &self,
        connection: ConnectionId,
        timeout: Duration,
    ) -> Result<Delivery, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut engine = self.engine.lock();
        loop {
            if let Some(delivery) = engine.next_delivery(connection) {
                return Ok(delivery);
            }
            if !engine.is_open(connection) {
                return Err(BrokerError::Closed);
            }
            if self.activity.wait_until(&mut engine, deadline).timed_out() {
                return engine
                    .next_delivery(connection)
                    .ok_or(BrokerError::Timeout);
            }
        }
    }
}
