//! Topology shared by every participant: one direct exchange, the `logs`
//! queue and the dead-letter queue.

use crate::broker::Delivery;
use crate::broker::topology::{
    DEAD_LETTER, EXCHANGE, Exchange, INCOMING_MESSAGES, LOGS, OUTGOING_MESSAGES, Queue,
};
use crate::config::Settings;
use crate::message::{IncomingMessage, OutgoingMessage};
use crate::utils::error::WorkerError;
use crate::worker::{Consumer, Verdict, Worker, WorkerCore};

/// The shared exchange. Unroutable messages go to the dead-letter queue.
pub fn exchanges(durable: bool) -> Vec<Exchange> {
    vec![Exchange::direct(EXCHANGE, durable).with_dead_letter(DEAD_LETTER)]
}

/// The `logs` queue, never durable, and the dead-letter queue.
pub fn queues(durable: bool) -> Vec<Queue> {
    vec![
        Queue::bound(LOGS, EXCHANGE, false),
        Queue::bound(DEAD_LETTER, EXCHANGE, durable),
    ]
}

/// A queue carrying messages, durable along with the other message queues.
pub fn message_queue(name: &str, durable: bool) -> Queue {
    Queue::bound(name, EXCHANGE, durable)
}

/// A worker with the standard topology and nothing to consume.
///
/// Used by clients that only publish: it declares the message queues so that
/// what it dispatches is kept until the router consumes it.
#[derive(Debug)]
pub struct StandardWorker {
    core: WorkerCore<()>,
}

impl StandardWorker {
    pub fn new(name: &str, settings: &Settings) -> Self {
        Self {
            core: WorkerCore::new(name, settings),
        }
    }

    /// Connect if needed, then publish to `incoming_messages`.
    pub fn dispatch(&mut self, message: &IncomingMessage) -> Result<(), WorkerError> {
        self.connect()?;
        message.dispatch(&mut self.core.producer()?)
    }

    /// Connect if needed, then publish to `outgoing_messages`.
    pub fn send(&mut self, message: &OutgoingMessage) -> Result<(), WorkerError> {
        self.connect()?;
        message.send(&mut self.core.producer()?)
    }
}

impl Worker for StandardWorker {
    type Callback = ();

    fn core(&self) -> &WorkerCore<()> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WorkerCore<()> {
        &mut self.core
    }

    fn exchanges(&self) -> Vec<Exchange> {
        exchanges(self.core.persistent())
    }

    fn queues(&self) -> Vec<Queue> {
        let durable = self.core.persistent();
        let mut queues = queues(durable);
        queues.push(message_queue(INCOMING_MESSAGES, durable));
        queues.push(message_queue(OUTGOING_MESSAGES, durable));
        queues
    }

    fn consumers(&self) -> Vec<Consumer<()>> {
        Vec::new()
    }

    fn handle(&mut self, _: &(), _: &Delivery) -> Result<Verdict, WorkerError> {
        Ok(Verdict::Pass)
    }
}
