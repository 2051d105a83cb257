//! Worker lifecycle
//!
//! A worker owns one broker connection, declares its exchanges and queues,
//! registers callbacks on the queues it consumes and then polls the
//! connection until it is stopped:
//!
//! ```text
//! start -> on_worker_starts -> connect -> [purge] -> main_loop -> release -> on_worker_stopped
//! ```
//!
//! Callbacks registered on one queue fire in registration order for every
//! delivery. Each returns a [`Verdict`]; the delivery is acknowledged once,
//! by the first callback that reports it handled, and [`Verdict::Stop`]
//! skips the remaining callbacks.

pub mod producer;
pub mod signal;
pub mod standard;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{Level, debug, error, info, warn};

use crate::broker::topology::{Exchange, Queue};
use crate::broker::{Connection, Delivery};
use crate::config::{BrokerSettings, Settings};
use crate::utils::error::{BrokerError, WorkerError};

pub use producer::{LogRecord, Producer};
pub use standard::StandardWorker;

/// Outcome of one callback for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not interested: no acknowledgement.
    Pass,
    /// Acknowledge and let the next callbacks run.
    Handled,
    /// Acknowledge and skip the remaining callbacks.
    Stop,
}

impl Verdict {
    pub fn acks(self) -> bool {
        !matches!(self, Verdict::Pass)
    }
}

impl From<bool> for Verdict {
    fn from(handled: bool) -> Self {
        if handled {
            Verdict::Handled
        } else {
            Verdict::Pass
        }
    }
}

/// Callbacks registered on one queue, in firing order.
#[derive(Debug, Clone)]
pub struct Consumer<C> {
    pub queue: String,
    pub callbacks: Vec<C>,
}

impl<C> Consumer<C> {
    pub fn new(queue: impl Into<String>, callbacks: Vec<C>) -> Self {
        Self {
            queue: queue.into(),
            callbacks,
        }
    }
}

/// Counters returned by [`Worker::main_loop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub deliveries: usize,
    pub timeouts: usize,
}

/// State every worker carries: its connection, its consumers and its
/// running flag.
#[derive(Debug)]
pub struct WorkerCore<C> {
    name: String,
    broker: BrokerSettings,
    persistent: bool,
    connection: Option<Connection>,
    consumers: Vec<Consumer<C>>,
    running: Arc<AtomicBool>,
}

impl<C: Clone> WorkerCore<C> {
    pub fn new(name: impl Into<String>, settings: &Settings) -> Self {
        Self {
            name: name.into(),
            broker: settings.message_broker.clone(),
            persistent: settings.persistent_message_queues,
            connection: None,
            consumers: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether message and dead-letter queues are durable.
    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flag cleared by [`Worker::stop`]; hand it to a signal listener or to
    /// another thread to stop the worker from outside.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn connection(&mut self) -> Result<&mut Connection, WorkerError> {
        self.connection.as_mut().ok_or(WorkerError::NotBound)
    }

    pub fn producer(&mut self) -> Result<Producer<'_>, WorkerError> {
        let connection = self.connection.as_mut().ok_or(WorkerError::NotBound)?;
        Ok(Producer::new(connection, &self.name))
    }

    pub fn ack(&mut self, delivery_tag: u64) -> Result<(), WorkerError> {
        self.connection()?.ack(delivery_tag)?;
        Ok(())
    }

    pub fn consumers(&self) -> &[Consumer<C>] {
        &self.consumers
    }

    fn callbacks_for(&self, queue: &str) -> Vec<C> {
        self.consumers
            .iter()
            .filter(|consumer| consumer.queue == queue)
            .flat_map(|consumer| consumer.callbacks.iter().cloned())
            .collect()
    }

    /// Queue a log record on the `logs` queue. Before the worker is
    /// connected, or if publishing fails, the record is emitted locally.
    pub fn log(
        &mut self,
        level: Level,
        msg: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) {
        let msg = msg.into();
        if let Some(connection) = self.connection.as_mut() {
            let mut producer = Producer::new(connection, &self.name);
            match producer.log(level, msg.clone(), args.clone(), kwargs.clone()) {
                Ok(()) => return,
                Err(e) => warn!("Cannot queue log record: {e}"),
            }
        }
        LogRecord {
            lvl: level.to_string().to_lowercase(),
            msg,
            args,
            kwargs,
            origin: self.name.clone(),
        }
        .emit();
    }
}

/// A participant in the broker topology.
///
/// Implementors describe their topology and callbacks and dispatch each
/// callback in [`handle`](Worker::handle); the lifecycle is provided.
pub trait Worker {
    /// Identifies one callback registered on a consumer.
    type Callback: Clone;

    fn core(&self) -> &WorkerCore<Self::Callback>;
    fn core_mut(&mut self) -> &mut WorkerCore<Self::Callback>;

    fn exchanges(&self) -> Vec<Exchange>;
    fn queues(&self) -> Vec<Queue>;

    /// Consumers to register on connection. Queues without callbacks are
    /// not consumed.
    fn consumers(&self) -> Vec<Consumer<Self::Callback>>;

    /// Run one callback for one delivery.
    fn handle(
        &mut self,
        callback: &Self::Callback,
        delivery: &Delivery,
    ) -> Result<Verdict, WorkerError>;

    fn on_worker_starts(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }

    fn on_worker_connected(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Right before entering the main loop.
    fn on_main_loop(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Every iteration of the main loop, before waiting on the broker.
    fn on_tick(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }

    fn on_worker_stopped(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    /// Open the connection and declare the topology. No-op if already
    /// connected.
    fn connect(&mut self) -> Result<(), WorkerError> {
        if self.core().is_connected() {
            return Ok(());
        }

        let mut connection = Connection::open(&self.core().broker)?;
        for exchange in self.exchanges() {
            connection.declare_exchange(&exchange)?;
        }
        for queue in self.queues() {
            connection.declare_queue(&queue)?;
        }
        let consumers = self.consumers();
        for consumer in consumers.iter().filter(|c| !c.callbacks.is_empty()) {
            connection.consume(&consumer.queue)?;
        }

        let core = self.core_mut();
        core.connection = Some(connection);
        core.consumers = consumers;
        debug!("{} connected", core.name);

        self.on_worker_connected()
    }

    /// Wait for deliveries and dispatch them until the worker is stopped.
    ///
    /// With `limit`, every `timeout` elapsed without a delivery counts down
    /// and the loop exits at zero; deliveries do not count. `None` or zero
    /// means no limit.
    fn main_loop(
        &mut self,
        timeout: Duration,
        limit: Option<u32>,
    ) -> Result<LoopStats, WorkerError> {
        let mut remaining = limit.filter(|limit| *limit > 0);
        let mut stats = LoopStats::default();

        self.on_main_loop()?;

        while self.core().is_running() && remaining != Some(0) {
            self.on_tick()?;

            let delivery = match self.core_mut().connection()?.drain_events(timeout) {
                Ok(delivery) => delivery,
                Err(BrokerError::Timeout) => {
                    stats.timeouts += 1;
                    if let Some(remaining) = remaining.as_mut() {
                        *remaining -= 1;
                    }
                    continue;
                }
                Err(e) => {
                    error!("{}: broker error: {e}", self.name());
                    return Err(e.into());
                }
            };

            stats.deliveries += 1;
            dispatch(self, &delivery)?;
        }

        if !self.core().is_running() {
            info!("Stopping {}", self.name());
        }
        Ok(stats)
    }

    /// Run the whole lifecycle. `force_purge` defaults to purging when
    /// queues are not persistent. The connection is released and
    /// `on_worker_stopped` runs even when the loop fails.
    fn start(
        &mut self,
        timeout: Duration,
        limit: Option<u32>,
        force_purge: Option<bool>,
    ) -> Result<LoopStats, WorkerError> {
        self.core().running.store(true, Ordering::SeqCst);
        self.on_worker_starts()?;

        let purge = force_purge.unwrap_or(!self.core().persistent);
        let result = run(self, timeout, limit, purge);
        if let Err(e) = &result {
            error!("{} stopped on error: {e}", self.name());
        }

        let released = self.release();
        let stopped = self.on_worker_stopped();
        info!("{} stopped", self.name());

        let stats = result?;
        released?;
        stopped?;
        Ok(stats)
    }

    /// Unregister every callback and let the loop exit at its next
    /// iteration. The connection stays open.
    fn stop(&mut self) {
        let core = self.core_mut();
        for consumer in &mut core.consumers {
            consumer.callbacks.clear();
        }
        core.running.store(false, Ordering::SeqCst);
    }

    /// Empty every declared queue. Returns the number of messages removed.
    fn purge(&mut self) -> Result<usize, WorkerError> {
        let queues = self.queues();
        let connection = self.core_mut().connection()?;
        let mut purged = 0;
        for queue in &queues {
            purged += connection.purge(&queue.name)?;
        }
        debug!("Purged {purged} messages from {} queues", queues.len());
        Ok(purged)
    }

    /// Close the connection. A connection the broker already tore down is
    /// not an error.
    fn release(&mut self) -> Result<(), WorkerError> {
        let Some(connection) = self.core_mut().connection.take() else {
            return Ok(());
        };
        match connection.release() {
            Ok(()) => Ok(()),
            Err(e @ (BrokerError::Closed | BrokerError::Io(_))) => {
                debug!("{}: connection already closed: {e}", self.name());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Queue a log record, see [`WorkerCore::log`].
    fn log(&mut self, level: Level, msg: impl Into<String>) {
        self.core_mut().log(level, msg, Vec::new(), Map::new());
    }
}

fn run<W: Worker + ?Sized>(
    worker: &mut W,
    timeout: Duration,
    limit: Option<u32>,
    purge: bool,
) -> Result<LoopStats, WorkerError> {
    worker.connect()?;
    info!("{} is starting", worker.name());
    if purge {
        worker.purge()?;
    }
    worker.main_loop(timeout, limit)
}

/// Run the callbacks of the delivery's queue in order and acknowledge it at
/// most once.
fn dispatch<W: Worker + ?Sized>(worker: &mut W, delivery: &Delivery) -> Result<(), WorkerError> {
    let callbacks = worker.core().callbacks_for(&delivery.queue);
    let mut acked = false;

    for callback in &callbacks {
        let verdict = match worker.handle(callback, delivery) {
            Ok(verdict) => verdict,
            Err(e) if e.is_handler() => {
                warn!(
                    "{}: delivery {} on '{}' not handled: {e}",
                    worker.name(),
                    delivery.delivery_tag,
                    delivery.queue
                );
                Verdict::Pass
            }
            Err(e) => return Err(e),
        };

        if verdict.acks() && !acked {
            worker.core_mut().ack(delivery.delivery_tag)?;
            acked = true;
        }
        if verdict == Verdict::Stop {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
