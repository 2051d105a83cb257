//! The router
//!
//! Central worker of the system. It declares the whole topology, runs every
//! configured processor on the incoming and outgoing queues, relays outgoing
//! messages to the queue of their transport, replays the queued log and
//! keeps the transport daemons running.
//!
//! Callbacks on `outgoing_messages` run in this order:
//!
//! ```text
//! processor 1 .. processor N -> relay to {channel_name}_transport
//! ```
//!
//! The relay always comes last, so a processor returning [`Verdict::Stop`]
//! keeps a message from ever reaching a transport.

use std::fmt;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info};

use crate::broker::Delivery;
use crate::broker::topology::{
    DEAD_LETTER, EXCHANGE, Exchange, INCOMING_MESSAGES, LOGS, OUTGOING_MESSAGES, Queue,
    transport_queue,
};
use crate::config::{DeadLetterPolicy, Settings};
use crate::message::{DEFAULT_CHANNEL, IncomingMessage, OutgoingMessage};
use crate::processor::MessageProcessor;
use crate::registry::Registry;
use crate::transport::TransportDaemons;
use crate::utils::error::{MessageError, WorkerError};
use crate::worker::{Consumer, LogRecord, Verdict, Worker, WorkerCore, standard};

/// Broker poll timeout of the router loop.
pub const ROUTER_TIMEOUT: Duration = Duration::from_secs(1);

const SUPERVISION_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterCallback {
    /// `on_receive_message` of the processor at this index.
    ProcessIncoming(usize),
    /// `on_send_message` of the processor at this index.
    ProcessOutgoing(usize),
    Relay,
    ReplayLog,
    DeadLetter,
}

struct NamedProcessor {
    name: String,
    processor: Box<dyn MessageProcessor>,
}

pub struct Router {
    core: WorkerCore<RouterCallback>,
    processors: Vec<NamedProcessor>,
    transports: Vec<String>,
    dead_letter_policy: DeadLetterPolicy,
    daemons: Vec<TransportDaemons>,
    last_supervision: Option<Instant>,
}

impl Router {
    /// Build the router and its processors. Every processor and transport
    /// backend named by `settings` must be registered.
    pub fn new(settings: &Settings, registry: &Registry) -> Result<Self, WorkerError> {
        registry.validate(settings)?;

        let mut processors = Vec::with_capacity(settings.message_processors.len());
        for name in &settings.message_processors {
            processors.push(NamedProcessor {
                name: name.clone(),
                processor: registry.processor(name, settings)?,
            });
        }

        let mut daemons = Vec::new();
        if settings.supervise_transports {
            for (name, transport) in &settings.message_transports {
                if transport.autostart {
                    daemons.push(TransportDaemons::new(settings, name)?);
                }
            }
        }

        Ok(Self {
            core: WorkerCore::new("router", settings),
            processors,
            transports: settings.message_transports.keys().cloned().collect(),
            dead_letter_policy: settings.dead_letter_policy,
            daemons,
            last_supervision: None,
        })
    }

    /// Supervise these daemons instead of the ones built from the settings.
    pub fn supervise(mut self, daemons: Vec<TransportDaemons>) -> Self {
        self.daemons = daemons;
        self
    }

    /// Names of the configured transports.
    pub fn transports(&self) -> &[String] {
        &self.transports
    }

    pub fn daemons(&mut self) -> &mut [TransportDaemons] {
        &mut self.daemons
    }

    /// [`Worker::stop`], then stop every supervised daemon.
    pub fn stop(&mut self) {
        Worker::stop(self);
        self.stop_daemons();
    }

    /// Start the daemons that are not running. Failures are logged and the
    /// router keeps running.
    pub fn start_daemons(&mut self) {
        for daemons in &mut self.daemons {
            match daemons.start() {
                Ok(0) => {}
                Ok(started) => info!(
                    "Started {started} daemon(s) of transport '{}'",
                    daemons.name()
                ),
                Err(e) => error!("Cannot start transport '{}': {e}", daemons.name()),
            }
        }
    }

    pub fn stop_daemons(&mut self) {
        for daemons in &mut self.daemons {
            match daemons.stop() {
                Ok(0) => {}
                Ok(stopped) => info!(
                    "Stopped {stopped} daemon(s) of transport '{}'",
                    daemons.name()
                ),
                Err(e) => error!("Cannot stop transport '{}': {e}", daemons.name()),
            }
        }
    }

    fn process_incoming(&mut self, index: usize, delivery: &Delivery) -> Result<Verdict, WorkerError> {
        let message = IncomingMessage::from_wire(&delivery.body)?;
        let Some(entry) = self.processors.get_mut(index) else {
            return Ok(Verdict::Pass);
        };
        let mut producer = self.core.producer()?;
        entry
            .processor
            .on_receive_message(&message, &mut producer)
            .map_err(|e| WorkerError::from_handler(&entry.name, e))
    }

    fn process_outgoing(&mut self, index: usize, delivery: &Delivery) -> Result<Verdict, WorkerError> {
        let message = OutgoingMessage::from_wire(&delivery.body)?;
        let Some(entry) = self.processors.get_mut(index) else {
            return Ok(Verdict::Pass);
        };
        let mut producer = self.core.producer()?;
        entry
            .processor
            .on_send_message(&message, &mut producer)
            .map_err(|e| WorkerError::from_handler(&entry.name, e))
    }

    /// Republish the body verbatim to the queue of the transport it names.
    fn relay_to_transport(&mut self, delivery: &Delivery) -> Result<Verdict, WorkerError> {
        let channel = delivery
            .body
            .get("channel_name")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_CHANNEL);
        let routing_key = transport_queue(channel);

        self.core
            .producer()?
            .publish(&routing_key, delivery.body.clone())?;
        debug!("Relayed outgoing message to '{routing_key}'");
        Ok(Verdict::Handled)
    }

    fn replay_log(&mut self, delivery: &Delivery) -> Result<Verdict, WorkerError> {
        let record: LogRecord =
            serde_json::from_value(delivery.body.clone()).map_err(MessageError::from)?;
        record.emit();
        Ok(Verdict::Handled)
    }

    fn handle_dead_letter(&mut self, delivery: &Delivery) -> Result<Verdict, WorkerError> {
        let routing_key = delivery
            .original_routing_key
            .as_deref()
            .unwrap_or(&delivery.routing_key);
        error!(
            "Unable to deliver a message routed to '{routing_key}': no queue is bound to it, \
             check message_transports"
        );

        match self.dead_letter_policy {
            DeadLetterPolicy::Log => Ok(Verdict::Handled),
            DeadLetterPolicy::Fatal => {
                self.core.ack(delivery.delivery_tag)?;
                Err(WorkerError::Undeliverable {
                    routing_key: routing_key.to_string(),
                })
            }
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let processors: Vec<&str> = self.processors.iter().map(|p| p.name.as_str()).collect();
        f.debug_struct("Router")
            .field("processors", &processors)
            .field("transports", &self.transports)
            .field("dead_letter_policy", &self.dead_letter_policy)
            .field("daemons", &self.daemons)
            .finish_non_exhaustive()
    }
}

impl Worker for Router {
    type Callback = RouterCallback;

    fn core(&self) -> &WorkerCore<RouterCallback> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WorkerCore<RouterCallback> {
        &mut self.core
    }

    fn exchanges(&self) -> Vec<Exchange> {
        standard::exchanges(self.core.persistent())
    }

    fn queues(&self) -> Vec<Queue> {
        let durable = self.core.persistent();
        let mut queues = standard::queues(durable);
        queues.push(standard::message_queue(INCOMING_MESSAGES, durable));
        queues.push(standard::message_queue(OUTGOING_MESSAGES, durable));
        for name in &self.transports {
            queues.push(Queue::bound(&transport_queue(name), EXCHANGE, false));
        }
        queues
    }

    fn consumers(&self) -> Vec<Consumer<RouterCallback>> {
        let count = self.processors.len();
        let incoming = (0..count).map(RouterCallback::ProcessIncoming).collect();
        let mut outgoing: Vec<_> = (0..count).map(RouterCallback::ProcessOutgoing).collect();
        outgoing.push(RouterCallback::Relay);

        vec![
            Consumer::new(INCOMING_MESSAGES, incoming),
            Consumer::new(OUTGOING_MESSAGES, outgoing),
            Consumer::new(LOGS, vec![RouterCallback::ReplayLog]),
            Consumer::new(DEAD_LETTER, vec![RouterCallback::DeadLetter]),
        ]
    }

    fn handle(
        &mut self,
        callback: &RouterCallback,
        delivery: &Delivery,
    ) -> Result<Verdict, WorkerError> {
        match *callback {
            RouterCallback::ProcessIncoming(index) => self.process_incoming(index, delivery),
            RouterCallback::ProcessOutgoing(index) => self.process_outgoing(index, delivery),
            RouterCallback::Relay => self.relay_to_transport(delivery),
            RouterCallback::ReplayLog => self.replay_log(delivery),
            RouterCallback::DeadLetter => self.handle_dead_letter(delivery),
        }
    }

    fn on_worker_connected(&mut self) -> Result<(), WorkerError> {
        info!(
            "Router connected: {} processor(s), transports {:?}",
            self.processors.len(),
            self.transports
        );
        Ok(())
    }

    fn on_tick(&mut self) -> Result<(), WorkerError> {
        if self.daemons.is_empty() {
            return Ok(());
        }
        if self
            .last_supervision
            .is_some_and(|at| at.elapsed() < SUPERVISION_INTERVAL)
        {
            return Ok(());
        }
        self.last_supervision = Some(Instant::now());
        self.start_daemons();
        Ok(())
    }

    fn on_worker_stopped(&mut self) -> Result<(), WorkerError> {
        self.stop_daemons();
        Ok(())
    }
}
