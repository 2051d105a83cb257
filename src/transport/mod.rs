//! Message transports
//!
//! A transport bridges the internal message model and one external channel
//! (a modem, a gateway, the console). Every configured transport runs as two
//! independent processes, one per [`Purpose`]:
//!
//! - `send_messages` consumes `{name}_transport` and hands each outgoing
//!   message to [`TransportBackend::on_send_message`], acknowledging it only
//!   if the backend reports it delivered;
//! - `receive_messages` runs [`TransportBackend::start_incoming_messages_loop`],
//!   which dispatches what the external channel receives to
//!   `incoming_messages`.
//!
//! The two processes share nothing but the broker and their process files,
//! see [`daemon`].

pub mod backends;
pub mod daemon;

use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Map;
use tracing::Level;

use crate::broker::Delivery;
use crate::broker::topology::{EXCHANGE, Exchange, INCOMING_MESSAGES, Queue, transport_queue};
use crate::config::Settings;
use crate::message::{IncomingMessage, OutgoingMessage};
use crate::registry::Registry;
use crate::utils::error::{DaemonError, HandlerError, SettingsError, WorkerError};
use crate::worker::{Consumer, LoopStats, Producer, Verdict, Worker, WorkerCore, standard};

pub use backends::{CmdTransport, DummyTransport};
pub use daemon::{Daemon, TransportDaemons};

/// Broker poll timeout of both transport loops.
pub const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(1);

const IDLE_STEP: Duration = Duration::from_millis(10);

/// Which half of a transport a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    SendMessages,
    ReceiveMessages,
}

impl Purpose {
    pub const ALL: [Purpose; 2] = [Purpose::ReceiveMessages, Purpose::SendMessages];

    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::SendMessages => "send_messages",
            Purpose::ReceiveMessages => "receive_messages",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send_messages" => Ok(Purpose::SendMessages),
            "receive_messages" => Ok(Purpose::ReceiveMessages),
            other => Err(DaemonError::UnknownPurpose(other.to_string())),
        }
    }
}

/// The adapter side of a transport.
///
/// The same backend type is instantiated once in each transport process, so
/// state is never shared between its two hooks.
pub trait TransportBackend: Send {
    /// Deliver one outgoing message. Return [`Verdict::Pass`] when it could
    /// not be delivered: it stays queued and will be retried.
    fn on_send_message(
        &mut self,
        _message: &OutgoingMessage,
        _producer: &mut Producer<'_>,
    ) -> Result<Verdict, HandlerError> {
        Ok(Verdict::Pass)
    }

    /// Watch the external channel and dispatch what it receives, until the
    /// inbox stops running. The default receives nothing and idles.
    fn start_incoming_messages_loop(&mut self, inbox: &mut Inbox<'_>) -> Result<(), HandlerError> {
        let starts = format!(
            "Transport \"{}\" starts listening for incoming messages",
            inbox.transport()
        );
        inbox.log(Level::INFO, starts);
        while inbox.idle(TRANSPORT_TIMEOUT) {}
        let stops = format!(
            "Transport \"{}\" stops listening for incoming messages",
            inbox.transport()
        );
        inbox.log(Level::INFO, stops);
        Ok(())
    }
}

/// Callbacks of a transport worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCallback {
    SendMessage,
}

/// What a receive loop gets to talk to the router.
pub struct Inbox<'a> {
    transport: &'a str,
    core: &'a mut WorkerCore<TransportCallback>,
}

impl<'a> Inbox<'a> {
    pub fn new(transport: &'a str, core: &'a mut WorkerCore<TransportCallback>) -> Self {
        Self { transport, core }
    }

    /// Name of the transport, set as channel of every dispatched message.
    pub fn transport(&self) -> &str {
        self.transport
    }

    /// False once the process was asked to stop.
    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Sleep up to `duration`, waking early on stop. Returns
    /// [`is_running`](Self::is_running).
    pub fn idle(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(IDLE_STEP));
        }
        self.is_running()
    }

    /// Publish a message received from `author` to `incoming_messages`.
    pub fn dispatch(
        &mut self,
        author: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<IncomingMessage, WorkerError> {
        let message = IncomingMessage::new(author, text).on_channel(self.transport);
        message.dispatch(&mut self.core.producer()?)?;
        Ok(message)
    }

    pub fn log(&mut self, level: Level, msg: impl Into<String>) {
        self.core.log(level, msg, Vec::new(), Map::new());
    }
}

/// One half of a configured transport, as a worker.
pub struct MessageTransport {
    core: WorkerCore<TransportCallback>,
    purpose: Purpose,
    backend: Box<dyn TransportBackend>,
    delivery_limit: Option<usize>,
    delivered: usize,
}

impl MessageTransport {
    pub fn new(
        name: &str,
        purpose: Purpose,
        backend: Box<dyn TransportBackend>,
        settings: &Settings,
    ) -> Self {
        Self {
            core: WorkerCore::new(name, settings),
            purpose,
            backend,
            delivery_limit: None,
            delivered: 0,
        }
    }

    /// Build the transport `name` with the backend its settings name.
    pub fn from_settings(
        name: &str,
        purpose: Purpose,
        settings: &Settings,
        registry: &Registry,
    ) -> Result<Self, SettingsError> {
        let backend = registry.backend(name, settings.transport(name)?)?;
        Ok(Self::new(name, purpose, backend, settings))
    }

    /// Stop the send loop once `deliveries` messages were delivered.
    pub fn stop_after(mut self, deliveries: usize) -> Self {
        self.delivery_limit = Some(deliveries);
        self
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    /// Messages delivered so far by the send loop.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Process entry point: run the loop of this transport's purpose.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        match self.purpose {
            Purpose::SendMessages => self
                .start_outgoing_messages_loop(TRANSPORT_TIMEOUT, None)
                .map(|_| ()),
            Purpose::ReceiveMessages => self.start_incoming_messages_loop(),
        }
    }

    /// The regular worker lifecycle over `{name}_transport`. Queued messages
    /// are never purged: they are waiting for this very loop.
    pub fn start_outgoing_messages_loop(
        &mut self,
        timeout: Duration,
        limit: Option<u32>,
    ) -> Result<LoopStats, WorkerError> {
        self.start(timeout, limit, Some(false))
    }

    /// Connect, then hand over to the backend's receive loop.
    pub fn start_incoming_messages_loop(&mut self) -> Result<(), WorkerError> {
        self.connect()?;

        let name = self.core.name().to_string();
        let received = {
            let mut inbox = Inbox::new(&name, &mut self.core);
            self.backend.start_incoming_messages_loop(&mut inbox)
        };
        let released = self.release();

        received.map_err(|e| WorkerError::from_handler("start_incoming_messages_loop", e))?;
        released
    }

    /// Simulate the reception of `text` from `author` on this transport,
    /// then run the send loop until the first reply is delivered or five
    /// idle seconds went by.
    pub fn fake_sms_reception(&mut self, author: &str, text: &str) -> Result<LoopStats, WorkerError> {
        self.delivery_limit = Some(1);
        self.connect()?;

        let message = IncomingMessage::new(author, text).on_channel(self.core.name());
        println!("{} >>> {}", message.author, message.text);
        message.dispatch(&mut self.core.producer()?)?;

        self.start_outgoing_messages_loop(TRANSPORT_TIMEOUT, Some(5))
    }
}

impl fmt::Debug for MessageTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTransport")
            .field("name", &self.core.name())
            .field("purpose", &self.purpose)
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}

impl Worker for MessageTransport {
    type Callback = TransportCallback;

    fn core(&self) -> &WorkerCore<TransportCallback> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WorkerCore<TransportCallback> {
        &mut self.core
    }

    fn exchanges(&self) -> Vec<Exchange> {
        standard::exchanges(self.core.persistent())
    }

    fn queues(&self) -> Vec<Queue> {
        let durable = self.core.persistent();
        let mut queues = standard::queues(durable);
        queues.push(standard::message_queue(INCOMING_MESSAGES, durable));
        queues.push(Queue::bound(
            &transport_queue(self.core.name()),
            EXCHANGE,
            false,
        ));
        queues
    }

    fn consumers(&self) -> Vec<Consumer<TransportCallback>> {
        match self.purpose {
            Purpose::SendMessages => vec![Consumer::new(
                transport_queue(self.core.name()),
                vec![TransportCallback::SendMessage],
            )],
            Purpose::ReceiveMessages => Vec::new(),
        }
    }

    fn handle(
        &mut self,
        callback: &TransportCallback,
        delivery: &Delivery,
    ) -> Result<Verdict, WorkerError> {
        match callback {
            TransportCallback::SendMessage => {
                let message = OutgoingMessage::from_wire(&delivery.body)?;
                let verdict = {
                    let mut producer = self.core.producer()?;
                    self.backend.on_send_message(&message, &mut producer)
                }
                .map_err(|e| WorkerError::from_handler("on_send_message", e))?;

                if verdict.acks() {
                    self.delivered += 1;
                    if self.delivery_limit.is_some_and(|limit| self.delivered >= limit) {
                        self.stop();
                    }
                }
                Ok(verdict)
            }
        }
    }
}

#[cfg(test)]
mod tests;
