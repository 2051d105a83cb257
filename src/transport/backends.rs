//! Transports shipped with the router.

use std::io::{self, BufRead};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{Level, info};

use crate::config::TransportSettings;
use crate::message::OutgoingMessage;
use crate::utils::error::{HandlerError, SettingsError};
use crate::worker::{Producer, Verdict};

use super::{Inbox, TRANSPORT_TIMEOUT, TransportBackend};

/// Deserialize the `options` table of transport `name`.
pub fn parse_options<T: DeserializeOwned>(
    name: &str,
    options: &Map<String, Value>,
) -> Result<T, SettingsError> {
    serde_json::from_value(Value::Object(options.clone())).map_err(|source| {
        SettingsError::InvalidOptions {
            name: name.to_string(),
            source,
        }
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DummyOptions {
    /// What the receive loop pretends to be doing.
    pub activity: String,
    /// Delay between two heartbeats of the receive loop.
    pub interval_ms: u64,
}

impl Default for DummyOptions {
    fn default() -> Self {
        Self {
            activity: "foo".to_string(),
            interval_ms: 1000,
        }
    }
}

/// Accepts every outgoing message without sending it anywhere.
#[derive(Debug, Default)]
pub struct DummyTransport {
    options: DummyOptions,
}

impl DummyTransport {
    pub fn new(options: DummyOptions) -> Self {
        Self { options }
    }

    pub fn from_settings(name: &str, transport: &TransportSettings) -> Result<Self, SettingsError> {
        Ok(Self::new(parse_options(name, &transport.options)?))
    }
}

impl TransportBackend for DummyTransport {
    fn on_send_message(
        &mut self,
        message: &OutgoingMessage,
        _producer: &mut Producer<'_>,
    ) -> Result<Verdict, HandlerError> {
        info!("Sending {message}");
        Ok(Verdict::Handled)
    }

    fn start_incoming_messages_loop(&mut self, inbox: &mut Inbox<'_>) -> Result<(), HandlerError> {
        let interval = Duration::from_millis(self.options.interval_ms);
        while inbox.is_running() {
            inbox.log(Level::INFO, format!("Doing '{}'", self.options.activity));
            if !inbox.idle(interval) {
                break;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CmdOptions {
    /// Author of the messages typed on the console.
    pub phone_number: String,
}

impl Default for CmdOptions {
    fn default() -> Self {
        Self {
            phone_number: "+0000000000".to_string(),
        }
    }
}

/// Console transport: prints outgoing messages, reads incoming ones from
/// standard input, one per line.
pub struct CmdTransport {
    options: CmdOptions,
    input: Option<Box<dyn BufRead + Send>>,
}

impl CmdTransport {
    pub fn new(options: CmdOptions) -> Self {
        Self {
            options,
            input: None,
        }
    }

    pub fn from_settings(name: &str, transport: &TransportSettings) -> Result<Self, SettingsError> {
        Ok(Self::new(parse_options(name, &transport.options)?))
    }

    /// Read incoming messages from `input` instead of stdin.
    pub fn with_input(mut self, input: impl BufRead + Send + 'static) -> Self {
        self.input = Some(Box::new(input));
        self
    }
}

impl std::fmt::Debug for CmdTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmdTransport")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl TransportBackend for CmdTransport {
    fn on_send_message(
        &mut self,
        message: &OutgoingMessage,
        _producer: &mut Producer<'_>,
    ) -> Result<Verdict, HandlerError> {
        println!("{} <<< {}", message.recipient, message.text);
        Ok(Verdict::Handled)
    }

    fn start_incoming_messages_loop(&mut self, inbox: &mut Inbox<'_>) -> Result<(), HandlerError> {
        let input: Box<dyn BufRead + Send> = match self.input.take() {
            Some(input) => input,
            None => Box::new(io::BufReader::new(io::stdin())),
        };

        // Lines are read on their own thread and polled here.
        let (lines, received) = mpsc::channel();
        thread::Builder::new()
            .name("cmd-input".to_string())
            .spawn(move || {
                for line in input.lines() {
                    let Ok(line) = line else { break };
                    if lines.send(line).is_err() {
                        break;
                    }
                }
            })?;

        let listening = format!(
            "Transport \"{}\" reads incoming messages from the console",
            inbox.transport()
        );
        inbox.log(Level::INFO, listening);

        while inbox.is_running() {
            match received.recv_timeout(TRANSPORT_TIMEOUT) {
                Ok(line) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    let message = inbox.dispatch(self.options.phone_number.clone(), text)?;
                    println!("{} >>> {}", message.author, message.text);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }
}
