//! Publishing side of a worker, and the records of the queued log.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{Level, debug, error, info, trace, warn};

use crate::broker::Connection;
use crate::broker::topology::{EXCHANGE, LOGS};
use crate::utils::error::BrokerError;
use crate::utils::logging::parse_level;

/// Publishes on the shared exchange through a worker's connection.
///
/// Handed to processors and transports for the duration of one callback.
pub struct Producer<'a> {
    connection: &'a mut Connection,
    origin: &'a str,
}

impl<'a> Producer<'a> {
    pub fn new(connection: &'a mut Connection, origin: &'a str) -> Self {
        Self { connection, origin }
    }

    /// Name of the worker publishing.
    pub fn origin(&self) -> &str {
        self.origin
    }

    pub fn publish(&mut self, routing_key: &str, body: Value) -> Result<(), BrokerError> {
        self.connection.publish(EXCHANGE, routing_key, body)
    }

    /// Queue a log record for the router to replay.
    pub fn log(
        &mut self,
        level: Level,
        msg: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<(), BrokerError> {
        let record = LogRecord {
            lvl: level.to_string().to_lowercase(),
            msg: msg.into(),
            args,
            kwargs,
            origin: self.origin.to_string(),
        };
        self.publish(LOGS, serde_json::to_value(&record)?)
    }

    pub fn info(&mut self, msg: impl Into<String>) -> Result<(), BrokerError> {
        self.log(Level::INFO, msg, Vec::new(), Map::new())
    }
}

/// A log line travelling through the `logs` queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub lvl: String,
    pub msg: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub origin: String,
}

impl LogRecord {
    pub fn level(&self) -> Level {
        parse_level(&self.lvl)
    }

    /// The message with each `{}` replaced by the next positional argument,
    /// followed by the keyword arguments as `key=value` pairs.
    pub fn render(&self) -> String {
        let mut args = self.args.iter();
        let mut pieces = self.msg.split("{}");
        let mut line = pieces.next().unwrap_or_default().to_string();
        for piece in pieces {
            match args.next() {
                Some(arg) => line.push_str(&display_value(arg)),
                None => line.push_str("{}"),
            }
            line.push_str(piece);
        }
        for (key, value) in &self.kwargs {
            line.push_str(&format!(" {key}={}", display_value(value)));
        }
        line
    }

    /// Send the record to the local tracing subscriber.
    pub fn emit(&self) {
        let line = self.render();
        let origin = self.origin.as_str();
        match self.level() {
            Level::ERROR => error!(origin, "{line}"),
            Level::WARN => warn!(origin, "{line}"),
            Level::INFO => info!(origin, "{line}"),
            Level::DEBUG => debug!(origin, "{line}"),
            _ => trace!(origin, "{line}"),
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
