//! Error types used across `textroute`.
//!
//! Each layer owns one enum. Broker errors are fatal to the worker loop that
//! hit them; handler errors are local to a single delivery; settings errors
//! are fatal at startup.

use thiserror::Error;

/// Error returned by a processor or transport hook.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Failures of the broker connection or of the broker itself.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Nothing arrived before the drain timeout elapsed.
    #[error("timed out waiting for broker events")]
    Timeout,

    #[error("cannot connect to broker: {0}")]
    Connection(String),

    #[error("unsupported broker transport '{0}'")]
    UnsupportedTransport(String),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),

    #[error("broker protocol error: {0}")]
    Protocol(String),

    #[error("cannot encode or decode broker frame: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("queue '{0}' is not declared")]
    UnknownQueue(String),

    #[error("exchange '{0}' is not declared")]
    UnknownExchange(String),

    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("connection closed")]
    Closed,
}

impl BrokerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::Timeout)
    }
}

impl From<tungstenite::Error> for BrokerError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(io) => BrokerError::Io(io),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                BrokerError::Closed
            }
            other => BrokerError::WebSocket(Box::new(other)),
        }
    }
}

/// Failures of a worker's lifecycle.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("queues are not bound: start the worker or call connect() first")]
    NotBound,

    #[error("callback '{callback}' failed: {reason}")]
    Handler { callback: String, reason: String },

    #[error("message routed to '{routing_key}' has no queue bound to it")]
    Undeliverable { routing_key: String },

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl WorkerError {
    pub fn is_broker(&self) -> bool {
        matches!(self, WorkerError::Broker(_))
    }

    /// Errors that concern one delivery only and must not stop the loop.
    pub fn is_handler(&self) -> bool {
        matches!(self, WorkerError::Handler { .. } | WorkerError::Message(_))
    }

    /// Classify an error returned by a processor or transport hook. Broker
    /// failures raised from inside the hook keep their identity so they stay
    /// fatal; anything else becomes [`WorkerError::Handler`].
    pub fn from_handler(callback: &str, err: HandlerError) -> Self {
        let err = match err.downcast::<BrokerError>() {
            Ok(broker) => return WorkerError::Broker(*broker),
            Err(err) => err,
        };
        let reason = match err.downcast::<WorkerError>() {
            Ok(worker) if !worker.is_handler() => return *worker,
            Ok(worker) => worker.to_string(),
            Err(err) => err.to_string(),
        };
        WorkerError::Handler {
            callback: callback.to_string(),
            reason,
        }
    }
}

/// Failures to encode or decode a wire message.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed message body: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid date '{0}'")]
    Date(String),
}

/// Configuration problems, fatal at startup.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("no message processor registered under '{0}'")]
    UnknownProcessor(String),

    #[error("transport '{name}' uses unregistered backend '{backend}'")]
    UnknownBackend { name: String, backend: String },

    #[error("unable to find message transport named '{0}', check message_transports")]
    UnknownTransport(String),

    #[error("invalid options for '{name}': {source}")]
    InvalidOptions {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures managing transport daemon processes.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot spawn daemon '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown purpose '{0}', expected send_messages or receive_messages")]
    UnknownPurpose(String),

    #[error("unknown action '{0}', expected start, stop, restart or run")]
    UnknownAction(String),

    #[error("cannot signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}
