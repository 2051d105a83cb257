use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::utils::error::SettingsError;

/// Top-level configuration settings for the application.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Durability of the message and dead-letter queues. The log queue and
    /// the transport relay queues are never durable.
    pub persistent_message_queues: bool,
    pub message_broker: BrokerSettings,
    /// Registry names of the processors, in the order their callbacks run.
    pub message_processors: Vec<String>,
    pub message_transports: BTreeMap<String, TransportSettings>,
    pub dead_letter_policy: DeadLetterPolicy,
    /// Where daemon pid and stdio files live.
    pub process_dir: PathBuf,
    pub log_level: String,
    pub broker_server: BrokerServerSettings,
    /// Whether the router keeps transport daemons running.
    pub supervise_transports: bool,
    /// File the settings were loaded from, handed over to transport daemons.
    pub source: Option<PathBuf>,
}

/// Broker connection descriptor: a transport name plus its options.
///
/// `memory` reads `virtual_host`, `ws` reads `url`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub transport: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TransportSettings {
    pub backend: String,
    #[serde(default)]
    pub options: Map<String, Value>,
    /// Started and stopped along with the router.
    #[serde(default = "default_true")]
    pub autostart: bool,
}

/// What the router does with a message nobody could route.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterPolicy {
    /// Log it and keep running.
    #[default]
    Log,
    /// Log it and stop the router.
    Fatal,
}

/// Settings of the bundled WebSocket broker server.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerServerSettings {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Zero disables the redelivery of stale deliveries.
    pub ack_timeout_secs: u64,
    pub max_redeliveries: u8,
}

impl BrokerServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl TransportSettings {
    pub fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
            options: Map::new(),
            autostart: true,
        }
    }
}

impl Settings {
    pub fn transport(&self, name: &str) -> Result<&TransportSettings, SettingsError> {
        self.message_transports
            .get(name)
            .ok_or_else(|| SettingsError::UnknownTransport(name.to_string()))
    }

    /// Settings sharing an in-memory virtual host, isolated from every
    /// other one in the process. Transport daemons are not supervised.
    pub fn isolated(virtual_host: &str) -> Self {
        let mut settings = Self {
            supervise_transports: false,
            ..Self::default()
        };
        settings
            .message_broker
            .options
            .insert("virtual_host".into(), Value::from(virtual_host));
        settings
    }
}

fn default_true() -> bool {
    true
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub persistent_message_queues: Option<bool>,
    pub message_broker: Option<PartialBrokerSettings>,
    pub message_processors: Option<Vec<String>>,
    pub message_transports: Option<BTreeMap<String, TransportSettings>>,
    pub dead_letter_policy: Option<DeadLetterPolicy>,
    pub process_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub broker_server: Option<PartialBrokerServerSettings>,
    pub supervise_transports: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub transport: Option<String>,
    pub options: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub ack_timeout_secs: Option<u64>,
    pub max_redeliveries: Option<u8>,
}

impl PartialSettings {
    /// Fill every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let broker = self.message_broker;
        let server = self.broker_server;

        Settings {
            persistent_message_queues: self
                .persistent_message_queues
                .unwrap_or(default.persistent_message_queues),
            message_broker: BrokerSettings {
                transport: broker
                    .as_ref()
                    .and_then(|b| b.transport.clone())
                    .unwrap_or(default.message_broker.transport),
                options: broker
                    .and_then(|b| b.options)
                    .unwrap_or(default.message_broker.options),
            },
            message_processors: self
                .message_processors
                .unwrap_or(default.message_processors),
            message_transports: self
                .message_transports
                .unwrap_or(default.message_transports),
            dead_letter_policy: self
                .dead_letter_policy
                .unwrap_or(default.dead_letter_policy),
            process_dir: self.process_dir.unwrap_or(default.process_dir),
            log_level: self.log_level.unwrap_or(default.log_level),
            broker_server: BrokerServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.broker_server.host),
                port: server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(default.broker_server.port),
                data_dir: server
                    .as_ref()
                    .and_then(|s| s.data_dir.clone())
                    .unwrap_or(default.broker_server.data_dir),
                ack_timeout_secs: server
                    .as_ref()
                    .and_then(|s| s.ack_timeout_secs)
                    .unwrap_or(default.broker_server.ack_timeout_secs),
                max_redeliveries: server
                    .as_ref()
                    .and_then(|s| s.max_redeliveries)
                    .unwrap_or(default.broker_server.max_redeliveries),
            },
            supervise_transports: self
                .supervise_transports
                .unwrap_or(default.supervise_transports),
            source: default.source,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        let mut message_transports = BTreeMap::new();
        message_transports.insert("default".to_string(), TransportSettings::new("dummy"));

        Self {
            persistent_message_queues: true,
            message_broker: BrokerSettings {
                transport: "memory".to_string(),
                options: Map::new(),
            },
            message_processors: vec!["logger".to_string(), "echo".to_string()],
            message_transports,
            dead_letter_policy: DeadLetterPolicy::Log,
            process_dir: std::env::temp_dir().join("textroute").join("transports"),
            log_level: "info".to_string(),
            broker_server: BrokerServerSettings {
                host: "127.0.0.1".to_string(),
                port: 5673,
                data_dir: PathBuf::from("data/broker"),
                ack_timeout_secs: 0,
                max_redeliveries: 5,
            },
            supervise_transports: true,
            source: None,
        }
    }
}
