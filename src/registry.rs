//! Name to constructor maps for message processors and transport backends.
//!
//! Settings refer to processors and backends by name; the router and the
//! transport processes look them up here. Names missing from the registry
//! fail when the settings are validated, before anything starts.

use std::collections::HashMap;
use std::fmt;

use crate::config::{Settings, TransportSettings};
use crate::processor::{EchoProcessor, LoggerProcessor, MessageProcessor};
use crate::transport::{CmdTransport, DummyTransport, TransportBackend};
use crate::utils::error::SettingsError;

pub type ProcessorFactory =
    Box<dyn Fn(&Settings) -> Result<Box<dyn MessageProcessor>, SettingsError> + Send + Sync>;

/// Called with the transport name and its settings.
pub type BackendFactory = Box<
    dyn Fn(&str, &TransportSettings) -> Result<Box<dyn TransportBackend>, SettingsError>
        + Send
        + Sync,
>;

#[derive(Default)]
pub struct Registry {
    processors: HashMap<String, ProcessorFactory>,
    backends: HashMap<String, BackendFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processors `echo` and `logger`, backends `dummy` and `cmd`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register_processor("echo", |_| Ok(Box::new(EchoProcessor)))
            .register_processor("logger", |_| Ok(Box::new(LoggerProcessor)))
            .register_backend("dummy", |name, transport| {
                Ok(Box::new(DummyTransport::from_settings(name, transport)?))
            })
            .register_backend("cmd", |name, transport| {
                Ok(Box::new(CmdTransport::from_settings(name, transport)?))
            });
        registry
    }

    pub fn register_processor<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&Settings) -> Result<Box<dyn MessageProcessor>, SettingsError>
            + Send
            + Sync
            + 'static,
    {
        self.processors.insert(name.to_string(), Box::new(factory));
        self
    }

    pub fn register_backend<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&str, &TransportSettings) -> Result<Box<dyn TransportBackend>, SettingsError>
            + Send
            + Sync
            + 'static,
    {
        self.backends.insert(name.to_string(), Box::new(factory));
        self
    }

    pub fn processor(
        &self,
        name: &str,
        settings: &Settings,
    ) -> Result<Box<dyn MessageProcessor>, SettingsError> {
        let factory = self
            .processors
            .get(name)
            .ok_or_else(|| SettingsError::UnknownProcessor(name.to_string()))?;
        factory(settings)
    }

    /// Build the backend of the transport `transport`.
    pub fn backend(
        &self,
        transport: &str,
        settings: &TransportSettings,
    ) -> Result<Box<dyn TransportBackend>, SettingsError> {
        let factory =
            self.backends
                .get(&settings.backend)
                .ok_or_else(|| SettingsError::UnknownBackend {
                    name: transport.to_string(),
                    backend: settings.backend.clone(),
                })?;
        factory(transport, settings)
    }

    /// Check that every processor and backend the settings name is
    /// registered, and that every backend accepts its options.
    pub fn validate(&self, settings: &Settings) -> Result<(), SettingsError> {
        for name in &settings.message_processors {
            if !self.processors.contains_key(name) {
                return Err(SettingsError::UnknownProcessor(name.clone()));
            }
        }
        for (name, transport) in &settings.message_transports {
            self.backend(name, transport)?;
        }
        Ok(())
    }

    fn names<V>(map: &HashMap<String, V>) -> Vec<&str> {
        let mut names: Vec<&str> = map.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("processors", &Self::names(&self.processors))
            .field("backends", &Self::names(&self.backends))
            .finish()
    }
}
