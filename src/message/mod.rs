//! Message envelopes exchanged between transports, processors and the router.
//!
//! A message is identified by an id generated once at construction. Two
//! messages with the same id are the same logical message, whatever their
//! other fields say, so mutating a message after construction is
//! discouraged.
//!
//! On the wire every message is a flat JSON object holding each field, with
//! dates rendered by [`dates::DATE_FORMAT`].

pub mod dates;

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::broker::topology::{INCOMING_MESSAGES, OUTGOING_MESSAGES};
use crate::utils::error::{MessageError, WorkerError};
use crate::worker::Producer;

/// Channel used when a message does not name one.
pub const DEFAULT_CHANNEL: &str = "default";

fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

/// Fields shared by incoming and outgoing messages.
pub trait Message {
    fn id(&self) -> &str;
    fn text(&self) -> &str;
    /// Name of the transport this message travels through.
    fn channel_name(&self) -> &str;
}

/// A message received by a transport, waiting to be processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    #[serde(default = "generate_id")]
    id: String,
    pub author: String,
    pub text: String,
    #[serde(default = "default_channel")]
    pub channel_name: String,
    #[serde(with = "dates", default = "dates::now")]
    pub reception_date: NaiveDateTime,
}

impl IncomingMessage {
    pub fn new(author: impl Into<String>, text: impl Into<String>) -> Self {
        Self::with_id(generate_id(), author, text)
    }

    /// Build a message under an existing id, e.g. one known elsewhere.
    pub fn with_id(
        id: impl Into<String>,
        author: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            text: text.into(),
            channel_name: default_channel(),
            reception_date: dates::now(),
        }
    }

    pub fn on_channel(mut self, channel_name: impl Into<String>) -> Self {
        self.channel_name = channel_name.into();
        self
    }

    pub fn received_at(mut self, date: NaiveDateTime) -> Self {
        self.reception_date = date;
        self
    }

    /// Flat JSON mapping of every field, as published on the queues.
    pub fn to_wire(&self) -> Result<Value, MessageError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild a message from its wire mapping. Missing ids are generated,
    /// missing dates default to now and a missing channel to `default`.
    pub fn from_wire(body: &Value) -> Result<Self, MessageError> {
        Ok(serde_json::from_value(body.clone())?)
    }

    /// Build a reply addressed to the author, on the same channel.
    pub fn create_response(&self, text: impl Into<String>) -> OutgoingMessage {
        OutgoingMessage::new(self.author.clone(), text)
            .on_channel(self.channel_name.clone())
            .in_response_to(self.clone())
    }

    /// Build a reply with [`create_response`](Self::create_response), send it
    /// and return it.
    pub fn respond(
        &self,
        text: impl Into<String>,
        producer: &mut Producer<'_>,
    ) -> Result<OutgoingMessage, WorkerError> {
        let response = self.create_response(text);
        response.send(producer)?;
        Ok(response)
    }

    /// Stack the message in the incoming message queue.
    pub fn dispatch(&self, producer: &mut Producer<'_>) -> Result<(), WorkerError> {
        producer.publish(INCOMING_MESSAGES, self.to_wire()?)?;
        Ok(())
    }
}

/// A message to be delivered by a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    #[serde(default = "generate_id")]
    id: String,
    pub recipient: String,
    pub text: String,
    #[serde(default = "default_channel")]
    pub channel_name: String,
    #[serde(with = "dates", default = "dates::now")]
    pub creation_date: NaiveDateTime,
    #[serde(default)]
    pub response_to: Option<Box<IncomingMessage>>,
}

impl OutgoingMessage {
    pub fn new(recipient: impl Into<String>, text: impl Into<String>) -> Self {
        Self::with_id(generate_id(), recipient, text)
    }

    pub fn with_id(
        id: impl Into<String>,
        recipient: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            recipient: recipient.into(),
            text: text.into(),
            channel_name: default_channel(),
            creation_date: dates::now(),
            response_to: None,
        }
    }

    pub fn on_channel(mut self, channel_name: impl Into<String>) -> Self {
        self.channel_name = channel_name.into();
        self
    }

    pub fn created_at(mut self, date: NaiveDateTime) -> Self {
        self.creation_date = date;
        self
    }

    pub fn in_response_to(mut self, message: IncomingMessage) -> Self {
        self.response_to = Some(Box::new(message));
        self
    }

    /// Flat JSON mapping; `response_to` nests the original message or is
    /// `null`.
    pub fn to_wire(&self) -> Result<Value, MessageError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_wire(body: &Value) -> Result<Self, MessageError> {
        Ok(serde_json::from_value(body.clone())?)
    }

    /// Stack the message in the outgoing message queue.
    pub fn send(&self, producer: &mut Producer<'_>) -> Result<(), WorkerError> {
        producer.publish(OUTGOING_MESSAGES, self.to_wire()?)?;
        Ok(())
    }
}

impl Message for IncomingMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn channel_name(&self) -> &str {
        &self.channel_name
    }
}

impl Message for OutgoingMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn channel_name(&self) -> &str {
        &self.channel_name
    }
}

impl PartialEq for IncomingMessage {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for IncomingMessage {}

impl Hash for IncomingMessage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialEq for OutgoingMessage {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for OutgoingMessage {}

impl Hash for OutgoingMessage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "From {}: {}", self.author, self.text)
    }
}

impl fmt::Display for OutgoingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "To {}: {}", self.recipient, self.text)
    }
}

#[cfg(test)]
mod tests;
