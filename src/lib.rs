//! # textroute
//!
//! `textroute` routes short text messages between transports (SMS modems,
//! gateways, a console) and a chain of message processors, through a
//! message broker.
//!
//! ```text
//! transport (receive) -> incoming_messages -> router: processors
//!                                                  |
//! transport (send) <- {name}_transport <- router: relay <- outgoing_messages
//! ```
//!
//! ## Core Modules
//!
//! - `broker`: the queue engine, its topology and the synchronous `Connection`.
//! - `config`: settings loading.
//! - `message`: incoming and outgoing messages and their wire format.
//! - `persistence`: sled storage behind durable queues.
//! - `processor`: the `MessageProcessor` contract and the built-in processors.
//! - `registry`: processor and transport backend constructors by name.
//! - `remote`: the WebSocket broker server and its client.
//! - `router`: the central worker.
//! - `transport`: transport workers, backends and daemon processes.
//! - `utils`: errors and logging.
//! - `worker`: the worker lifecycle shared by every participant.

pub mod broker;
pub mod config;
pub mod message;
pub mod persistence;
pub mod processor;
pub mod registry;
pub mod remote;
pub mod router;
pub mod transport;
pub mod utils;
pub mod worker;
