//! The broker layer: topology descriptors, the routing engine and the
//! connections workers use to reach it.
//!
//! Public types:
//! - `Engine` / `SharedEngine`: queues, routing, acknowledgements.
//! - `Connection`: one worker's handle on a broker, in-process or remote.
//! - `Delivery`: a message handed to a consumer.

pub mod connection;
pub mod delivery;
pub mod engine;
pub mod memory;
pub mod topology;

pub use connection::Connection;
pub use delivery::Delivery;
pub use engine::{Engine, SharedEngine};
