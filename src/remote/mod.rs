//! The `remote` module lets processes share one broker over the network.
//!
//! It defines the JSON protocol spoken between broker clients and the
//! broker server, the async WebSocket server owning the engine, and the
//! blocking client used by workers.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::RemoteChannel;
pub use server::{serve, start_broker_server, start_redelivery_loop};
