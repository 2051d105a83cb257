//! Shared building blocks used by every process in the system: the error
//! types of each layer and the tracing initialisation.

pub mod error;
pub mod logging;
