//! Message processors
//!
//! A processor reacts to every message going through the router: once per
//! incoming message and once per outgoing message, before the outgoing
//! message is relayed to its transport. The [`Verdict`] it returns decides
//! whether the delivery is acknowledged.

mod builtins;

use crate::message::{IncomingMessage, OutgoingMessage};
use crate::utils::error::HandlerError;
use crate::worker::{Producer, Verdict};

pub use builtins::{EchoProcessor, LoggerProcessor};

/// Pluggable reactor registered on the router's incoming and outgoing
/// consumers. Both hooks default to [`Verdict::Pass`].
///
/// Hooks run synchronously inside the router loop and must not block.
pub trait MessageProcessor: Send {
    fn on_receive_message(
        &mut self,
        _message: &IncomingMessage,
        _producer: &mut Producer<'_>,
    ) -> Result<Verdict, HandlerError> {
        Ok(Verdict::Pass)
    }

    fn on_send_message(
        &mut self,
        _message: &OutgoingMessage,
        _producer: &mut Producer<'_>,
    ) -> Result<Verdict, HandlerError> {
        Ok(Verdict::Pass)
    }
}
