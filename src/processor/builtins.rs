use crate::message::{IncomingMessage, OutgoingMessage};
use crate::utils::error::HandlerError;
use crate::worker::{Producer, Verdict};

use super::MessageProcessor;

/// Answers `Echo "<text>"` to every incoming message.
#[derive(Debug, Default)]
pub struct EchoProcessor;

impl MessageProcessor for EchoProcessor {
    fn on_receive_message(
        &mut self,
        message: &IncomingMessage,
        producer: &mut Producer<'_>,
    ) -> Result<Verdict, HandlerError> {
        message.respond(format!("Echo \"{}\"", message.text), producer)?;
        Ok(Verdict::Handled)
    }
}

/// Queues an info log line for every message, in both directions.
///
/// Never acknowledges: logging a message does not mean it was handled.
#[derive(Debug, Default)]
pub struct LoggerProcessor;

impl MessageProcessor for LoggerProcessor {
    fn on_receive_message(
        &mut self,
        message: &IncomingMessage,
        producer: &mut Producer<'_>,
    ) -> Result<Verdict, HandlerError> {
        producer.info(message.to_string())?;
        Ok(Verdict::Pass)
    }

    fn on_send_message(
        &mut self,
        message: &OutgoingMessage,
        producer: &mut Producer<'_>,
    ) -> Result<Verdict, HandlerError> {
        producer.info(message.to_string())?;
        Ok(Verdict::Pass)
    }
}
