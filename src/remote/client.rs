//! Blocking client of the WebSocket broker server.
//!
//! Requests are answered in order on the same socket, but deliveries for
//! consumed queues can be pushed at any time, so frames read while waiting
//! for a reply are kept in an inbox and handed out by `drain_events`.

use std::collections::VecDeque;
use std::fmt;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use serde_json::Value;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{WebSocket, connect};

use crate::broker::Delivery;
use crate::broker::topology::{Exchange, Queue};
use crate::remote::protocol::{ClientFrame, Outcome, Request, ServerFrame};
use crate::utils::error::BrokerError;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RemoteChannel {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
    url: String,
    next_id: u64,
    inbox: VecDeque<Delivery>,
}

impl RemoteChannel {
    pub fn connect(url: &str) -> Result<Self, BrokerError> {
        let (socket, _) =
            connect(url).map_err(|e| BrokerError::Connection(format!("{url}: {e}")))?;
        Ok(Self {
            socket,
            url: url.to_string(),
            next_id: 0,
            inbox: VecDeque::new(),
        })
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), BrokerError> {
        // A zero timeout means "block forever" to the socket.
        let timeout = timeout.max(Duration::from_millis(1));
        if let MaybeTlsStream::Plain(stream) = self.socket.get_ref() {
            stream.set_read_timeout(Some(timeout))?;
        }
        Ok(())
    }

    /// Read one server frame, queueing deliveries. Returns the reply if the
    /// frame was one.
    fn read_frame(&mut self) -> Result<Option<(u64, Outcome)>, BrokerError> {
        let msg = match self.socket.read() {
            Ok(msg) => msg,
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                return Err(BrokerError::Timeout);
            }
            Err(e) => return Err(e.into()),
        };
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => return Err(BrokerError::Closed),
            _ => return Ok(None),
        };
        match serde_json::from_str::<ServerFrame>(text.as_str())? {
            ServerFrame::Deliver { delivery } => {
                self.inbox.push_back(delivery);
                Ok(None)
            }
            ServerFrame::Reply { id, outcome } => Ok(Some((id, outcome))),
        }
    }

    fn call(&mut self, request: Request) -> Result<Outcome, BrokerError> {
        self.next_id += 1;
        let id = self.next_id;
        let frame = serde_json::to_string(&ClientFrame { id, request })?;
        self.socket.send(WsMessage::Text(frame.into()))?;

        self.set_read_timeout(REPLY_TIMEOUT)?;
        loop {
            match self.read_frame() {
                Ok(Some((reply_id, outcome))) if reply_id == id => {
                    return match outcome {
                        Outcome::Error { message } => Err(BrokerError::Protocol(message)),
                        outcome => Ok(outcome),
                    };
                }
                Ok(Some((reply_id, _))) => {
                    return Err(BrokerError::Protocol(format!(
                        "expected reply to request {id}, got {reply_id}"
                    )));
                }
                Ok(None) => continue,
                Err(BrokerError::Timeout) => {
                    return Err(BrokerError::Protocol(format!(
                        "no reply to request {id} from {}",
                        self.url
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn call_ok(&mut self, request: Request) -> Result<(), BrokerError> {
        self.call(request).map(|_| ())
    }

    pub fn declare_exchange(&mut self, exchange: &Exchange) -> Result<(), BrokerError> {
        self.call_ok(Request::DeclareExchange {
            exchange: exchange.clone(),
        })
    }

    pub fn declare_queue(&mut self, queue: &Queue) -> Result<(), BrokerError> {
        self.call_ok(Request::DeclareQueue {
            queue: queue.clone(),
        })
    }

    pub fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: Value,
    ) -> Result<(), BrokerError> {
        self.call_ok(Request::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
        })
    }

    pub fn consume(&mut self, queue: &str) -> Result<(), BrokerError> {
        self.call_ok(Request::Consume {
            queue: queue.to_string(),
        })
    }

    pub fn cancel(&mut self, queue: &str) -> Result<(), BrokerError> {
        self.call_ok(Request::Cancel {
            queue: queue.to_string(),
        })
    }

    pub fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.call_ok(Request::Ack { delivery_tag })
    }

    pub fn get(&mut self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        match self.call(Request::Get {
            queue: queue.to_string(),
        })? {
            Outcome::Got { delivery } => Ok(delivery),
            other => Err(BrokerError::Protocol(format!("unexpected reply {other:?}"))),
        }
    }

    /// Deliveries already pushed to this channel are not affected.
    pub fn purge(&mut self, queue: &str) -> Result<usize, BrokerError> {
        match self.call(Request::Purge {
            queue: queue.to_string(),
        })? {
            Outcome::Purged { count } => Ok(count),
            other => Err(BrokerError::Protocol(format!("unexpected reply {other:?}"))),
        }
    }

    pub fn drain_events(&mut self, timeout: Duration) -> Result<Delivery, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.inbox.pop_front() {
                return Ok(delivery);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BrokerError::Timeout);
            }
            self.set_read_timeout(remaining)?;
            if let Some((id, _)) = self.read_frame()? {
                return Err(BrokerError::Protocol(format!("unexpected reply to request {id}")));
            }
        }
    }

    /// Close the socket. The server requeues whatever this channel did not
    /// acknowledge, including deliveries still sitting in the inbox.
    pub fn release(mut self) -> Result<(), BrokerError> {
        self.socket.close(None)?;
        self.set_read_timeout(Duration::from_secs(1))?;
        // Wait for the close handshake to complete.
        while self.socket.read().is_ok() {}
        Ok(())
    }
}

impl fmt::Debug for RemoteChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteChannel")
            .field("url", &self.url)
            .field("next_id", &self.next_id)
            .field("inbox", &self.inbox.len())
            .finish()
    }
}
