//! WebSocket broker server
//!
//! Runs one [`SharedEngine`] behind a JSON-over-WebSocket protocol so that
//! separate processes (the router and every transport daemon) share the same
//! queues. Responsibilities:
//! - accept TCP/WebSocket connections and open one engine connection each
//! - answer every [`ClientFrame`] with a [`ServerFrame::Reply`] carrying the
//!   same id
//! - push [`ServerFrame::Deliver`] frames as soon as a consumed queue has a
//!   message for the client
//! - requeue everything a client left unacknowledged when it goes away

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::SharedEngine;
use crate::broker::engine::ConnectionId;
use crate::remote::protocol::{ClientFrame, Outcome, Request, ServerFrame};
use crate::utils::error::BrokerError;

pub async fn start_broker_server(addr: &str, engine: Arc<SharedEngine>) -> Result<(), BrokerError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Broker listening on ws://{}", listener.local_addr()?);
    serve(listener, engine).await;
    Ok(())
}

/// Accept connections on an already bound listener until it fails.
pub async fn serve(listener: TcpListener, engine: Arc<SharedEngine>) {
    while let Ok((stream, peer)) = listener.accept().await {
        let engine = engine.clone();

        spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake error with {peer}: {e}");
                    return;
                }
            };
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
            let session = engine.with(|e| e.open_connection());
            debug!("Session {session} opened for {peer}");

            let cleanup_called = Arc::new(AtomicBool::new(false));
            let do_cleanup = {
                let engine = engine.clone();
                let cleanup_called = cleanup_called.clone();

                move || {
                    if !cleanup_called.swap(true, Ordering::SeqCst) {
                        let requeued = engine.with(|e| e.close_connection(session));
                        debug!("Session {session} closed, {requeued} messages requeued");
                    }
                }
            };

            {
                let do_cleanup = do_cleanup.clone();

                spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        if let Err(e) = ws_sender.send(msg).await {
                            warn!("Failed to send frame to session {session}: {e}");
                            break;
                        }
                    }

                    do_cleanup();
                });
            }

            let pump = spawn(push_deliveries(engine.clone(), session, tx.clone()));

            while let Some(Ok(msg)) = ws_receiver.next().await {
                let text = match msg {
                    WsMessage::Text(text) => text,
                    WsMessage::Close(_) => break,
                    _ => continue,
                };
                let reply = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(frame) => ServerFrame::Reply {
                        id: frame.id,
                        outcome: handle_request(&engine, session, frame.request),
                    },
                    Err(err) => {
                        warn!(
                            "Invalid frame from session {session}: {err} | {}",
                            text.chars().take(100).collect::<String>()
                        );
                        ServerFrame::Reply {
                            id: 0,
                            outcome: Outcome::Error {
                                message: err.to_string(),
                            },
                        }
                    }
                };
                if !send_frame(&tx, &reply) {
                    break;
                }
            }

            pump.abort();
            do_cleanup();
            debug!("Session {session} disconnected");
        });
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<WsMessage>, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => tx.send(WsMessage::Text(text.into())).is_ok(),
        Err(e) => {
            error!("Cannot encode frame: {e}");
            false
        }
    }
}

/// Forward ready messages of the consumed queues to the session, waking up
/// on every engine mutation.
async fn push_deliveries(
    engine: Arc<SharedEngine>,
    session: ConnectionId,
    tx: mpsc::UnboundedSender<WsMessage>,
) {
    loop {
        let notified = engine.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        loop {
            let next = engine.lock().next_delivery(session);
            let Some(delivery) = next else { break };
            if !send_frame(&tx, &ServerFrame::Deliver { delivery }) {
                return;
            }
        }

        notified.await;
    }
}

fn handle_request(engine: &SharedEngine, session: ConnectionId, request: Request) -> Outcome {
    let result = engine.with(|e| match request {
        Request::DeclareExchange { exchange } => {
            e.declare_exchange(exchange);
            Ok(Outcome::Ok)
        }
        Request::DeclareQueue { queue } => e.declare_queue(queue).map(|_| Outcome::Ok),
        Request::Publish {
            exchange,
            routing_key,
            body,
        } => e
            .publish(&exchange, &routing_key, body)
            .map(|_| Outcome::Ok),
        Request::Consume { queue } => e.consume(session, &queue).map(|_| Outcome::Ok),
        Request::Cancel { queue } => {
            e.cancel(session, &queue);
            Ok(Outcome::Ok)
        }
        Request::Ack { delivery_tag } => e.ack(session, delivery_tag).map(|_| Outcome::Ok),
        Request::Get { queue } => e
            .get(session, &queue)
            .map(|delivery| Outcome::Got { delivery }),
        Request::Purge { queue } => e.purge(&queue).map(|count| Outcome::Purged { count }),
    });

    result.unwrap_or_else(|err| Outcome::Error {
        message: err.to_string(),
    })
}

/// Periodically requeue deliveries left unacknowledged for longer than
/// `ack_timeout`.
pub async fn start_redelivery_loop(
    engine: Arc<SharedEngine>,
    ack_timeout: Duration,
    max_redeliveries: u8,
) {
    loop {
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let current_time = chrono::Utc::now().timestamp_millis();
        match engine.with(|e| e.requeue_expired(current_time, ack_timeout, max_redeliveries)) {
            Ok((0, 0)) => {}
            Ok((requeued, dropped)) => {
                info!("Redelivery sweep: {requeued} requeued, {dropped} dead-lettered");
            }
            Err(e) => error!("Redelivery sweep failed: {e}"),
        }
    }
}
