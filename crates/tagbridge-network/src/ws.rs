//! WebSocket event channel.
//!
//! Each connection is one distributor subscriber. Three tasks serve it:
//!
//! - a writer owning the sink half, fed through a bounded queue,
//! - a forwarder copying subscription messages into that queue,
//! - a keep-alive pinger.
//!
//! The receive loop answers control messages on the same queue, so replies
//! and broadcasts share one ordered outgoing stream. When the distributor
//! drops the subscription (lagging or shutdown) the connection is closed.

use crate::control;
use crate::distributor::SubscriberId;
use crate::routes::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tagbridge_protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

pub const INVALID_MESSAGE: &str = "invalid message";

const OUTGOING_QUEUE: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub(crate) async fn upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, origin))
}

async fn handle_socket(socket: WebSocket, state: AppState, origin: Option<String>) {
    let mut subscription = match state.distributor.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(error = %e, "Rejecting event channel connection");
            return;
        }
    };
    let id = subscription.id();
    info!(subscriber = id, origin = origin.as_deref().unwrap_or("-"), "Event channel opened");

    let (mut sender, mut receiver) = socket.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(OUTGOING_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let forward_tx = outgoing_tx.clone();
    let mut forwarder = tokio::spawn(async move {
        while let Some(message) = subscription.recv().await {
            if send(&forward_tx, &message).await.is_err() {
                break;
            }
        }
    });

    let ping_tx = outgoing_tx.clone();
    let ping_every = state.config.ping_interval();
    let pinger = tokio::spawn(async move {
        let mut ticker = interval(ping_every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if ping_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut forwarder => {
                debug!(subscriber = id, "Subscription ended");
                break;
            }
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Some(reply) = handle_text(&state, id, origin.as_deref(), text.as_str()).await else {
                        continue;
                    };
                    if send(&outgoing_tx, &reply).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!(subscriber = id, "Binary frame rejected");
                    if send(&outgoing_tx, &ServerMessage::error(INVALID_MESSAGE)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = outgoing_tx.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    debug!(subscriber = id, "Client closed the channel");
                    break;
                }
                Some(Err(e)) => {
                    debug!(subscriber = id, error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    pinger.abort();
    forwarder.abort();
    let _ = outgoing_tx.send(Message::Close(None)).await;
    drop(outgoing_tx);
    if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
        debug!(subscriber = id, "Writer did not finish in time");
    }
    state.distributor.unsubscribe(id).await;
    info!(subscriber = id, "Event channel closed");
}

/// Reply to one text frame, if it warrants a reply.
async fn handle_text(
    state: &AppState,
    id: SubscriberId,
    origin: Option<&str>,
    text: &str,
) -> Option<ServerMessage> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(subscriber = id, error = %e, "Invalid channel message");
            return Some(ServerMessage::error(INVALID_MESSAGE));
        }
    };
    debug!(subscriber = id, ?message, "Channel message");

    let service = &state.service;
    let reply = match message {
        ClientMessage::GetStatus => match service.status().await {
            Ok(status) => ServerMessage::Status(status),
            Err(e) => ServerMessage::error(e.to_string()),
        },
        ClientMessage::StartScan => {
            ServerMessage::ScanResult(control::into_reply(control::start_scan(service).await))
        }
        ClientMessage::StopScan => {
            ServerMessage::ScanResult(control::into_reply(control::stop_scan(service).await))
        }
        ClientMessage::ConnectReader => {
            ServerMessage::ScanResult(control::into_reply(control::connect_reader(service).await))
        }
        ClientMessage::ProximityRead { serial_number } => {
            match service.proximity_read(origin, &serial_number) {
                Ok(()) => return None,
                Err(e) => {
                    warn!(subscriber = id, origin = origin.unwrap_or("-"), error = %e, "Proximity read rejected");
                    ServerMessage::error(e.to_string())
                }
            }
        }
    };
    Some(reply)
}

async fn send(
    tx: &mpsc::Sender<Message>,
    message: &ServerMessage,
) -> Result<(), mpsc::error::SendError<Message>> {
    match message.to_json() {
        Ok(json) => tx.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "Failed to serialize channel message");
            Ok(())
        }
    }
}
