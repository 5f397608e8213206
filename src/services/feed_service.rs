//! Push-socket feed serving live session views.
//!
//! One connection follows one session. Outbound frames come from the
//! session's broadcast hub; the only inbound message a client may send is
//! a ping. Anything else, including legacy frame shapes, is rejected by
//! the strict parser and logged.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    dto::feed::{FeedInbound, FeedOutbound},
    services::{tracker_service, view_service},
    state::SharedState,
};

/// Handle the full lifecycle of one feed connection.
pub async fn handle_socket(
    state: SharedState,
    socket: WebSocket,
    guild_id: String,
    queue_number: u32,
) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps outbound frames flowing even while we
    // await inbound messages.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    // Unknown sessions get a close instead of a silent, frameless socket.
    let snapshot = match tracker_service::status(&state, &guild_id, queue_number).await {
        Ok(snapshot) => snapshot,
        Err(error) => {
            warn!(%guild_id, queue_number, %error, "rejecting feed connection");
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let mut frames = state.feeds().subscribe(&guild_id, queue_number);
    info!(%guild_id, queue_number, "feed subscriber connected");

    // Late subscribers start from the current state.
    if let Some(serialized) = view_service::state_frame(&state, &snapshot).await {
        if outbound_tx.send(Message::Text(serialized.into())).is_err() {
            finalize(writer_task, outbound_tx).await;
            return;
        }
    }

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    if outbound_tx
                        .send(Message::Text(frame.to_string().into()))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%guild_id, queue_number, skipped, "feed subscriber lagging; frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // The session stopped and its hub was removed.
                    let _ = outbound_tx.send(Message::Close(None));
                    break;
                }
            },
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => handle_inbound(&outbound_tx, &text),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = outbound_tx.send(Message::Pong(payload));
                }
                Some(Ok(Message::Close(frame))) => {
                    let _ = outbound_tx.send(Message::Close(frame));
                    break;
                }
                Some(Ok(Message::Binary(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Err(error)) => {
                    warn!(%guild_id, queue_number, %error, "websocket error");
                    break;
                }
                None => break,
            },
        }
    }

    info!(%guild_id, queue_number, "feed subscriber disconnected");
    finalize(writer_task, outbound_tx).await;
}

fn handle_inbound(outbound_tx: &mpsc::UnboundedSender<Message>, text: &str) {
    match serde_json::from_str::<FeedInbound>(text) {
        Ok(FeedInbound::Ping) => match serde_json::to_string(&FeedOutbound::Pong) {
            Ok(pong) => {
                let _ = outbound_tx.send(Message::Text(pong.into()));
            }
            Err(error) => warn!(%error, "failed to serialize pong frame"),
        },
        Err(error) => {
            warn!(payload = %text, %error, "rejecting unrecognized feed message");
        }
    }
}

/// Ensure the writer task winds down before we return from the handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}
