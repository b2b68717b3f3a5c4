//! WebSocket transport for the subscription protocol
//!
//! The read half feeds a `Session`; a separate writer task drains the
//! connection's queue. Whichever side ends first ends the connection, and
//! the registry entry is always removed on the way out.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::stream::StreamExt;
use futures::{Sink, SinkExt};
use tracing::{debug, info, warn};

use crate::backpressure::ConnectionQueue;
use crate::broadcaster::ConnectionId;
use crate::error::BroadcastError;
use crate::http::state::AppState;
use crate::session::{Session, SessionControl};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let broadcaster = Arc::clone(&state.components.broadcaster);
    let config = broadcaster.config().clone();
    let (id, queue) = broadcaster.connect();
    let session = Session::new(
        id,
        Arc::clone(&broadcaster),
        state.components.authenticator.clone(),
        config.auth_timeout(),
    );
    info!(connection_id = id, "WebSocket connected");

    let (sender, mut receiver) = socket.split();
    let mut writer = tokio::spawn(write_loop(id, sender, queue, config.batch_size, config.send_timeout()));

    loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    session.touch();
                    if session.handle_text(text.as_str()).await == SessionControl::Close {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    session.touch();
                    debug!(connection_id = id, "Ignoring binary frame");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => session.touch(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(connection_id = id, error = %e, "WebSocket read failed");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    // Closing the session closes the queue; the writer flushes what is left.
    session.close();
    if !writer.is_finished() {
        let _ = tokio::time::timeout(config.send_timeout(), writer).await;
    }
    info!(connection_id = id, "WebSocket disconnected");
}

/// Drain `queue` into `sender`. Every write, the closing frame included, is
/// bounded by `send_timeout`.
async fn write_loop<S>(
    id: ConnectionId,
    mut sender: S,
    queue: Arc<ConnectionQueue>,
    batch_size: usize,
    send_timeout: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let timed_out = || BroadcastError::SendTimeout {
        connection_id: id,
        timeout_ms: send_timeout.as_millis() as u64,
    };

    while let Some(batch) = queue.next_batch(batch_size.max(1)).await {
        for message in batch {
            let frame = Message::Text(Utf8Bytes::from(message.payload.as_ref()));
            match tokio::time::timeout(send_timeout, sender.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(connection_id = id, error = %e, "WebSocket write failed");
                    return;
                }
                Err(_) => {
                    warn!(error = %timed_out(), "Dropping connection");
                    return;
                }
            }
        }
    }
    if tokio::time::timeout(send_timeout, sender.send(Message::Close(None)))
        .await
        .is_err()
    {
        debug!(error = %timed_out(), "Close frame not delivered");
    }
}
