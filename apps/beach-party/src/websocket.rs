use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::protocol::Outbound;
use crate::AppState;

/// Upper bound on how long a closing socket waits for queued frames to flush.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// GET /ws
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let broker = state.broker.clone();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let connection_id = broker.open_connection(tx);
    counter!("beach_party_connections_total", 1);
    debug!(connection_id = %connection_id, "websocket connected");

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Message(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "failed to encode outbound message");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: Cow::Borrowed(""),
                        })))
                        .await;
                    break;
                }
            }
        }
        let _ = sender.close().await;
    });

    let deadline = Instant::now() + state.handshake_timeout;
    let mut authorized = false;
    let mut writer_done = false;

    loop {
        tokio::select! {
            frame = receiver.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!(connection_id = %connection_id, "ignoring non-UTF8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(
                            connection_id = %connection_id,
                            reason = ?frame.map(|f| f.reason.to_string()),
                            "client closed websocket"
                        );
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(connection_id = %connection_id, error = %err, "error receiving frame");
                        break;
                    }
                    None => break,
                };
                broker.handle_text(connection_id, &text).await;
                if !authorized {
                    authorized = broker.is_authorized(connection_id);
                }
            }
            _ = &mut writer => {
                // A close was flushed, or the peer stopped accepting frames.
                writer_done = true;
                break;
            }
            _ = sleep_until(deadline), if !authorized => {
                if broker.is_authorized(connection_id) {
                    authorized = true;
                    continue;
                }
                info!(connection_id = %connection_id, "handshake timed out");
                counter!("beach_party_handshake_timeouts_total", 1);
                break;
            }
        }
    }

    // Dropping the registry entry drops the queue's sender, so the writer
    // finishes once everything already queued is written.
    broker.handle_disconnect(connection_id);
    if !writer_done && timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    debug!(connection_id = %connection_id, "websocket closed");
}
