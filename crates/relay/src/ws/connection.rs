//! WebSocket connection handling
//!
//! Manages a single relay connection: handshake and room routing, the
//! dedicated sender task, the liveness ping loop, and cleanup on
//! disconnect.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    handshake::server::{Request, Response},
    protocol::WebSocketConfig,
    Message,
};

use syncroom_protocol::{ClientId, Frame, PresenceDelta};

use crate::registry::RoomRegistry;

use super::protocol::parse_room_from_uri;

/// Handle a single WebSocket connection for its whole lifetime.
///
/// All outbound traffic for the session, initial sync included, flows
/// through one FIFO channel drained by a dedicated sender task, so ordering
/// is preserved and a slow socket never blocks room broadcast.
pub async fn handle_connection<S>(
    stream: S,
    registry: Arc<RoomRegistry>,
    ping_interval: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Capture the request URI during the handshake
    let request_uri = Arc::new(std::sync::Mutex::new(String::new()));
    let request_uri_clone = request_uri.clone();

    let callback = move |req: &Request,
                         response: Response|
          -> std::result::Result<Response, http::Response<Option<String>>> {
        *request_uri_clone.lock().unwrap() = req.uri().to_string();
        Ok(response)
    };

    // Inbound message cap; a full-state sync of a large document fits well
    // under this
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(16 * 1024 * 1024);
    ws_config.max_frame_size = Some(16 * 1024 * 1024);

    let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let room_name = {
        let uri = request_uri.lock().unwrap();
        parse_room_from_uri(&uri)
    };
    let session_id = registry.next_session_id();
    let room = registry.get_or_create(&room_name).await;

    tracing::info!(
        session_id = %session_id,
        room = %room_name,
        "Session connected"
    );

    // Dedicated sender task draining the session's outbound channel
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let sender_session_id = session_id;
    let sender_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                tracing::debug!(session_id = %sender_session_id, "Send failed, stopping sender");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Initial sync and presence replay land on the channel before the
    // session joins the broadcast set
    room.attach(session_id, tx.clone());

    // Every client id this session has published presence under; all of
    // them are expired promptly on disconnect
    let mut presence_clients: HashSet<ClientId> = HashSet::new();

    let mut ping_timer = tokio::time::interval(ping_interval);
    let mut alive = true;

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                if !alive {
                    tracing::warn!(
                        session_id = %session_id,
                        room = %room_name,
                        "Missed liveness pong, terminating session"
                    );
                    break;
                }
                alive = false;
                if tx.send(Message::Ping(vec![])).is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        match Frame::decode(&data) {
                            Ok(Frame::Doc(payload)) => {
                                match room.apply_doc_update(session_id, &data, &payload) {
                                    Ok(()) => registry.schedule_save(&room),
                                    Err(e) => {
                                        tracing::warn!(
                                            session_id = %session_id,
                                            room = %room_name,
                                            error = %e,
                                            "Dropping undecodable document update"
                                        );
                                    }
                                }
                            }
                            Ok(Frame::Presence(payload)) => {
                                match PresenceDelta::decode(&payload) {
                                    Ok(delta) => {
                                        let client = room.apply_presence(session_id, &delta);
                                        match delta {
                                            PresenceDelta::Publish { .. } => {
                                                presence_clients.insert(client);
                                            }
                                            PresenceDelta::Leave { .. } => {
                                                presence_clients.remove(&client);
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!(
                                            session_id = %session_id,
                                            room = %room_name,
                                            error = %e,
                                            "Dropping malformed presence delta"
                                        );
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    session_id = %session_id,
                                    room = %room_name,
                                    error = %e,
                                    "Dropping unrecognized frame"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        alive = true;
                    }
                    Some(Ok(Message::Close(_))) => {
                        break;
                    }
                    Some(Err(_e)) => {
                        break;
                    }
                    None => {
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    room.detach(session_id);
    for client in presence_clients {
        room.expire_presence(client);
    }
    sender_handle.abort();

    tracing::info!(session_id = %session_id, room = %room_name, "Session disconnected");
    Ok(())
}
