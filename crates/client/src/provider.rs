//! Reconnecting sync provider
//!
//! Owns a local replica and keeps it converged with one relay room. Local
//! edits are captured as minimal deltas and sent out; remote frames are
//! applied under a remote origin tag so they are never echoed back. The
//! connection task reconnects on abnormal closes with a fixed delay, and
//! every (re)connect starts by flushing the full local state, which makes
//! edits made while offline catch up for free.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::{broadcast, watch, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use yrs::TransactionMut;

use syncroom_protocol::{ClientId, Frame, PresenceDelta, Replica, UpdateOrigin, YDocument};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Fixed delay before a reconnect attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Cadence of presence republish while connected.
const PRESENCE_KEEPALIVE: Duration = Duration::from_secs(15);

/// Connection lifecycle as observed through [`SyncProvider::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

enum Disconnect {
    Clean,
    Abnormal,
}

struct Shared {
    doc: Mutex<YDocument>,
    client_id: ClientId,
    peers: Mutex<HashMap<ClientId, BTreeMap<String, Value>>>,
    /// Our own presence fields, republished on keepalive and reconnect.
    presence: Mutex<BTreeMap<String, Value>>,
    /// Sender into the live connection, if any.
    current_tx: Mutex<Option<UnboundedSender<Message>>>,
    status_tx: watch::Sender<SyncStatus>,
    /// Remote document updates, for observers that render on change.
    updates_tx: broadcast::Sender<Vec<u8>>,
    should_connect: AtomicBool,
    /// Wakes a pending reconnect sleep so destroy() takes effect at once.
    retry_wake: Notify,
}

impl Shared {
    fn send_frame(&self, frame: Vec<u8>) {
        let tx = self.current_tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(Message::Binary(frame));
        }
    }

    fn publish_presence(&self, tx: &UnboundedSender<Message>) {
        let fields = self.presence.lock().unwrap().clone();
        if fields.is_empty() {
            return;
        }
        let delta = PresenceDelta::Publish {
            client: self.client_id,
            fields,
        };
        let _ = tx.send(Message::Binary(Frame::Presence(delta.encode()).encode()));
    }

    fn handle_frame(&self, data: &[u8]) {
        match Frame::decode(data) {
            Ok(Frame::Doc(payload)) => {
                let applied = {
                    let mut doc = self.doc.lock().unwrap();
                    doc.apply_update(&payload, UpdateOrigin::Remote)
                };
                match applied {
                    Ok(()) => {
                        let _ = self.updates_tx.send(payload);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Ignoring undecodable remote update");
                    }
                }
            }
            Ok(Frame::Presence(payload)) => match PresenceDelta::decode(&payload) {
                Ok(delta) => self.merge_presence(&delta),
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring malformed presence delta");
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unrecognized frame");
            }
        }
    }

    fn merge_presence(&self, delta: &PresenceDelta) {
        // The relay replays our own entry after a reconnect; skip it
        if delta.client() == self.client_id {
            return;
        }
        let mut peers = self.peers.lock().unwrap();
        match delta {
            PresenceDelta::Publish { client, fields } => {
                let entry = peers.entry(*client).or_default();
                for (name, value) in fields {
                    if value.is_null() {
                        entry.remove(name);
                    } else {
                        entry.insert(name.clone(), value.clone());
                    }
                }
            }
            PresenceDelta::Leave { client } => {
                peers.remove(client);
            }
        }
    }
}

/// Client-side handle to one relay room.
pub struct SyncProvider {
    shared: Arc<Shared>,
}

impl SyncProvider {
    /// Connect to `room` on the relay at `endpoint` (e.g. `ws://host:1234`).
    ///
    /// Returns immediately; the connection is established in the background
    /// and observable through [`status`](Self::status).
    pub fn connect(endpoint: &str, room: &str) -> Self {
        let doc = YDocument::new();
        let client_id = doc.client_id();
        let (status_tx, _) = watch::channel(SyncStatus::Connecting);
        let (updates_tx, _) = broadcast::channel(64);

        let shared = Arc::new(Shared {
            doc: Mutex::new(doc),
            client_id,
            peers: Mutex::new(HashMap::new()),
            presence: Mutex::new(BTreeMap::new()),
            current_tx: Mutex::new(None),
            status_tx,
            updates_tx,
            should_connect: AtomicBool::new(true),
            retry_wake: Notify::new(),
        });

        let url = format!("{}/{room}", endpoint.trim_end_matches('/'));
        let task_shared = shared.clone();
        tokio::spawn(async move {
            connection_loop(task_shared, url).await;
        });

        Self { shared }
    }

    /// The local replica's client id, also its presence key.
    pub fn client_id(&self) -> ClientId {
        self.shared.client_id
    }

    /// Run a local mutation and send the resulting delta to the room.
    ///
    /// Safe to call while disconnected: the change stays in the replica and
    /// the full-state flush on the next (re)connect carries it over.
    pub fn edit<F>(&self, f: F)
    where
        F: FnOnce(&mut TransactionMut),
    {
        let update = self.shared.doc.lock().unwrap().edit(f);
        if update.is_empty() {
            return;
        }
        self.shared.send_frame(Frame::Doc(update).encode());
    }

    /// Read access to the local replica.
    pub fn with_doc<R>(&self, f: impl FnOnce(&YDocument) -> R) -> R {
        let doc = self.shared.doc.lock().unwrap();
        f(&doc)
    }

    /// Replace our presence fields and publish them to the room.
    pub fn set_presence(&self, fields: BTreeMap<String, Value>) {
        *self.shared.presence.lock().unwrap() = fields.clone();
        let delta = PresenceDelta::Publish {
            client: self.shared.client_id,
            fields,
        };
        self.shared.send_frame(Frame::Presence(delta.encode()).encode());
    }

    /// Drop our presence entry from the room.
    pub fn clear_presence(&self) {
        self.shared.presence.lock().unwrap().clear();
        let delta = PresenceDelta::Leave {
            client: self.shared.client_id,
        };
        self.shared.send_frame(Frame::Presence(delta.encode()).encode());
    }

    /// Current view of the other clients' presence.
    pub fn peers(&self) -> HashMap<ClientId, BTreeMap<String, Value>> {
        self.shared.peers.lock().unwrap().clone()
    }

    /// Watch the connection lifecycle.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Subscribe to remote document updates as they are applied.
    pub fn updates(&self) -> broadcast::Receiver<Vec<u8>> {
        self.shared.updates_tx.subscribe()
    }

    /// Tear the provider down: no further reconnects, the socket closes
    /// cleanly, and status settles on [`SyncStatus::Closed`].
    pub fn destroy(&self) {
        // Flipped before the close so the disconnect is treated as final
        self.shared.should_connect.store(false, Ordering::SeqCst);
        self.shared.retry_wake.notify_waiters();
        let tx = self.shared.current_tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(Message::Close(None));
        }
    }
}

async fn connection_loop(shared: Arc<Shared>, url: String) {
    let mut first_attempt = true;
    while shared.should_connect.load(Ordering::SeqCst) {
        if !first_attempt {
            // send_replace: the value must update even while nobody
            // subscribes, so a later status() sees the current state
            shared.status_tx.send_replace(SyncStatus::Reconnecting);
            tokio::select! {
                () = tokio::time::sleep(RECONNECT_DELAY) => {}
                () = shared.retry_wake.notified() => {}
            }
            if !shared.should_connect.load(Ordering::SeqCst) {
                break;
            }
        }
        first_attempt = false;

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                shared.status_tx.send_replace(SyncStatus::Connected);
                tracing::info!(url = %url, "Connected");
                let reason = run_session(&shared, ws).await;
                if matches!(reason, Disconnect::Clean) {
                    break;
                }
                tracing::warn!(url = %url, "Connection lost");
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Connect failed");
            }
        }
    }
    shared.status_tx.send_replace(SyncStatus::Closed);
}

async fn run_session(shared: &Arc<Shared>, ws: Ws) -> Disconnect {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = unbounded_channel::<Message>();
    *shared.current_tx.lock().unwrap() = Some(tx.clone());

    // Flush the full local state; idempotent on the relay side, and it
    // carries any edits made while offline
    let full_state = {
        let doc = shared.doc.lock().unwrap();
        if doc.is_empty() {
            None
        } else {
            Some(doc.encode_full_state())
        }
    };
    if let Some(state) = full_state {
        let _ = tx.send(Message::Binary(Frame::Doc(state).encode()));
    }
    shared.publish_presence(&tx);

    let mut keepalive = tokio::time::interval(PRESENCE_KEEPALIVE);
    keepalive.tick().await;

    let reason = loop {
        tokio::select! {
            _ = keepalive.tick() => {
                shared.publish_presence(&tx);
            }

            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        let closing = matches!(msg, Message::Close(_));
                        if ws_tx.send(msg).await.is_err() {
                            break Disconnect::Abnormal;
                        }
                        if closing {
                            break Disconnect::Clean;
                        }
                    }
                    None => break Disconnect::Abnormal,
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        shared.handle_frame(&data);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let clean = frame.map_or(true, |f| matches!(f.code, CloseCode::Normal));
                        break if clean { Disconnect::Clean } else { Disconnect::Abnormal };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break Disconnect::Abnormal,
                }
            }
        }
    };

    *shared.current_tx.lock().unwrap() = None;
    reason
}
