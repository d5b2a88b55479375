//! Room registry and per-room state
//!
//! The registry is an explicitly owned object handed to the relay by
//! reference; tests can run any number of independent registries in one
//! process. Each room owns exactly one replica, the set of attached session
//! senders, its presence entries and its persistence flags, all behind a
//! single mutex: one writer per room, enforced by the type system rather
//! than by convention.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::tungstenite::Message;

use syncroom_protocol::{ClientId, Frame, PresenceDelta, Replica, UpdateOrigin, YDocument};

use crate::persist::SnapshotStore;
use crate::presence::RoomPresence;

pub type SessionId = u64;

/// Outbound channel of one attached session.
pub type SessionTx = UnboundedSender<Message>;

/// Builds a fresh replica for a newly created room.
pub type ReplicaFactory = dyn Fn() -> Box<dyn Replica> + Send + Sync;

struct RoomState {
    doc: Box<dyn Replica>,
    sessions: HashMap<SessionId, SessionTx>,
    presence: RoomPresence,
    /// Updates applied since the last completed save.
    dirty: bool,
    /// A debounced saver task is already running.
    save_scheduled: bool,
}

/// One unit of isolation: a replica, its sessions, its presence.
pub struct Room {
    id: String,
    state: Mutex<RoomState>,
    /// Flips to true once the snapshot load has finished (found, absent or
    /// failed). Saves wait on this so a pre-load save can never clobber the
    /// durable snapshot before its contents have been merged in.
    loaded_tx: watch::Sender<bool>,
}

impl Room {
    fn new(id: &str, doc: Box<dyn Replica>) -> Self {
        let (loaded_tx, _) = watch::channel(false);
        Self {
            id: id.to_string(),
            state: Mutex::new(RoomState {
                doc,
                sessions: HashMap::new(),
                presence: RoomPresence::new(),
                dirty: false,
                save_scheduled: false,
            }),
            loaded_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn mark_loaded(&self) {
        self.loaded_tx.send_replace(true);
    }

    /// Wait until the room's snapshot load has completed.
    async fn wait_until_loaded(&self) {
        let mut rx = self.loaded_tx.subscribe();
        let _ = rx.wait_for(|loaded| *loaded).await;
    }

    /// Register a session for broadcast, delivering the initial sync first.
    ///
    /// The full-state encoding (skipped while the replica is empty) and the
    /// current presence entries are pushed onto the session's own FIFO
    /// channel before it joins the broadcast set, so the session observes
    /// the full state strictly before any later incremental update.
    pub fn attach(&self, session: SessionId, tx: SessionTx) {
        let mut state = self.state.lock().unwrap();
        if !state.doc.is_empty() {
            let frame = Frame::Doc(state.doc.encode_full_state()).encode();
            let _ = tx.send(Message::Binary(frame));
        }
        for (client, fields) in state.presence.snapshot() {
            let delta = PresenceDelta::Publish { client, fields };
            let frame = Frame::Presence(delta.encode()).encode();
            let _ = tx.send(Message::Binary(frame));
        }
        state.sessions.insert(session, tx);
    }

    /// Remove a session from the broadcast set.
    pub fn detach(&self, session: SessionId) {
        self.state.lock().unwrap().sessions.remove(&session);
    }

    /// Apply a document delta and rebroadcast the raw message to every
    /// other session in the room. Marks the room dirty; the caller is
    /// responsible for scheduling the debounced save.
    pub fn apply_doc_update(&self, from: SessionId, raw: &[u8], payload: &[u8]) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.doc.apply_update(payload, UpdateOrigin::Remote)?;
        state.dirty = true;
        Self::broadcast_locked(&mut state, raw, Some(from));
        Ok(())
    }

    /// Merge a presence delta and rebroadcast the changed fields only.
    ///
    /// Returns the publishing client id so the connection can expire its
    /// entry promptly on disconnect.
    pub fn apply_presence(&self, from: SessionId, delta: &PresenceDelta) -> ClientId {
        let mut state = self.state.lock().unwrap();
        match delta {
            PresenceDelta::Publish { client, fields } => {
                let diff = state.presence.publish(*client, fields);
                if !diff.is_empty() {
                    let reduced = PresenceDelta::Publish {
                        client: *client,
                        fields: diff.fields,
                    };
                    let frame = Frame::Presence(reduced.encode()).encode();
                    Self::broadcast_locked(&mut state, &frame, Some(from));
                }
                *client
            }
            PresenceDelta::Leave { client } => {
                if state.presence.expire(*client) {
                    let frame = Frame::Presence(delta.encode()).encode();
                    Self::broadcast_locked(&mut state, &frame, Some(from));
                }
                *client
            }
        }
    }

    /// Expire a client's presence (disconnect or liveness timeout) and tell
    /// the remaining sessions about it.
    pub fn expire_presence(&self, client: ClientId) {
        let mut state = self.state.lock().unwrap();
        if state.presence.expire(client) {
            let frame = Frame::Presence(PresenceDelta::Leave { client }.encode()).encode();
            Self::broadcast_locked(&mut state, &frame, None);
        }
    }

    /// Expire presence entries older than `window`, broadcasting removals.
    pub fn sweep_presence(&self, window: Duration) -> Vec<ClientId> {
        let mut state = self.state.lock().unwrap();
        let expired = state.presence.sweep(window);
        for client in &expired {
            let frame = Frame::Presence(PresenceDelta::Leave { client: *client }.encode()).encode();
            Self::broadcast_locked(&mut state, &frame, None);
        }
        expired
    }

    /// Merge a loaded snapshot into the replica and broadcast it to the
    /// sessions that attached before the load finished. Uses the same
    /// convergent apply as any other update, so updates that raced the load
    /// are never lost.
    fn merge_snapshot(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.doc.apply_update(bytes, UpdateOrigin::Storage)?;
        let frame = Frame::Doc(bytes.to_vec()).encode();
        Self::broadcast_locked(&mut state, &frame, None);
        Ok(())
    }

    fn broadcast_locked(state: &mut RoomState, raw: &[u8], without: Option<SessionId>) {
        let mut dropped = Vec::new();
        for (session, tx) in &state.sessions {
            if without == Some(*session) {
                continue;
            }
            if tx.send(Message::Binary(raw.to_vec())).is_err() {
                dropped.push(*session);
            }
        }
        for session in dropped {
            state.sessions.remove(&session);
        }
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn presence_count(&self) -> usize {
        self.state.lock().unwrap().presence.len()
    }

    /// Current full-state encoding (for the status API and shutdown flush).
    pub fn encode_full_state(&self) -> Vec<u8> {
        self.state.lock().unwrap().doc.encode_full_state()
    }
}

/// Owns every live room in this process.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    store: Arc<dyn SnapshotStore>,
    factory: Box<ReplicaFactory>,
    save_debounce: Duration,
    session_ids: AtomicU64,
}

impl RoomRegistry {
    /// Registry with the default y-crdt replica.
    pub fn new(store: Arc<dyn SnapshotStore>, save_debounce: Duration) -> Arc<Self> {
        Self::with_factory(store, save_debounce, || Box::new(YDocument::new()))
    }

    /// Registry with an injected replica factory.
    pub fn with_factory<F>(store: Arc<dyn SnapshotStore>, save_debounce: Duration, factory: F) -> Arc<Self>
    where
        F: Fn() -> Box<dyn Replica> + Send + Sync + 'static,
    {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            factory: Box::new(factory),
            save_debounce,
            session_ids: AtomicU64::new(1),
        })
    }

    /// Get the room for `id`, creating it on first access.
    ///
    /// Creation is synchronous; the snapshot load runs in the background and
    /// merges into whatever updates arrive first. At most one room ever
    /// exists per id.
    pub async fn get_or_create(self: &Arc<Self>, id: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.read().await.get(id) {
            return room.clone();
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(id) {
            return room.clone();
        }
        let room = Arc::new(Room::new(id, (self.factory)()));
        rooms.insert(id.to_string(), room.clone());
        drop(rooms);
        tracing::info!(room = %id, "Room created");

        let store = self.store.clone();
        let loading = room.clone();
        tokio::spawn(async move {
            match store.load(loading.id()).await {
                Ok(Some(bytes)) => {
                    tracing::info!(room = %loading.id(), size = bytes.len(), "Snapshot loaded");
                    if let Err(e) = loading.merge_snapshot(&bytes) {
                        tracing::warn!(room = %loading.id(), error = %e, "Ignoring undecodable snapshot");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(room = %loading.id(), error = %e, "Snapshot load failed");
                }
            }
            loading.mark_loaded();
        });

        room
    }

    /// Allocate a process-unique session id.
    pub fn next_session_id(&self) -> SessionId {
        self.session_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Mark the room dirty and make sure a debounced saver is running.
    ///
    /// The saver writes the *latest* full state once per debounce window, so
    /// update bursts collapse into one write. Broadcasting never waits on
    /// it. A failed save is logged; the next update reschedules.
    pub fn schedule_save(&self, room: &Arc<Room>) {
        {
            let mut state = room.state.lock().unwrap();
            state.dirty = true;
            if state.save_scheduled {
                return;
            }
            state.save_scheduled = true;
        }

        let store = self.store.clone();
        let debounce = self.save_debounce;
        let room = room.clone();
        tokio::spawn(async move {
            // The first write must not race the snapshot load: saving the
            // post-startup updates alone would overwrite the durable state
            // the load is about to merge in
            room.wait_until_loaded().await;
            loop {
                tokio::time::sleep(debounce).await;
                let bytes = {
                    let mut state = room.state.lock().unwrap();
                    state.dirty = false;
                    state.doc.encode_full_state()
                };
                if let Err(e) = store.save(room.id(), &bytes).await {
                    tracing::warn!(room = %room.id(), error = %e, "Snapshot save failed, retrying on next update");
                    let mut state = room.state.lock().unwrap();
                    state.dirty = true;
                    state.save_scheduled = false;
                    return;
                }
                tracing::debug!(room = %room.id(), size = bytes.len(), "Snapshot saved");
                let mut state = room.state.lock().unwrap();
                if !state.dirty {
                    state.save_scheduled = false;
                    return;
                }
            }
        });
    }

    /// Expire stale presence in every room (called by the sweeper task).
    pub async fn sweep_presence(&self, window: Duration) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut total = 0;
        for room in rooms {
            let expired = room.sweep_presence(window);
            if !expired.is_empty() {
                tracing::info!(room = %room.id(), count = expired.len(), "Expired stale presence");
                total += expired.len();
            }
        }
        total
    }

    /// Write every dirty room's snapshot right now (shutdown path).
    pub async fn flush_dirty(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            room.wait_until_loaded().await;
            let bytes = {
                let mut state = room.state.lock().unwrap();
                if !state.dirty {
                    continue;
                }
                state.dirty = false;
                state.doc.encode_full_state()
            };
            if let Err(e) = self.store.save(room.id(), &bytes).await {
                tracing::error!(room = %room.id(), error = %e, "Final snapshot flush failed");
            }
        }
    }

    /// (id, attached sessions, presence entries) per live room.
    pub async fn room_stats(&self) -> Vec<(String, usize, usize)> {
        let rooms = self.rooms.read().await;
        let mut stats: Vec<(String, usize, usize)> = rooms
            .values()
            .map(|room| (room.id().to_string(), room.session_count(), room.presence_count()))
            .collect();
        stats.sort();
        stats
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
