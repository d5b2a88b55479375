//! Per-room presence bookkeeping
//!
//! Tracks each client's ephemeral field map and last-update time. Publishes
//! merge last-writer-wins per field and yield a diff restricted to the
//! fields that actually changed; that diff is what gets rebroadcast, never
//! the full entry set. Entries expire on disconnect or when they outlive
//! the liveness window, and nothing here ever touches storage.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde_json::Value;
use syncroom_protocol::ClientId;

/// One client's ephemeral state.
#[derive(Debug, Clone)]
struct PresenceEntry {
    fields: BTreeMap<String, Value>,
    last_update: Instant,
}

/// Field-level change produced by a publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceDiff {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// The changed fields to rebroadcast; removed fields carry `null`.
    pub fields: BTreeMap<String, Value>,
}

impl PresenceDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Presence entries for a single room.
#[derive(Debug, Default)]
pub struct RoomPresence {
    entries: HashMap<ClientId, PresenceEntry>,
}

impl RoomPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `fields` into `client`'s entry. A `null` value removes the
    /// field. Returns the diff of what changed; an unchanged publish still
    /// refreshes the entry's last-update time (keepalive).
    pub fn publish(&mut self, client: ClientId, fields: &BTreeMap<String, Value>) -> PresenceDiff {
        let entry = self.entries.entry(client).or_insert_with(|| PresenceEntry {
            fields: BTreeMap::new(),
            last_update: Instant::now(),
        });
        entry.last_update = Instant::now();

        let mut diff = PresenceDiff::default();
        for (name, value) in fields {
            if value.is_null() {
                if entry.fields.remove(name).is_some() {
                    diff.removed.push(name.clone());
                    diff.fields.insert(name.clone(), Value::Null);
                }
            } else {
                match entry.fields.insert(name.clone(), value.clone()) {
                    None => {
                        diff.added.push(name.clone());
                        diff.fields.insert(name.clone(), value.clone());
                    }
                    Some(previous) if previous != *value => {
                        diff.updated.push(name.clone());
                        diff.fields.insert(name.clone(), value.clone());
                    }
                    Some(_) => {}
                }
            }
        }
        diff
    }

    /// Drop `client`'s entry. Returns whether one existed.
    pub fn expire(&mut self, client: ClientId) -> bool {
        self.entries.remove(&client).is_some()
    }

    /// Drop every entry whose last update is older than `window`, returning
    /// the expired client ids.
    pub fn sweep(&mut self, window: Duration) -> Vec<ClientId> {
        let now = Instant::now();
        let expired: Vec<ClientId> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_update) > window)
            .map(|(client, _)| *client)
            .collect();
        for client in &expired {
            self.entries.remove(client);
        }
        expired
    }

    /// Current entries, for replaying to a late joiner.
    pub fn snapshot(&self) -> Vec<(ClientId, BTreeMap<String, Value>)> {
        self.entries
            .iter()
            .map(|(client, entry)| (*client, entry.fields.clone()))
            .collect()
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.entries.contains_key(&client)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
