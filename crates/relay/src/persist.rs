//! Snapshot persistence using `SQLite`
//!
//! The relay persists each room's latest full document state as one blob,
//! keyed by room id and written via upsert. Loads happen once per room per
//! process lifetime; saves are fire-and-forget relative to the broadcast
//! path and coalesced by the registry's debounce logic.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

/// Durable room-id -> snapshot-bytes store.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot for a room, or `None` if never saved.
    async fn load(&self, room: &str) -> Result<Option<Vec<u8>>>;

    /// Upsert the room's snapshot. Never partially written.
    async fn save(&self, room: &str, bytes: &[u8]) -> Result<()>;
}

/// Snapshot storage backed by `SQLite`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the snapshot database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create snapshot directory")?;
        }

        let conn = Connection::open(path).context("Failed to open snapshot database")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS snapshots (
                room TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn load(&self, room: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().await;
        let result = conn.query_row(
            "SELECT data FROM snapshots WHERE room = ?",
            [room],
            |row| row.get::<_, Vec<u8>>(0),
        );
        match result {
            Ok(bytes) => Ok(Some(bytes)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, room: &str, bytes: &[u8]) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO snapshots (room, data, updated_at)
             VALUES (?, ?, strftime('%s', 'now'))
             ON CONFLICT(room) DO UPDATE SET
                 data = excluded.data,
                 updated_at = excluded.updated_at",
            params![room, bytes],
        )?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a snapshot, as if saved by a previous process.
    pub async fn seed(&self, room: &str, bytes: Vec<u8>) {
        self.snapshots.lock().await.insert(room.to_string(), bytes);
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self, room: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshots.lock().await.get(room).cloned())
    }

    async fn save(&self, room: &str, bytes: &[u8]) -> Result<()> {
        self.snapshots
            .lock()
            .await
            .insert(room.to_string(), bytes.to_vec());
        Ok(())
    }
}
