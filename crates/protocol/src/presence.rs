//! Presence delta payloads
//!
//! Presence is ephemeral per-client state (cursor, display name, media peer
//! id) carried inside kind-1 frames. Fields merge last-writer-wins per field,
//! and only the publishing client may write its own entry. A `null` field
//! value removes that field; `Leave` removes the whole entry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client identifier, shared with the replica's client id.
pub type ClientId = u64;

/// A presence change on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresenceDelta {
    /// Merge `fields` into the entry for `client`. Null values remove fields.
    Publish {
        client: ClientId,
        fields: BTreeMap<String, Value>,
    },
    /// Remove the entry for `client` entirely.
    Leave { client: ClientId },
}

impl PresenceDelta {
    /// Client id the delta applies to.
    pub fn client(&self) -> ClientId {
        match self {
            PresenceDelta::Publish { client, .. } | PresenceDelta::Leave { client } => *client,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("presence delta serializes")
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
