// syncroom-client library
// Reconnecting provider that keeps a local replica in sync with a relay room

pub mod provider;

pub use provider::{SyncProvider, SyncStatus};
