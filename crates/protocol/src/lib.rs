//! Shared protocol types for syncroom
//!
//! Defines the binary frame format exchanged between relay and clients,
//! the presence delta payloads, and the replicated-document capability.

pub mod doc;
pub mod frame;
pub mod presence;

pub use doc::{Replica, UpdateOrigin, YDocument};
pub use frame::{Frame, FrameError};
pub use presence::{ClientId, PresenceDelta};
