//! Replicated document capability
//!
//! The relay and the client both treat the document as an injected
//! capability: anything that can encode its full state and apply opaque
//! updates convergently and idempotently. `YDocument` is the y-crdt backed
//! implementation used in production; tests can substitute their own.

use yrs::updates::decoder::Decode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::presence::ClientId;

/// Origin tag attached to an applied update.
///
/// Local mutations are captured and sent out; remote and storage applies are
/// tagged so they can never be mistaken for local changes and re-sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Produced by this process's own mutation.
    Local,
    /// Received from a peer over the relay.
    Remote,
    /// Loaded from the persisted snapshot.
    Storage,
}

impl UpdateOrigin {
    fn as_origin(self) -> Origin {
        match self {
            UpdateOrigin::Local => Origin::from("local"),
            UpdateOrigin::Remote => Origin::from("remote"),
            UpdateOrigin::Storage => Origin::from("storage"),
        }
    }
}

/// The injected document capability.
///
/// Implementations must guarantee convergence (the same set of updates,
/// applied in any order on replicas that share a starting state, yields
/// bit-identical full-state encodings) and idempotence (re-applying an
/// already-applied update is a no-op).
pub trait Replica: Send {
    /// True until the first update is applied or produced.
    fn is_empty(&self) -> bool;

    /// Encode the entire current state as one update.
    fn encode_full_state(&self) -> Vec<u8>;

    /// Apply an opaque update under the given origin tag.
    fn apply_update(&mut self, update: &[u8], origin: UpdateOrigin) -> anyhow::Result<()>;
}

/// y-crdt backed replica.
#[derive(Debug, Default)]
pub struct YDocument {
    doc: Doc,
}

impl YDocument {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// The replica's client id, also used as the presence key.
    pub fn client_id(&self) -> ClientId {
        self.doc.client_id()
    }

    /// Get or create a named text root.
    pub fn text(&self, name: &str) -> yrs::TextRef {
        self.doc.get_or_insert_text(name)
    }

    /// Run a local mutation and return the update it produced.
    ///
    /// The update is captured as a state-vector diff around the transaction,
    /// so it contains exactly the changes made by `f` and nothing else.
    pub fn edit<F>(&mut self, f: F) -> Vec<u8>
    where
        F: FnOnce(&mut TransactionMut),
    {
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut_with(UpdateOrigin::Local.as_origin());
            f(&mut txn);
        }
        self.doc.transact().encode_diff_v1(&before)
    }

    /// Read transaction for inspecting shared types.
    pub fn transact(&self) -> yrs::Transaction<'_> {
        self.doc.transact()
    }

    /// Current state vector.
    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }
}

impl Replica for YDocument {
    fn is_empty(&self) -> bool {
        self.state_vector() == StateVector::default()
    }

    fn encode_full_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn apply_update(&mut self, update: &[u8], origin: UpdateOrigin) -> anyhow::Result<()> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut_with(origin.as_origin());
        txn.apply_update(update)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use yrs::{GetString, Text};

    use super::*;

    fn content(doc: &YDocument) -> String {
        let text = doc.text("content");
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[test]
    fn new_document_is_empty() {
        let doc = YDocument::new();
        assert!(doc.is_empty());
    }

    #[test]
    fn edit_captures_exactly_the_local_change() {
        let mut doc = YDocument::new();
        let text = doc.text("content");
        let update = doc.edit(|txn| text.insert(txn, 0, "hi"));
        assert!(!update.is_empty());
        assert!(!doc.is_empty());

        // Replaying the captured update on a fresh replica reproduces it
        let mut other = YDocument::new();
        other.apply_update(&update, UpdateOrigin::Remote).unwrap();
        assert_eq!(content(&other), "hi");
    }

    #[test]
    fn convergence_under_either_order() {
        let mut a = YDocument::new();
        let mut b = YDocument::new();

        let text_a = a.text("content");
        let text_b = b.text("content");

        // Concurrent inserts at the same logical position
        let update_a = a.edit(|txn| text_a.insert(txn, 0, "alpha"));
        let update_b = b.edit(|txn| text_b.insert(txn, 0, "beta"));

        // a sees b's delta after its own; b the reverse order
        a.apply_update(&update_b, UpdateOrigin::Remote).unwrap();
        b.apply_update(&update_a, UpdateOrigin::Remote).unwrap();

        assert_eq!(content(&a), content(&b));
        assert!(content(&a).contains("alpha"));
        assert!(content(&a).contains("beta"));
        // Convergence is bit-exact, not just textual
        assert_eq!(a.encode_full_state(), b.encode_full_state());
    }

    #[test]
    fn reapplying_an_update_is_a_noop() {
        let mut source = YDocument::new();
        let text = source.text("content");
        let update = source.edit(|txn| text.insert(txn, 0, "once"));

        let mut doc = YDocument::new();
        doc.apply_update(&update, UpdateOrigin::Remote).unwrap();
        let first = doc.encode_full_state();
        doc.apply_update(&update, UpdateOrigin::Remote).unwrap();
        assert_eq!(doc.encode_full_state(), first);
    }

    #[test]
    fn full_state_roundtrip() {
        let mut source = YDocument::new();
        let text = source.text("content");
        source.edit(|txn| text.insert(txn, 0, "hello world"));

        let mut copy = YDocument::new();
        copy.apply_update(&source.encode_full_state(), UpdateOrigin::Storage)
            .unwrap();
        assert_eq!(copy.encode_full_state(), source.encode_full_state());
    }

    #[test]
    fn truncated_update_is_an_error() {
        let mut doc = YDocument::new();
        assert!(doc.apply_update(&[0xde], UpdateOrigin::Remote).is_err());
    }
}
