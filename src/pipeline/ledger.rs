//! Dedup ledger: message ids already handled in this session.

use std::collections::HashSet;

use crate::channels::transport::MessageUid;

/// Ids of messages already handled. Grows for the session lifetime and is
/// never persisted; a reconnect starts a new ledger.
#[derive(Debug, Default)]
pub struct DedupLedger {
    seen: HashSet<MessageUid>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, uid: MessageUid) -> bool {
        self.seen.contains(&uid)
    }

    /// Record `uid`. Returns `false` if it was already recorded.
    pub fn add(&mut self, uid: MessageUid) -> bool {
        self.seen.insert(uid)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
