//! Contract with the upstream service consuming committed entries.

use super::Entry;

/// Consumer of committed log entries.
///
/// The storage layer delivers every committed entry in index order. The
/// implementation must be deterministic: given the same entry sequence,
/// all replicas reach the same state. `install_snapshot` is a hint fired
/// when the service's apply cursor has fallen behind the first retained
/// log index; the service must fetch a snapshot out of band before apply
/// can resume.
pub trait Service: Send {
    /// The last log index this service has applied.
    fn last_applied(&self) -> i64;

    /// Apply one committed entry and advance the apply cursor.
    fn apply_entry(&mut self, ent: &Entry);

    /// The log no longer reaches back to this service's cursor.
    fn install_snapshot(&mut self);
}

/// In-memory service that records everything it applies (for testing).
#[derive(Debug, Default)]
pub struct MemService {
    last_applied: i64,
    applied: Vec<Entry>,
    install_requests: usize,
}

impl MemService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries applied so far, in apply order.
    pub fn applied(&self) -> &[Entry] {
        &self.applied
    }

    /// How many times the log asked this service to install a snapshot.
    pub fn install_requests(&self) -> usize {
        self.install_requests
    }
}

impl Service for MemService {
    fn last_applied(&self) -> i64 {
        self.last_applied
    }

    fn apply_entry(&mut self, ent: &Entry) {
        self.last_applied = ent.index;
        self.applied.push(ent.clone());
    }

    fn install_snapshot(&mut self) {
        self.install_requests += 1;
    }
}
