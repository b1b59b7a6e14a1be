//! Self-contained log tail for bringing peers up to date.

use serde::{Deserialize, Serialize};

use super::{Entry, Result, State};

/// A snapshot: persisted state plus a contiguous suffix of entries ending
/// at `last_index`.
///
/// It carries membership so an installing node can re-establish its peers
/// before reloading state, and enough of the log tail to bring a fresh
/// node to `last_index` without replaying history. Encodes to a single
/// newline-free blob so it fits in one `InstallSnapshot` datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    state: State,
    #[serde(rename = "lastTerm")]
    last_term: i32,
    #[serde(rename = "lastIndex")]
    last_index: i64,
    entries: Vec<Entry>,
}

impl Snapshot {
    /// Assemble a snapshot. `entries` must be a contiguous ascending
    /// suffix ending at `last_index` (empty only for an empty log).
    pub fn new(state: State, last_term: i32, last_index: i64, entries: Vec<Entry>) -> Self {
        Self {
            state,
            last_term,
            last_index,
            entries,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn last_term(&self) -> i32 {
        self.last_term
    }

    pub fn last_index(&self) -> i64 {
        self.last_index
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Encode as a single-line blob.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a blob produced by [`Snapshot::encode`], or `None` if it is
    /// unreadable. Callers drop undecodable snapshots without acking.
    pub fn decode(data: &str) -> Option<Self> {
        serde_json::from_str(data).ok()
    }
}
