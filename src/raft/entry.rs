//! Log entries and their line codec.
//!
//! An entry encodes to a single text line:
//!
//! ```text
//! <term> <index> <commit> <type> <data>
//! ```
//!
//! `data` is opaque and may itself contain spaces, so decoding splits on
//! at most five fields. `Ping` entries are heartbeat-only and never reach
//! the durable log.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Discriminates what a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Membership change: `data` is `<id> <addr>`.
    AddMember,
    /// Membership change: `data` is the removed node id.
    DelMember,
    /// Leader no-op published at the start of a term.
    Noop,
    /// Heartbeat carrier, never persisted.
    Ping,
    /// Opaque user payload for the upstream service.
    Data,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryType::AddMember => "AddMember",
            EntryType::DelMember => "DelMember",
            EntryType::Noop => "Noop",
            EntryType::Ping => "Ping",
            EntryType::Data => "Data",
        };
        f.write_str(s)
    }
}

impl FromStr for EntryType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "AddMember" => Ok(EntryType::AddMember),
            "DelMember" => Ok(EntryType::DelMember),
            "Noop" => Ok(EntryType::Noop),
            "Ping" => Ok(EntryType::Ping),
            "Data" => Ok(EntryType::Data),
            _ => Err(()),
        }
    }
}

/// An immutable log record, uniquely identified by `(term, index)`.
///
/// `commit` is the sender's commit index at emission time; followers use
/// it to advance their own commit cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: i32,
    pub index: i64,
    pub commit: i64,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub data: String,
}

impl Entry {
    pub fn new(term: i32, index: i64, commit: i64, entry_type: EntryType, data: &str) -> Self {
        Self {
            term,
            index,
            commit,
            entry_type,
            data: data.to_owned(),
        }
    }

    /// A heartbeat entry carrying only the sender's commit index.
    pub fn ping(commit: i64) -> Self {
        Self::new(0, 0, commit, EntryType::Ping, "")
    }

    /// Encode as a single text line.
    pub fn encode(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.term, self.index, self.commit, self.entry_type, self.data
        )
    }

    /// Decode a line produced by [`Entry::encode`].
    ///
    /// Tolerates a trailing CR/LF. Returns `None` on any malformed field.
    pub fn decode(buf: &str) -> Option<Self> {
        let buf = buf.trim_end_matches(['\r', '\n']);
        let ps: Vec<&str> = buf.splitn(5, ' ').collect();
        if ps.len() != 5 {
            return None;
        }
        Some(Self {
            term: ps[0].parse().ok()?,
            index: ps[1].parse().ok()?,
            commit: ps[2].parse().ok()?,
            entry_type: ps[3].parse().ok()?,
            data: ps[4].to_owned(),
        })
    }
}
