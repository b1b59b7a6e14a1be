//! Wire frames exchanged between nodes.
//!
//! A message encodes to a single UTF-8 datagram:
//!
//! ```text
//! <type> <src> <dst> <term> <prevTerm> <prevIndex> <data>
//! ```
//!
//! `data` is opaque (for `AppendEntry` it is a full encoded [`Entry`], for
//! `InstallSnapshot` an encoded [`crate::raft::Snapshot`]), so decoding
//! splits on at most seven fields.
//!
//! Constructors leave `src` and `term` empty; the node stamps them on
//! send, and fills `prevTerm`/`prevIndex` with its log tail when the
//! constructor did not set them.

use std::fmt;
use std::str::FromStr;

use super::Entry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    PreVote,
    PreVoteAck,
    RequestVote,
    RequestVoteAck,
    AppendEntry,
    AppendEntryAck,
    InstallSnapshot,
    /// Carries nothing but a term; sent back on stale-term messages.
    None,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::PreVote => "PreVote",
            MessageType::PreVoteAck => "PreVoteAck",
            MessageType::RequestVote => "RequestVote",
            MessageType::RequestVoteAck => "RequestVoteAck",
            MessageType::AppendEntry => "AppendEntry",
            MessageType::AppendEntryAck => "AppendEntryAck",
            MessageType::InstallSnapshot => "InstallSnapshot",
            MessageType::None => "None",
        };
        f.write_str(s)
    }
}

impl FromStr for MessageType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "PreVote" => Ok(MessageType::PreVote),
            "PreVoteAck" => Ok(MessageType::PreVoteAck),
            "RequestVote" => Ok(MessageType::RequestVote),
            "RequestVoteAck" => Ok(MessageType::RequestVoteAck),
            "AppendEntry" => Ok(MessageType::AppendEntry),
            "AppendEntryAck" => Ok(MessageType::AppendEntryAck),
            "InstallSnapshot" => Ok(MessageType::InstallSnapshot),
            "None" => Ok(MessageType::None),
            _ => Err(()),
        }
    }
}

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub src: String,
    pub dst: String,
    pub term: i32,
    pub prev_term: i32,
    pub prev_index: i64,
    pub data: String,
}

impl Message {
    fn new(msg_type: MessageType, dst: &str, data: &str) -> Self {
        Self {
            msg_type,
            src: String::new(),
            dst: dst.to_owned(),
            term: 0,
            prev_term: 0,
            prev_index: 0,
            data: data.to_owned(),
        }
    }

    /// Broadcast probe before bumping the term.
    pub fn pre_vote(dst: &str) -> Self {
        Self::new(MessageType::PreVote, dst, "true")
    }

    pub fn pre_vote_ack(dst: &str) -> Self {
        Self::new(MessageType::PreVoteAck, dst, "true")
    }

    /// Vote request; the node fills `prevTerm`/`prevIndex` with its log
    /// tail so peers can compare up-to-dateness.
    pub fn request_vote(dst: &str) -> Self {
        Self::new(MessageType::RequestVote, dst, "")
    }

    pub fn request_vote_ack(dst: &str, granted: bool) -> Self {
        Self::new(
            MessageType::RequestVoteAck,
            dst,
            if granted { "grant" } else { "reject" },
        )
    }

    /// Replicate one entry, with the entry just below it as `prev`.
    pub fn append_entry(dst: &str, ent: &Entry, prev: Option<&Entry>) -> Self {
        let mut msg = Self::new(MessageType::AppendEntry, dst, &ent.encode());
        if let Some(prev) = prev {
            msg.prev_term = prev.term;
            msg.prev_index = prev.index;
        }
        msg
    }

    pub fn append_entry_ack(dst: &str, success: bool) -> Self {
        Self::new(
            MessageType::AppendEntryAck,
            dst,
            if success { "true" } else { "false" },
        )
    }

    pub fn install_snapshot(dst: &str, data: &str) -> Self {
        Self::new(MessageType::InstallSnapshot, dst, data)
    }

    pub fn none(dst: &str) -> Self {
        Self::new(MessageType::None, dst, "")
    }

    /// Encode as a single datagram line.
    pub fn encode(&self) -> String {
        format!(
            "{} {} {} {} {} {} {}",
            self.msg_type, self.src, self.dst, self.term, self.prev_term, self.prev_index, self.data
        )
    }

    /// Decode a datagram produced by [`Message::encode`].
    ///
    /// Tolerates a trailing CR/LF. Returns `None` on any malformed field.
    pub fn decode(buf: &str) -> Option<Self> {
        let buf = buf.trim_end_matches(['\r', '\n']);
        let ps: Vec<&str> = buf.splitn(7, ' ').collect();
        if ps.len() != 7 {
            return None;
        }
        Some(Self {
            msg_type: ps[0].parse().ok()?,
            src: ps[1].to_owned(),
            dst: ps[2].to_owned(),
            term: ps[3].parse().ok()?,
            prev_term: ps[4].parse().ok()?,
            prev_index: ps[5].parse().ok()?,
            data: ps[6].to_owned(),
        })
    }
}
