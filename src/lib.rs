//! Quorum Raft: a replicated log engine.
//!
//! This crate maintains a consistent, ordered log across a small group of
//! nodes and applies committed entries to a pluggable upstream service.
//!
//! 1. **Raft node** ([`raft`]): leader election with a PreVote stage, log
//!    replication with a small per-peer send window, quorum commit, and
//!    snapshot install.
//!
//! 2. **Log storage** ([`raft::Storage`]): persists durable state, entries
//!    and commit progress through a flat key/value [`storage::Db`], and
//!    drives apply into both the node and the attached service.
//!
//! 3. **Transport** ([`transport`]): a line-oriented datagram contract with
//!    a UDP implementation. Loss, reordering and duplication are all
//!    tolerated by the protocol.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use quorum_raft::prelude::*;
//!
//! let db = RedbDb::open("/var/lib/quorum/raft.redb")?;
//! let config = RaftConfig::new("n1", "127.0.0.1:8001");
//! let mut node = RaftNode::new(config, Box::new(db))?;
//!
//! // First operation on a fresh node: add itself, becoming leader.
//! node.add_member("n1", "127.0.0.1:8001")?;
//! ```
//!
//! Wire formats are UTF-8 text lines; see [`raft::Entry`] and
//! [`raft::Message`] for the exact field layout.

pub mod raft;
pub mod storage;
pub mod transport;

/// Re-export commonly used types for convenience.
pub mod prelude {
    pub use crate::raft::{
        Entry, EntryType, Member, Message, MessageType, RaftConfig, RaftDriver, RaftError,
        RaftNode, Role, Service, Snapshot, State,
    };
    pub use crate::storage::{Db, MemDb, RedbDb, StorageError};
    pub use crate::transport::{Transport, TransportError, UdpTransport};
}
