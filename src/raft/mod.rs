//! Raft consensus: elections, replication, commit, snapshots.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ RaftDriver (ticker / communication loop / startup apply)      │
//! │                                                               │
//! │   ┌─────────────────────── Mutex ──────────────────────────┐  │
//! │   │ RaftNode                                               │  │
//! │   │   roles, terms, votes, per-peer Members                │  │
//! │   │   Storage ── entries, commit, @State ── Db             │  │
//! │   │      └─ apply ─> RaftHost (node) and Service           │  │
//! │   └────────────────────────────────────────────────────────┘  │
//! │        ▲ recv queue               │ send queue                │
//! └────────┼──────────────────────────┼───────────────────────────┘
//!          │                          ▼
//!        Transport (UDP datagrams, best effort)
//! ```
//!
//! # Key Components
//!
//! - [`RaftNode`]: the state machine — PreVote, elections, replication
//!   with a per-peer send window, quorum commit, membership changes.
//! - [`Storage`]: the durable log and the apply pipeline, calling back
//!   into its owner through [`RaftHost`].
//! - [`RaftDriver`]: the background tasks serializing everything over
//!   one mutex.
//! - [`Service`]: the upstream consumer of committed entries.

mod driver;
mod entry;
mod error;
mod member;
mod message;
mod node;
mod service;
mod snapshot;
mod state;
mod storage;

pub use driver::RaftDriver;
pub use entry::{Entry, EntryType};
pub use error::{RaftError, Result};
pub use member::{Member, SEND_WINDOW};
pub use message::{Message, MessageType};
pub use node::{NodeInfo, RaftConfig, RaftNode, Role};
pub use service::{MemService, Service};
pub use snapshot::Snapshot;
pub use state::State;
pub use storage::{RaftHost, Storage};
