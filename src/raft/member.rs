//! Per-peer replication bookkeeping.

use serde::Serialize;

use super::Role;

/// Maximum in-flight AppendEntry messages per peer without an ack.
pub const SEND_WINDOW: i64 = 3;

/// What the local node knows about one peer.
///
/// Timers are in milliseconds and advanced by the tick driver. While this
/// node is leader, `match_index <= next_index - 1` holds after any ack and
/// `next_index >= 1` always.
#[derive(Debug, Clone, Serialize)]
pub struct Member {
    pub id: String,
    pub addr: String,
    /// Role hint learned from traffic, not authoritative.
    pub role: Role,
    /// Next log index to send to this peer.
    pub next_index: i64,
    /// Highest log index known replicated on this peer.
    pub match_index: i64,
    /// In-flight window for stop-and-wait replication.
    pub send_window: i64,
    #[serde(skip)]
    pub heartbeat_timer: u64,
    #[serde(skip)]
    pub replicate_timer: u64,
    /// Time since this peer was last heard from.
    #[serde(skip)]
    pub receive_timeout: u64,
}

impl Member {
    pub fn new(id: &str, addr: &str) -> Self {
        Self {
            id: id.to_owned(),
            addr: addr.to_owned(),
            role: Role::Follower,
            next_index: 1,
            match_index: 0,
            send_window: SEND_WINDOW,
            heartbeat_timer: 0,
            replicate_timer: 0,
            receive_timeout: 0,
        }
    }

    /// Zero all timers and restart replication bookkeeping.
    ///
    /// Called on every role transition, on member add and on snapshot
    /// install; `next_index` is the owning storage's `last_index + 1`.
    pub fn reset(&mut self, next_index: i64) {
        self.role = Role::Follower;
        self.next_index = next_index;
        self.match_index = 0;
        self.heartbeat_timer = 0;
        self.replicate_timer = 0;
        self.receive_timeout = 0;
    }
}
