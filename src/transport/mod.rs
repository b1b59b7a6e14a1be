//! Datagram transport for Raft messages.
//!
//! The node only needs a best-effort contract: [`Transport::send`] may
//! lose, reorder or duplicate frames, and decoded inbound frames arrive
//! on a receive channel. [`UdpTransport`] is the concrete implementation;
//! tests substitute in-memory pumps.

mod udp;

pub use udp::UdpTransport;

use thiserror::Error;

use crate::raft::Message;

/// Transport error types.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Binding or reading the socket failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A peer address did not parse.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Best-effort message delivery to known peers.
///
/// `send` returns whether the frame was handed to the network; delivery
/// is never guaranteed. Safe to call from the communication loop only.
pub trait Transport: Send + Sync {
    /// Register (or update) the address for a peer id.
    fn connect(&self, id: &str, addr: &str);

    /// Forget a peer id.
    fn disconnect(&self, id: &str);

    /// Encode and send one frame to `msg.dst`.
    fn send(&self, msg: &Message) -> bool;
}
