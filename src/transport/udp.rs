//! UDP datagram transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Result, Transport, TransportError};
use crate::raft::Message;

/// Decoded frames buffered between the socket and the driver.
const RECV_QUEUE: usize = 64;

/// One UDP socket shared for sending and receiving.
///
/// The peer map uses `std::sync::RwLock` (not tokio): lookups are quick,
/// writes are rare, and `send` runs in synchronous context under the
/// node's communication loop.
pub struct UdpTransport {
    addr: String,
    socket: Arc<UdpSocket>,
    peers: RwLock<HashMap<String, SocketAddr>>,
    recv_rx: Option<mpsc::Receiver<Message>>,
    recv_task: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind a socket and start the receive task. Malformed datagrams are
    /// logged and dropped.
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE);

        let recv_socket = Arc::clone(&socket);
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = match recv_socket.recv_from(&mut buf).await {
                    Ok((n, _)) => n,
                    Err(err) => {
                        tracing::warn!(%err, "udp receive failed");
                        continue;
                    }
                };
                let Ok(data) = std::str::from_utf8(&buf[..n]) else {
                    tracing::warn!("non-utf8 datagram, dropping");
                    continue;
                };
                tracing::trace!(frame = %data.trim_end_matches(['\r', '\n']), "receive");
                match Message::decode(data) {
                    Some(msg) => {
                        if recv_tx.send(msg).await.is_err() {
                            return; // receiver gone, transport closed
                        }
                    }
                    None => tracing::warn!(frame = %data, "undecodable frame, dropping"),
                }
            }
        });

        tracing::info!(addr = %local, "udp transport listening");
        Ok(Self {
            addr: local.to_string(),
            socket,
            peers: RwLock::new(HashMap::new()),
            recv_rx: Some(recv_rx),
            recv_task,
        })
    }

    /// The bound local address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Channel of decoded inbound frames; taken once by the driver.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<Message>> {
        self.recv_rx.take()
    }

    /// Stop receiving. In-flight frames are dropped.
    pub fn close(&self) {
        self.recv_task.abort();
    }

    fn parse_addr(addr: &str) -> Result<SocketAddr> {
        addr.parse()
            .map_err(|_| TransportError::InvalidAddress(addr.to_owned()))
    }
}

impl Transport for UdpTransport {
    fn connect(&self, id: &str, addr: &str) {
        match Self::parse_addr(addr) {
            Ok(sock_addr) => {
                self.peers
                    .write()
                    .expect("peer map lock")
                    .insert(id.to_owned(), sock_addr);
            }
            Err(err) => tracing::warn!(peer = id, %err, "connect ignored"),
        }
    }

    fn disconnect(&self, id: &str) {
        self.peers.write().expect("peer map lock").remove(id);
    }

    fn send(&self, msg: &Message) -> bool {
        let addr = match self.peers.read().expect("peer map lock").get(&msg.dst) {
            Some(addr) => *addr,
            None => {
                tracing::debug!(dst = %msg.dst, "dst not connected");
                return false;
            }
        };

        let frame = msg.encode();
        tracing::trace!(%frame, "send");
        match self.socket.try_send_to(frame.as_bytes(), addr) {
            Ok(n) => n > 0,
            Err(err) => {
                tracing::debug!(dst = %msg.dst, %err, "udp send failed");
                false
            }
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}
