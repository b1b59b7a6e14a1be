//! Background tasks that drive a [`RaftNode`].
//!
//! Three cooperating activities share the node through one coarse mutex:
//!
//! 1. **Ticker** — fires every `tick_interval`, advances all timers.
//! 2. **Communication loop** — selects on the storage doorbell and the
//!    inbound queue; replicates or dispatches under the lock.
//! 3. **Startup apply** — a one-shot catch-up of committed entries after
//!    a restart.
//!
//! Two pump tasks bridge the node's queues to the transport: outbound
//! frames go to [`Transport::send`], inbound frames come from the
//! transport's receive channel.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::{RaftError, RaftNode, Result};
use crate::transport::Transport;

/// Owns the spawned tasks around a shared [`RaftNode`].
pub struct RaftDriver {
    node: Arc<Mutex<RaftNode>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl RaftDriver {
    /// Spawn the ticker, communication loop, startup apply and transport
    /// pumps. `transport_rx` is the transport's decoded receive channel.
    pub fn spawn(
        mut node: RaftNode,
        transport: Arc<dyn Transport>,
        transport_rx: mpsc::Receiver<super::Message>,
    ) -> Result<Self> {
        let tick_interval = node.config().tick_interval;
        let mut notify_rx = node
            .take_notify_receiver()
            .ok_or_else(|| RaftError::InvalidState("notify receiver already taken".to_owned()))?;
        let mut recv_rx = node
            .take_recv_receiver()
            .ok_or_else(|| RaftError::InvalidState("recv receiver already taken".to_owned()))?;
        let mut send_rx = node
            .take_send_receiver()
            .ok_or_else(|| RaftError::InvalidState("send receiver already taken".to_owned()))?;
        let recv_tx = node.recv_sender();

        let node = Arc::new(Mutex::new(node));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        // startup apply: catch up after restart
        {
            let node = Arc::clone(&node);
            handles.push(tokio::spawn(async move {
                tracing::info!("apply logs on startup");
                if let Err(err) = node.lock().await.apply_entries() {
                    tracing::error!(%err, "startup apply failed");
                }
            }));
        }

        // ticker
        {
            let node = Arc::clone(&node);
            let mut shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick_interval);
                let elapsed_ms = tick_interval.as_millis() as u64;
                tracing::info!(interval_ms = elapsed_ms, "setup ticker");
                loop {
                    tokio::select! {
                        _ = interval.tick() => {}
                        _ = shutdown.changed() => break,
                    }
                    if let Err(err) = node.lock().await.tick(elapsed_ms) {
                        tracing::error!(%err, "tick failed");
                    }
                }
            }));
        }

        // communication loop: doorbell wakes replication, inbound queue
        // feeds dispatch
        {
            let node = Arc::clone(&node);
            let mut shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                tracing::info!("setup communication");
                loop {
                    tokio::select! {
                        pulse = notify_rx.recv() => {
                            if pulse.is_none() {
                                break;
                            }
                            if let Err(err) = node.lock().await.replicate_all() {
                                tracing::error!(%err, "replication failed");
                            }
                        }
                        msg = recv_rx.recv() => {
                            let Some(msg) = msg else { break };
                            if let Err(err) = node.lock().await.handle_message(msg) {
                                tracing::error!(%err, "message handling failed");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // outbound pump: node -> transport
        {
            let transport = Arc::clone(&transport);
            let mut shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = send_rx.recv() => {
                            let Some(msg) = msg else { break };
                            if !transport.send(&msg) {
                                tracing::debug!(dst = %msg.dst, "transport send failed");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // inbound pump: transport -> node
        {
            let mut transport_rx = transport_rx;
            let mut shutdown = shutdown_rx;
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = transport_rx.recv() => {
                            let Some(msg) = msg else { break };
                            // a full inbound queue drops the frame; the
                            // sender retries through its own timers
                            let _ = recv_tx.try_send(msg);
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        Ok(Self {
            node,
            shutdown_tx,
            handles,
        })
    }

    /// The shared node, for quorum operations and status queries.
    pub fn node(&self) -> Arc<Mutex<RaftNode>> {
        Arc::clone(&self.node)
    }

    /// Signal all tasks to stop and wait for them.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        if let Err(err) = self.node.lock().await.close() {
            tracing::error!(%err, "close failed");
        }
    }
}
