//! The Raft node state machine.
//!
//! One [`RaftNode`] owns its [`Storage`] and all protocol state. Every
//! mutation — timer ticks, message dispatch, quorum operations — happens
//! under a single coarse lock held by the caller (see
//! [`RaftDriver`](super::RaftDriver)). The node talks to the world through
//! three bounded queues: an inbound message queue, an outbound message
//! queue, and the storage doorbell that wakes replication.
//!
//! The flow of a write: a leader appends locally, the doorbell fires,
//! [`RaftNode::replicate_all`] streams entries to each peer inside its
//! send window, acks advance `match_index`, and once a quorum of match
//! indices covers an entry appended in the current term the commit index
//! moves and apply runs synchronously.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;

use super::{
    Entry, EntryType, Member, Message, MessageType, RaftError, RaftHost, Result, Service,
    Snapshot, State, Storage,
};
use crate::storage::Db;

/// Capacity of the inbound and outbound message queues. Saturation drops
/// messages; the protocol recovers through heartbeats and resends.
const MSG_QUEUE: usize = 16;

/// Role of a Raft node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts entries from the leader, votes when asked.
    Follower,
    /// Requesting votes after winning a PreVote round.
    Candidate,
    /// Replicates the log and advances the commit index.
    Leader,
}

/// Configuration for a Raft node.
///
/// The defaults are the protocol constants; tests shrink them.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Unique node id within the group.
    pub id: String,

    /// Address peers use to reach this node.
    pub addr: String,

    /// Idle time before a follower starts a PreVote round.
    pub election_timeout_ms: u64,

    /// Leader idle time per peer before sending a heartbeat ping.
    pub heartbeat_timeout_ms: u64,

    /// Leader retry interval for replication to a silent peer.
    pub replication_timeout_ms: u64,

    /// How often the tick driver fires.
    pub tick_interval: Duration,
}

impl RaftConfig {
    pub fn new(id: &str, addr: &str) -> Self {
        Self {
            id: id.to_owned(),
            addr: addr.to_owned(),
            election_timeout_ms: 5000,
            heartbeat_timeout_ms: 4000,
            replication_timeout_ms: 1000,
            tick_interval: Duration::from_millis(100),
        }
    }

    /// How long a peer may stay silent before it counts as unreachable.
    pub fn receive_timeout_ms(&self) -> u64 {
        self.heartbeat_timeout_ms * 3
    }
}

/// Protocol state of the node, separated from [`Storage`] so storage can
/// call back into it through [`RaftHost`] without a reference cycle.
pub(crate) struct NodeCore {
    id: String,
    addr: String,
    role: Role,
    term: i32,
    vote_for: String,
    members: HashMap<String, Member>,
    votes_received: HashMap<String, String>,
    election_timer: u64,
    last_applied: i64,
}

impl NodeCore {
    fn add_member(&mut self, id: &str, addr: &str) {
        if id == self.id || self.members.contains_key(id) {
            return;
        }
        tracing::info!(member = id, addr, "add member");
        self.members.insert(id.to_owned(), Member::new(id, addr));
    }

    fn remove_member(&mut self, id: &str) {
        if id == self.id {
            return;
        }
        if self.members.remove(id).is_some() {
            tracing::info!(member = id, "disconnect member");
        }
    }

    /// The peer this node currently believes is leader, if any.
    fn leader_hint(&self) -> Option<String> {
        self.members
            .values()
            .find(|m| m.role == Role::Leader)
            .map(|m| m.id.clone())
    }
}

impl RaftHost for NodeCore {
    fn current_term(&self) -> i32 {
        self.term
    }

    fn last_applied(&self) -> i64 {
        self.last_applied
    }

    fn apply_entry(&mut self, ent: &Entry) -> bool {
        self.last_applied = ent.index;
        match ent.entry_type {
            EntryType::AddMember => {
                tracing::info!(entry = %ent.encode(), "apply");
                let mut ps = ent.data.splitn(2, ' ');
                if let (Some(id), Some(addr)) = (ps.next(), ps.next()) {
                    self.add_member(id, addr);
                }
                true
            }
            EntryType::DelMember => {
                tracing::info!(entry = %ent.encode(), "apply");
                // the removed node never sees the commit that excised it;
                // it detects orphaning by election timeout with no peers
                let id = ent.data.clone();
                self.remove_member(&id);
                true
            }
            _ => false,
        }
    }

    fn persistent_state(&self) -> State {
        let mut state = State {
            term: self.term,
            vote_for: self.vote_for.clone(),
            ..Default::default()
        };
        state.members.insert(self.id.clone(), self.addr.clone());
        for m in self.members.values() {
            state.members.insert(m.id.clone(), m.addr.clone());
        }
        state
    }
}

/// Point-in-time view of a node, serializable for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub id: String,
    pub addr: String,
    pub role: Role,
    pub term: i32,
    pub vote_for: String,
    pub last_applied: i64,
    pub commit_index: i64,
    pub last_term: i32,
    pub last_index: i64,
    pub members: Vec<Member>,
}

/// A Raft consensus node.
pub struct RaftNode {
    config: RaftConfig,
    core: NodeCore,
    store: Storage,

    send_tx: mpsc::Sender<Message>,
    send_rx: Option<mpsc::Receiver<Message>>,
    recv_tx: mpsc::Sender<Message>,
    recv_rx: Option<mpsc::Receiver<Message>>,
}

impl RaftNode {
    /// Create a node, restoring term, vote, membership and the commit
    /// cursor from the Db.
    pub fn new(config: RaftConfig, db: Box<dyn Db>) -> Result<Self> {
        let store = Storage::new(db)?;
        let (send_tx, send_rx) = mpsc::channel(MSG_QUEUE);
        let (recv_tx, recv_rx) = mpsc::channel(MSG_QUEUE);

        let mut core = NodeCore {
            id: config.id.clone(),
            addr: config.addr.clone(),
            role: Role::Follower,
            term: store.state().term,
            vote_for: store.state().vote_for.clone(),
            members: HashMap::new(),
            votes_received: HashMap::new(),
            election_timer: 0,
            last_applied: store.commit_index(),
        };
        let peers: Vec<(String, String)> = store
            .state()
            .members
            .iter()
            .map(|(id, addr)| (id.clone(), addr.clone()))
            .collect();
        for (id, addr) in peers {
            core.add_member(&id, &addr);
        }

        tracing::info!(
            id = %core.id,
            term = core.term,
            commit = store.commit_index(),
            last_term = store.last_term(),
            last_index = store.last_index(),
            "init raft node"
        );

        Ok(Self {
            config,
            core,
            store,
            send_tx,
            send_rx: Some(send_rx),
            recv_tx,
            recv_rx: Some(recv_rx),
        })
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn addr(&self) -> &str {
        &self.core.addr
    }

    pub fn role(&self) -> Role {
        self.core.role
    }

    pub fn is_leader(&self) -> bool {
        self.core.role == Role::Leader
    }

    pub fn term(&self) -> i32 {
        self.core.term
    }

    pub fn last_applied(&self) -> i64 {
        self.core.last_applied
    }

    pub fn commit_index(&self) -> i64 {
        self.store.commit_index()
    }

    pub fn first_index(&self) -> i64 {
        self.store.first_index()
    }

    pub fn last_index(&self) -> i64 {
        self.store.last_index()
    }

    pub fn last_term(&self) -> i32 {
        self.store.last_term()
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Entry accessor, mainly for verification in tests and tooling.
    pub fn entry(&self, index: i64) -> Option<&Entry> {
        self.store.get_entry(index)
    }

    /// Attach the upstream service consuming committed entries.
    pub fn set_service(&mut self, svc: Box<dyn Service>) {
        self.store.set_service(svc);
    }

    /// Sender the transport pushes decoded inbound messages into.
    pub fn recv_sender(&self) -> mpsc::Sender<Message> {
        self.recv_tx.clone()
    }

    /// The inbound queue; taken once by the driver.
    pub fn take_recv_receiver(&mut self) -> Option<mpsc::Receiver<Message>> {
        self.recv_rx.take()
    }

    /// The outbound queue; taken once by the driver.
    pub fn take_send_receiver(&mut self) -> Option<mpsc::Receiver<Message>> {
        self.send_rx.take()
    }

    /// The storage doorbell; taken once by the driver.
    pub fn take_notify_receiver(&mut self) -> Option<mpsc::Receiver<()>> {
        self.store.take_notify_receiver()
    }

    /// Catch up apply after a restart.
    pub fn apply_entries(&mut self) -> Result<()> {
        self.store.apply_entries(&mut self.core)
    }

    /// Status snapshot; members are sorted for deterministic output.
    pub fn info(&self) -> NodeInfo {
        let mut members: Vec<Member> = self.core.members.values().cloned().collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        NodeInfo {
            id: self.core.id.clone(),
            addr: self.core.addr.clone(),
            role: self.core.role,
            term: self.core.term,
            vote_for: self.core.vote_for.clone(),
            last_applied: self.core.last_applied,
            commit_index: self.store.commit_index(),
            last_term: self.store.last_term(),
            last_index: self.store.last_index(),
            members,
        }
    }

    /// Persist state one last time and release the Db.
    pub fn close(&mut self) -> Result<()> {
        self.store.close(&self.core)
    }

    /* ---------------- timers ---------------- */

    /// Advance all timers by `elapsed_ms`. Called by the tick driver.
    pub fn tick(&mut self, elapsed_ms: u64) -> Result<()> {
        // receive timers run on every role so PreVote checks can tell
        // whether a leader has been heard from recently
        for m in self.core.members.values_mut() {
            m.receive_timeout += elapsed_ms;
        }

        match self.core.role {
            Role::Follower | Role::Candidate => {
                if !self.core.members.is_empty() {
                    self.core.election_timer += elapsed_ms;
                    if self.core.election_timer >= self.config.election_timeout_ms {
                        tracing::info!(id = %self.core.id, "election timeout, start prevote");
                        self.start_pre_vote()?;
                    }
                }
            }
            Role::Leader => {
                let ids: Vec<String> = self.core.members.keys().cloned().collect();
                for id in ids {
                    let (receive_timeout, replicate_timer, match_index, next_index) = {
                        let Some(m) = self.core.members.get_mut(&id) else {
                            continue;
                        };
                        m.replicate_timer += elapsed_ms;
                        m.heartbeat_timer += elapsed_ms;
                        (m.receive_timeout, m.replicate_timer, m.match_index, m.next_index)
                    };

                    if receive_timeout < self.config.receive_timeout_ms()
                        && replicate_timer >= self.config.replication_timeout_ms
                    {
                        if match_index != 0 && next_index != match_index + 1 {
                            tracing::info!(
                                member = %id,
                                next = next_index,
                                matched = match_index,
                                "resend from match index"
                            );
                            if let Some(m) = self.core.members.get_mut(&id) {
                                m.next_index = match_index + 1;
                            }
                        }
                        self.replicate_member(&id)?;
                    }

                    let heartbeat_timer = self
                        .core
                        .members
                        .get(&id)
                        .map(|m| m.heartbeat_timer)
                        .unwrap_or(0);
                    if heartbeat_timer >= self.config.heartbeat_timeout_ms {
                        self.ping_member(&id);
                    }
                }
            }
        }
        Ok(())
    }

    /* ---------------- elections ---------------- */

    fn start_pre_vote(&mut self) -> Result<()> {
        self.core.election_timer = 0;
        self.core.role = Role::Follower;
        self.core.votes_received.clear();
        self.broadcast(Message::pre_vote);

        // a group of one elects itself
        if self.core.members.is_empty() {
            self.start_election()?;
        }
        Ok(())
    }

    fn start_election(&mut self) -> Result<()> {
        // stagger restarts so split candidates don't stay in lock-step
        self.core.election_timer = rand::thread_rng().gen_range(0..200);
        self.core.votes_received.clear();

        self.core.role = Role::Candidate;
        self.core.term += 1;
        self.core.vote_for = self.core.id.clone();
        self.store.save_state(&self.core)?;

        self.reset_all_members();
        self.broadcast(Message::request_vote);

        if self.core.members.is_empty() {
            self.check_vote_result()?;
        }
        Ok(())
    }

    fn check_vote_result(&mut self) -> Result<()> {
        let grant = 1 + self
            .core
            .votes_received
            .values()
            .filter(|v| v.as_str() == "grant")
            .count();
        let reject = self.core.votes_received.len() + 1 - grant;
        let total = self.core.members.len() + 1;

        if grant > total / 2 {
            self.become_leader()?;
        } else if reject > self.core.members.len() / 2 {
            tracing::info!(grant, reject, total, "election lost");
            self.become_follower();
        }
        Ok(())
    }

    fn become_follower(&mut self) {
        if self.core.role == Role::Follower {
            return;
        }
        tracing::info!(id = %self.core.id, "became follower");
        self.core.role = Role::Follower;
        self.core.election_timer = 0;
        self.reset_all_members();
    }

    fn become_leader(&mut self) -> Result<()> {
        tracing::info!(id = %self.core.id, term = self.core.term, "became leader");

        self.core.role = Role::Leader;
        self.core.election_timer = 0;
        self.reset_all_members();
        let last = self.store.last_index();
        for m in self.core.members.values_mut() {
            // start one below the usual next so the first AppendEntry
            // carries the current tail as prev
            m.next_index = last;
        }

        if last == 0 || last != self.store.commit_index() {
            // a noop in the new term implicitly commits prior-term entries
            self.store.append_entry(&self.core, EntryType::Noop, "")?;
        } else {
            self.ping_all_members();
        }
        Ok(())
    }

    fn reset_all_members(&mut self) {
        let next_index = self.store.last_index() + 1;
        for m in self.core.members.values_mut() {
            m.reset(next_index);
        }
    }

    /* ---------------- replication ---------------- */

    fn ping_all_members(&mut self) {
        let ids: Vec<String> = self.core.members.keys().cloned().collect();
        for id in ids {
            self.ping_member(&id);
        }
    }

    fn ping_member(&mut self, id: &str) {
        let Some(m) = self.core.members.get_mut(id) else {
            return;
        };
        m.heartbeat_timer = 0;

        let ent = Entry::ping(self.store.commit_index());
        let prev = self.store.get_entry(self.store.last_index()).cloned();
        let msg = Message::append_entry(id, &ent, prev.as_ref());
        self.send(msg);
    }

    /// Stream pending entries to every peer; a group of one commits its
    /// own tail directly. Called when the storage doorbell fires.
    pub fn replicate_all(&mut self) -> Result<()> {
        let ids: Vec<String> = self.core.members.keys().cloned().collect();
        for id in &ids {
            self.replicate_member(id)?;
        }
        if ids.is_empty() {
            let last = self.store.last_index();
            self.store.commit_entry(&mut self.core, last)?;
        }
        Ok(())
    }

    fn replicate_member(&mut self, id: &str) -> Result<()> {
        let (mut next_index, match_index, send_window) = {
            let Some(m) = self.core.members.get_mut(id) else {
                return Ok(());
            };
            if m.match_index != 0 && m.next_index - m.match_index > m.send_window {
                tracing::debug!(
                    member = %id,
                    next = m.next_index,
                    matched = m.match_index,
                    "send window full, stop and wait"
                );
                return Ok(());
            }
            m.replicate_timer = 0;
            (m.next_index, m.match_index, m.send_window)
        };

        let max_index = next_index.max(match_index + send_window);
        let mut sent = false;
        while next_index <= max_index {
            let Some(ent) = self.store.get_entry(next_index) else {
                break;
            };
            let mut ent = ent.clone();
            ent.commit = self.store.commit_index();

            let prev = self.store.get_entry(next_index - 1).cloned();
            let msg = Message::append_entry(id, &ent, prev.as_ref());
            self.send(msg);

            next_index += 1;
            sent = true;
        }

        if let Some(m) = self.core.members.get_mut(id) {
            m.next_index = next_index;
            if sent {
                m.heartbeat_timer = 0;
            }
        }
        Ok(())
    }

    /* ---------------- message dispatch ---------------- */

    /// Process one inbound message. Unknown sources are dropped; term
    /// reconciliation runs before role dispatch.
    pub fn handle_message(&mut self, msg: Message) -> Result<()> {
        if msg.dst != self.core.id || !self.core.members.contains_key(&msg.src) {
            tracing::debug!(src = %msg.src, dst = %msg.dst, "drop message from unknown source");
            return Ok(());
        }

        if msg.term < self.core.term {
            tracing::debug!(
                msg_type = %msg.msg_type,
                msg_term = msg.term,
                term = self.core.term,
                "reject stale term"
            );
            let none = Message::none(&msg.src);
            self.send(none);
            return Ok(());
        }
        if msg.term > self.core.term {
            tracing::info!(msg_term = msg.term, term = self.core.term, "adopt greater term");
            self.core.term = msg.term;
            self.core.vote_for.clear();
            self.become_follower();
            self.store.save_state(&self.core)?;
        }
        if msg.msg_type == MessageType::None {
            return Ok(());
        }

        match self.core.role {
            Role::Leader => match msg.msg_type {
                MessageType::AppendEntryAck => self.handle_append_entry_ack(&msg),
                MessageType::PreVote => self.handle_pre_vote(&msg),
                _ => {
                    tracing::debug!(msg = %msg.encode(), "drop message");
                    Ok(())
                }
            },
            Role::Candidate => match msg.msg_type {
                MessageType::RequestVoteAck => self.handle_request_vote_ack(&msg),
                _ => {
                    tracing::debug!(msg = %msg.encode(), "drop message");
                    Ok(())
                }
            },
            Role::Follower => match msg.msg_type {
                MessageType::RequestVote => self.handle_request_vote(&msg),
                MessageType::AppendEntry => self.handle_append_entry(&msg),
                MessageType::InstallSnapshot => self.handle_install_snapshot(&msg),
                MessageType::PreVote => self.handle_pre_vote(&msg),
                MessageType::PreVoteAck => self.handle_pre_vote_ack(&msg),
                _ => {
                    tracing::debug!(msg = %msg.encode(), "drop message");
                    Ok(())
                }
            },
        }
    }

    /* ---------------- prevote and votes ---------------- */

    fn handle_pre_vote(&mut self, msg: &Message) -> Result<()> {
        if self.core.role == Role::Leader {
            // answer only if the median receive timeout says we lost
            // contact with a majority of our followers
            let mut timeouts: Vec<u64> = vec![0]; // self
            timeouts.extend(self.core.members.values().map(|m| m.receive_timeout));
            timeouts.sort_unstable();
            let median = timeouts[timeouts.len() / 2];
            if median < self.config.receive_timeout_ms() {
                tracing::debug!(?timeouts, "majority of followers reachable, ignore prevote");
                return Ok(());
            }
        }
        if self
            .core
            .members
            .values()
            .any(|m| m.role == Role::Leader && m.receive_timeout < self.config.receive_timeout_ms())
        {
            tracing::debug!(src = %msg.src, "leader still active, ignore prevote");
            return Ok(());
        }
        let ack = Message::pre_vote_ack(&msg.src);
        self.send(ack);
        Ok(())
    }

    fn handle_pre_vote_ack(&mut self, msg: &Message) -> Result<()> {
        tracing::info!(src = %msg.src, "prevote ack");
        self.core
            .votes_received
            .insert(msg.src.clone(), msg.data.clone());
        if self.core.votes_received.len() + 1 > (self.core.members.len() + 1) / 2 {
            self.start_election()?;
        }
        Ok(())
    }

    fn handle_request_vote(&mut self, msg: &Message) -> Result<()> {
        // a repeated RequestVote from the node we voted for is answered
        // again; anyone else is ignored for the rest of the term
        if !self.core.vote_for.is_empty() && self.core.vote_for != msg.src {
            tracing::debug!(voted = %self.core.vote_for, src = %msg.src, "already voted, ignore");
            return Ok(());
        }

        // the candidate's log must be at least as up-to-date as ours
        let granted = msg.prev_term > self.store.last_term()
            || (msg.prev_term == self.store.last_term()
                && msg.prev_index >= self.store.last_index());

        if granted {
            self.core.election_timer = 0;
            tracing::info!(candidate = %msg.src, term = self.core.term, "vote");
            self.core.vote_for = msg.src.clone();
            self.store.save_state(&self.core)?;
            let ack = Message::request_vote_ack(&msg.src, true);
            self.send(ack);
        } else {
            let ack = Message::request_vote_ack(&msg.src, false);
            self.send(ack);
        }
        Ok(())
    }

    fn handle_request_vote_ack(&mut self, msg: &Message) -> Result<()> {
        tracing::info!(vote = %msg.data, src = %msg.src, "vote ack");
        self.core
            .votes_received
            .insert(msg.src.clone(), msg.data.clone());
        self.check_vote_result()
    }

    /* ---------------- append entries ---------------- */

    /// NACK whose prev fields realign the leader without a binary search:
    /// our tail when we are simply behind, or the entry just below the
    /// mismatched point when our log diverges (the leader then walks back
    /// one entry per round until truncation can repair the conflict).
    fn send_duplicated_ack(&mut self, msg: &Message) {
        let prev = if msg.prev_index <= self.store.last_index() {
            self.store.get_entry(msg.prev_index - 1).cloned()
        } else {
            self.store.get_entry(self.store.last_index()).cloned()
        };

        let mut ack = Message::append_entry_ack(&msg.src, false);
        if let Some(prev) = prev {
            ack.prev_term = prev.term;
            ack.prev_index = prev.index;
        }
        self.send(ack);
    }

    fn handle_append_entry(&mut self, msg: &Message) -> Result<()> {
        self.core.election_timer = 0;
        let src = msg.src.clone();
        for (id, m) in self.core.members.iter_mut() {
            if *id == src {
                m.role = Role::Leader;
                m.receive_timeout = 0;
            } else {
                m.role = Role::Follower;
            }
        }

        // the consistency check applies above the commit line
        if msg.prev_index > self.store.commit_index() {
            if msg.prev_index != self.store.last_index() {
                tracing::debug!(
                    prev_index = msg.prev_index,
                    last_index = self.store.last_index(),
                    "non-continuous entry"
                );
                self.send_duplicated_ack(msg);
                return Ok(());
            }
            match self.store.get_entry(msg.prev_index).map(|e| e.term) {
                None => {
                    tracing::debug!(
                        prev_term = msg.prev_term,
                        prev_index = msg.prev_index,
                        "prev entry not found"
                    );
                    self.send_duplicated_ack(msg);
                    return Ok(());
                }
                Some(term) if term != msg.prev_term => {
                    tracing::debug!(
                        prev_index = msg.prev_index,
                        ours = term,
                        theirs = msg.prev_term,
                        "prev term mismatch"
                    );
                    self.send_duplicated_ack(msg);
                    return Ok(());
                }
                _ => {}
            }
        }

        let Some(ent) = Entry::decode(&msg.data) else {
            tracing::warn!(data = %msg.data, "undecodable entry, dropping");
            return Ok(());
        };

        if ent.entry_type == EntryType::Ping {
            let ack = Message::append_entry_ack(&src, true);
            self.send(ack);
        } else {
            if ent.index < self.store.commit_index() {
                tracing::debug!(
                    index = ent.index,
                    commit = self.store.commit_index(),
                    "entry below commit"
                );
                self.send_duplicated_ack(msg);
                return Ok(());
            }

            if let Some(old_term) = self.store.get_entry(ent.index).map(|e| e.term) {
                if old_term != ent.term {
                    // a conflicting uncommitted entry and everything
                    // after it make way for the leader's log
                    self.store.truncate_from(ent.index)?;
                } else {
                    tracing::debug!(term = ent.term, index = ent.index, "duplicated entry");
                }
            }
            self.store.write_entry(ent.clone())?;
            let ack = Message::append_entry_ack(&src, true);
            self.send(ack);
        }

        self.store.commit_entry(&mut self.core, ent.commit)
    }

    fn handle_append_entry_ack(&mut self, msg: &Message) -> Result<()> {
        let src = msg.src.clone();
        {
            let Some(m) = self.core.members.get_mut(&src) else {
                return Ok(());
            };
            m.receive_timeout = 0;
        }

        if msg.data == "false" {
            // use the follower's hint to realign
            if let Some(m) = self.core.members.get_mut(&src) {
                tracing::info!(
                    member = %src,
                    from = m.next_index,
                    to = msg.prev_index + 1,
                    "reset next index"
                );
                m.next_index = msg.prev_index + 1;
            }
        } else {
            let match_index = {
                let Some(m) = self.core.members.get_mut(&src) else {
                    return Ok(());
                };
                m.match_index = m.match_index.max(msg.prev_index);
                m.next_index = m.next_index.max(m.match_index + 1);
                m.match_index
            };

            if match_index > self.store.commit_index() {
                let quorum_index = self.quorum_match_index();
                if quorum_index > self.store.commit_index() {
                    // only an entry appended in our own term may be the
                    // commit target; earlier terms commit implicitly
                    let current_term =
                        self.store.get_entry(quorum_index).map(|e| e.term) == Some(self.core.term);
                    if current_term {
                        self.store.commit_entry(&mut self.core, quorum_index)?;

                        if match_index == self.store.last_index() {
                            // fully caught up: heartbeat the new commit out
                            self.ping_member(&src);
                            return Ok(());
                        }
                    }
                }
            }
        }

        if msg.prev_index == 0 {
            tracing::info!(member = %src, "brand-new follower, sending snapshot");
            return self.send_install_snapshot(&src);
        }
        let next_index = self
            .core
            .members
            .get(&src)
            .map(|m| m.next_index)
            .unwrap_or(0);
        if next_index < self.store.first_index() {
            tracing::info!(member = %src, next_index, "follower behind first index, sending snapshot");
            return self.send_install_snapshot(&src);
        }
        self.replicate_member(&src)
    }

    /// Median of `[last_index, peer match indices...]` in descending
    /// order: the highest index a strict majority has stored. Sorted
    /// explicitly so quorum never depends on map iteration order.
    fn quorum_match_index(&self) -> i64 {
        let mut match_indices: Vec<i64> = Vec::with_capacity(self.core.members.len() + 1);
        match_indices.push(self.store.last_index());
        match_indices.extend(self.core.members.values().map(|m| m.match_index));
        match_indices.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = match_indices[match_indices.len() / 2];
        tracing::debug!(?match_indices, quorum, "quorum match index");
        quorum
    }

    /* ---------------- snapshots ---------------- */

    fn send_install_snapshot(&mut self, dst: &str) -> Result<()> {
        let sn = self.store.create_snapshot();
        match sn.encode() {
            Ok(data) => {
                let msg = Message::install_snapshot(dst, &data);
                self.send(msg);
            }
            Err(err) => {
                // the peer stays behind until a later ack retries
                tracing::error!(%err, "snapshot encode failed");
            }
        }
        Ok(())
    }

    fn handle_install_snapshot(&mut self, msg: &Message) -> Result<()> {
        let Some(sn) = Snapshot::decode(&msg.data) else {
            // no ack: the leader will retry
            tracing::warn!(src = %msg.src, "undecodable snapshot, dropping");
            return Ok(());
        };
        self.install_snapshot_state(&sn)?;
        let ack = Message::append_entry_ack(&msg.src, true);
        self.send(ack);
        Ok(())
    }

    fn install_snapshot_state(&mut self, sn: &Snapshot) -> Result<()> {
        tracing::info!(
            last_term = sn.last_term(),
            last_index = sn.last_index(),
            "install raft snapshot"
        );
        let peers: Vec<String> = self.core.members.keys().cloned().collect();
        for id in peers {
            self.core.remove_member(&id);
        }
        for (id, addr) in &sn.state().members {
            self.core.add_member(id, addr);
        }
        self.core.last_applied = sn.last_index();
        self.core.term = sn.state().term;
        self.core.vote_for.clear();

        self.store.install_snapshot(&self.core, sn)
    }

    /// Build a snapshot of the current log tail.
    pub fn create_snapshot(&self) -> Snapshot {
        self.store.create_snapshot()
    }

    /// Replace local state with a snapshot (also used by operators to
    /// seed a replica out of band).
    pub fn install_snapshot(&mut self, sn: &Snapshot) -> Result<()> {
        self.install_snapshot_state(sn)
    }

    /* ---------------- quorum operations ---------------- */

    /// Append a membership addition through the log. A node with no peers
    /// bootstraps itself: it becomes leader of a group of one in a fresh
    /// term and the AddMember entry is that term's first commit.
    pub fn add_member(&mut self, id: &str, addr: &str) -> Result<i64> {
        if self.core.role != Role::Leader {
            if self.core.members.is_empty() {
                self.core.term += 1;
                self.core.vote_for = self.core.id.clone();
                self.core.role = Role::Leader;
                self.core.election_timer = 0;
                self.store.save_state(&self.core)?;
                tracing::info!(id = %self.core.id, term = self.core.term, "bootstrapped as leader");
            } else {
                return Err(RaftError::NotLeader {
                    leader_hint: self.core.leader_hint(),
                });
            }
        }

        let data = format!("{id} {addr}");
        let ent = self
            .store
            .append_entry(&self.core, EntryType::AddMember, &data)?;
        Ok(ent.index)
    }

    /// Append a membership removal through the log.
    pub fn del_member(&mut self, id: &str) -> Result<i64> {
        if self.core.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.core.leader_hint(),
            });
        }
        let ent = self.store.append_entry(&self.core, EntryType::DelMember, id)?;
        Ok(ent.index)
    }

    /// Append an opaque payload for the upstream service. Completion is
    /// observable only through apply; callers correlate by (term, index).
    pub fn propose(&mut self, data: &str) -> Result<(i32, i64)> {
        if self.core.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.core.leader_hint(),
            });
        }
        let ent = self.store.append_entry(&self.core, EntryType::Data, data)?;
        Ok((ent.term, ent.index))
    }

    /// Reset local state and follow `leader_id`, wiping the Db. The
    /// leader must then AddMember this node for it to receive the log.
    pub fn join_group(&mut self, leader_id: &str, leader_addr: &str) -> Result<()> {
        if leader_id == self.core.id {
            return Err(RaftError::InvalidState("cannot join self".to_owned()));
        }
        if !self.core.members.is_empty() {
            return Err(RaftError::InvalidState("already in a group".to_owned()));
        }
        tracing::info!(leader = leader_id, addr = leader_addr, "join group");

        self.core.term = 0;
        self.core.vote_for.clear();
        self.core.last_applied = 0;
        self.core.add_member(leader_id, leader_addr);
        self.become_follower();

        self.store.clean_all(&self.core)
    }

    /// Leave the group: drop all peers and persist the lone-node state.
    pub fn quit_group(&mut self) -> Result<()> {
        tracing::info!(id = %self.core.id, "quit group");
        let peers: Vec<String> = self.core.members.keys().cloned().collect();
        for id in peers {
            self.core.remove_member(&id);
        }
        self.store.save_state(&self.core)
    }

    /* ---------------- outbound ---------------- */

    /// Stamp src/term (and the log tail as prev, unless the message
    /// already carries one) and queue the frame. A full queue drops the
    /// message; heartbeats and resends recover.
    fn send(&mut self, mut msg: Message) {
        msg.src = self.core.id.clone();
        msg.term = self.core.term;
        if msg.prev_term == 0 {
            msg.prev_term = self.store.last_term();
            msg.prev_index = self.store.last_index();
        }
        if self.send_tx.try_send(msg).is_err() {
            tracing::warn!("outbound queue saturated, dropping message");
        }
    }

    fn broadcast(&mut self, make: impl Fn(&str) -> Message) {
        let ids: Vec<String> = self.core.members.keys().cloned().collect();
        for id in ids {
            let msg = make(&id);
            self.send(msg);
        }
    }
}
