//! Log storage: owns the entry map, the first/last/commit indices, and
//! the apply pipeline into the node and the upstream service.
//!
//! # Storage Layout
//!
//! ```text
//! Db (flat key/value)
//! ├── @State                  -> State blob (term, vote, members)
//! ├── @CommitIndex            -> decimal commit index
//! └── log#<zero-padded-index> -> Entry line, one per key
//! ```
//!
//! Followers may receive entries out of order; non-contiguous entries are
//! buffered in memory and only persisted (advancing `last_index`) once the
//! gap below them is filled. The commit index is persisted under its own
//! key so it never regresses across restarts.

use std::collections::HashMap;

use tokio::sync::mpsc;

use super::{Entry, EntryType, RaftError, Result, Service, Snapshot, State};
use crate::storage::Db;

/// How many tail entries a snapshot carries, at most. Large enough to
/// onboard a lagging follower without a second snapshot round.
const SNAPSHOT_ENTRIES: i64 = 100;

/// Capacity of the replication doorbell channel. Pulses coalesce, so a
/// small buffer is enough.
const NOTIFY_QUEUE: usize = 10;

const KEY_STATE: &str = "@State";
const KEY_COMMIT: &str = "@CommitIndex";

fn log_key(index: i64) -> String {
    format!("log#{index:020}")
}

/// What storage needs from the node that owns it.
///
/// Storage drives apply synchronously out of commit-index advancement and
/// persists the node's durable state; this trait supplies both without a
/// back-reference.
pub trait RaftHost {
    /// The node's current term, stamped onto appended entries.
    fn current_term(&self) -> i32;

    /// The node's apply cursor.
    fn last_applied(&self) -> i64;

    /// Apply one committed entry to the node, advancing its cursor.
    /// Returns `true` when membership changed and state must be rewritten.
    fn apply_entry(&mut self, ent: &Entry) -> bool;

    /// The durable state to persist: term, vote, members including self.
    fn persistent_state(&self) -> State;
}

/// Durable log storage for one Raft node.
pub struct Storage {
    pub(crate) first_index: i64,
    pub(crate) last_term: i32,
    pub(crate) last_index: i64,
    /// Committed entries are applied to the node immediately, and to the
    /// attached service from the same call.
    pub(crate) commit_index: i64,
    state: State,

    /// Entries may be non-contiguous above `last_index` (follower gaps).
    entries: HashMap<i64, Entry>,
    service: Option<Box<dyn Service>>,
    db: Box<dyn Db>,

    notify_tx: mpsc::Sender<()>,
    notify_rx: Option<mpsc::Receiver<()>>,
}

impl Storage {
    /// Open storage over a Db, reloading state, entries and the commit
    /// cursor persisted by a previous run.
    pub fn new(db: Box<dyn Db>) -> Result<Self> {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_QUEUE);
        let mut st = Self {
            first_index: 0,
            last_term: 0,
            last_index: 0,
            commit_index: 0,
            state: State::default(),
            entries: HashMap::new(),
            service: None,
            db,
            notify_tx,
            notify_rx: Some(notify_rx),
        };
        st.load()?;
        Ok(st)
    }

    fn load(&mut self) -> Result<()> {
        self.state = State::decode(&self.db.get(KEY_STATE)?.unwrap_or_default());

        for (key, value) in self.db.all()? {
            if !key.starts_with("log#") {
                continue;
            }
            if value.is_empty() {
                // tombstone left by a conflict truncation
                continue;
            }
            let ent = Entry::decode(&value)
                .ok_or_else(|| RaftError::Corrupt(format!("bad entry at {key}: {value:?}")))?;
            if self.first_index == 0 || ent.index < self.first_index {
                self.first_index = ent.index;
            }
            if ent.index > self.last_index {
                self.last_index = ent.index;
                self.last_term = ent.term;
            }
            self.entries.insert(ent.index, ent);
        }

        let persisted: i64 = self
            .db
            .get(KEY_COMMIT)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        self.commit_index = persisted.min(self.last_index);
        Ok(())
    }

    /// The doorbell the communication loop listens on; each pulse means
    /// "there is new work to replicate".
    pub fn take_notify_receiver(&mut self) -> Option<mpsc::Receiver<()>> {
        self.notify_rx.take()
    }

    pub(crate) fn pulse(&self) {
        // a pending pulse already covers us, dropping is fine
        let _ = self.notify_tx.try_send(());
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn first_index(&self) -> i64 {
        self.first_index
    }

    pub fn last_term(&self) -> i32 {
        self.last_term
    }

    pub fn last_index(&self) -> i64 {
        self.last_index
    }

    pub fn commit_index(&self) -> i64 {
        self.commit_index
    }

    /// Attach the upstream service consuming committed entries.
    pub fn set_service(&mut self, svc: Box<dyn Service>) {
        self.service = Some(svc);
    }

    /// Rewrite the persisted state from the host and fsync.
    pub fn save_state(&mut self, host: &impl RaftHost) -> Result<()> {
        self.state = host.persistent_state();
        let blob = self.state.encode()?;
        tracing::debug!(state = %blob, "save raft state");
        self.db.set(KEY_STATE, &blob)?;
        self.fsync();
        Ok(())
    }

    pub fn get_entry(&self, index: i64) -> Option<&Entry> {
        self.entries.get(&index)
    }

    /// Append a new entry at the tail (leader only) and pulse the
    /// replication doorbell.
    pub fn append_entry(
        &mut self,
        host: &impl RaftHost,
        entry_type: EntryType,
        data: &str,
    ) -> Result<Entry> {
        let ent = Entry::new(
            host.current_term(),
            self.last_index + 1,
            self.commit_index,
            entry_type,
            data,
        );
        self.write_entry(ent.clone())?;
        self.pulse();
        Ok(ent)
    }

    /// Insert an entry, then persist every contiguous entry above
    /// `last_index`. Entries at or below the commit index are rejected;
    /// entries above a gap stay buffered until the gap is filled.
    pub fn write_entry(&mut self, ent: Entry) -> Result<()> {
        if ent.index <= self.commit_index {
            tracing::debug!(
                index = ent.index,
                commit = self.commit_index,
                "refusing write at or below commit"
            );
            return Ok(());
        }

        if self.first_index == 0 || ent.index < self.first_index {
            self.first_index = ent.index;
        }
        self.entries.insert(ent.index, ent);

        loop {
            let next = self.last_index + 1;
            let Some((line, term)) = self.entries.get(&next).map(|e| (e.encode(), e.term)) else {
                break;
            };
            self.db.set(&log_key(next), &line)?;
            self.last_term = term;
            self.last_index = next;
            tracing::debug!(entry = %line, "write log");
        }
        Ok(())
    }

    /// Drop the entry at `index` and everything after it (conflict
    /// truncation). Persisted keys are tombstoned so a restart cannot
    /// resurrect them. Committed entries are never disturbed.
    pub(crate) fn truncate_from(&mut self, index: i64) -> Result<()> {
        if index <= self.commit_index {
            tracing::warn!(
                index,
                commit = self.commit_index,
                "refusing to truncate committed entries"
            );
            return Ok(());
        }
        tracing::info!(
            from = index,
            last = self.last_index,
            "truncate conflicting entries"
        );

        let stale: Vec<i64> = self
            .entries
            .keys()
            .copied()
            .filter(|&i| i >= index)
            .collect();
        for i in stale {
            self.entries.remove(&i);
            if i <= self.last_index {
                self.db.set(&log_key(i), "")?;
            }
        }
        if self.last_index >= index {
            self.last_index = index - 1;
            self.last_term = self
                .entries
                .get(&self.last_index)
                .map(|e| e.term)
                .unwrap_or(0);
        }
        self.first_index = self.entries.keys().min().copied().unwrap_or(0);
        self.fsync();
        Ok(())
    }

    /// Advance the commit index (clamped to `last_index`), make it
    /// durable, and apply everything newly committed. No-op when `index`
    /// does not move the cursor forward.
    pub fn commit_entry(&mut self, host: &mut impl RaftHost, index: i64) -> Result<()> {
        let index = index.min(self.last_index);
        if index <= self.commit_index {
            return Ok(());
        }
        self.commit_index = index;
        self.db.set(KEY_COMMIT, &index.to_string())?;
        self.fsync();
        self.apply_entries(host)
    }

    /// Apply committed entries: first to the node (missing entries here
    /// are fatal corruption), then to the attached service, which instead
    /// gets an install-snapshot hint when the log no longer reaches back
    /// to its cursor.
    pub fn apply_entries(&mut self, host: &mut impl RaftHost) -> Result<()> {
        while host.last_applied() < self.commit_index {
            let idx = host.last_applied() + 1;
            let ent = self
                .entries
                .get(&idx)
                .cloned()
                .ok_or_else(|| RaftError::Corrupt(format!("committed entry#{idx} not found")))?;
            if host.apply_entry(&ent) {
                self.save_state(host)?;
            }
        }

        if let Some(svc) = self.service.as_mut() {
            while svc.last_applied() < self.commit_index {
                let idx = svc.last_applied() + 1;
                match self.entries.get(&idx) {
                    Some(ent) => svc.apply_entry(ent),
                    None => {
                        tracing::warn!(
                            lost = idx,
                            service_applied = svc.last_applied(),
                            "entry gone, asking service to install a snapshot"
                        );
                        svc.install_snapshot();
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Make previous writes durable. A failure here means the log can no
    /// longer guarantee what it already acked, so the process terminates.
    pub(crate) fn fsync(&mut self) {
        if let Err(err) = self.db.fsync() {
            tracing::error!(%err, "fsync failed, aborting to avoid losing acked writes");
            std::process::abort();
        }
    }

    /// Capture the current state plus a bounded entry suffix ending at
    /// `last_index`.
    pub fn create_snapshot(&self) -> Snapshot {
        let mut entries = Vec::new();
        if self.last_index > 0 {
            let start = self.first_index.max(self.last_index - SNAPSHOT_ENTRIES);
            for idx in start..=self.last_index {
                if let Some(ent) = self.entries.get(&idx) {
                    entries.push(ent.clone());
                }
            }
        }
        Snapshot::new(
            self.state.clone(),
            self.last_term,
            self.last_index,
            entries,
        )
    }

    /// Replace the whole log with the snapshot's tail. The host must have
    /// adopted the snapshot's term and membership already, because the
    /// state saved at the end is read back from it.
    pub fn install_snapshot(&mut self, host: &impl RaftHost, sn: &Snapshot) -> Result<()> {
        self.db.clean_all()?;
        self.entries.clear();

        self.last_term = sn.last_term();
        self.last_index = sn.last_index();
        self.commit_index = sn.last_index();
        self.first_index = sn.entries().first().map(|e| e.index).unwrap_or(0);

        for ent in sn.entries() {
            self.db.set(&log_key(ent.index), &ent.encode())?;
            self.entries.insert(ent.index, ent.clone());
        }
        self.db.set(KEY_COMMIT, &self.commit_index.to_string())?;
        self.save_state(host)
    }

    /// Reset to an empty log and wipe the Db.
    pub fn clean_all(&mut self, host: &impl RaftHost) -> Result<()> {
        self.first_index = 0;
        self.last_term = 0;
        self.last_index = 0;
        self.commit_index = 0;
        self.entries.clear();
        self.db.clean_all()?;
        self.save_state(host)
    }

    /// Persist state one last time and release the Db.
    pub fn close(&mut self, host: &impl RaftHost) -> Result<()> {
        self.save_state(host)?;
        self.db.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemDb;

    /// Minimal host: a term, an apply cursor, and a membership map.
    struct TestHost {
        term: i32,
        last_applied: i64,
        applied: Vec<Entry>,
    }

    impl TestHost {
        fn new(term: i32) -> Self {
            Self {
                term,
                last_applied: 0,
                applied: Vec::new(),
            }
        }
    }

    impl RaftHost for TestHost {
        fn current_term(&self) -> i32 {
            self.term
        }

        fn last_applied(&self) -> i64 {
            self.last_applied
        }

        fn apply_entry(&mut self, ent: &Entry) -> bool {
            self.last_applied = ent.index;
            self.applied.push(ent.clone());
            matches!(ent.entry_type, EntryType::AddMember | EntryType::DelMember)
        }

        fn persistent_state(&self) -> State {
            State {
                term: self.term,
                ..Default::default()
            }
        }
    }

    fn open() -> Storage {
        Storage::new(Box::new(MemDb::new())).unwrap()
    }

    #[test]
    fn test_empty_log_indices() {
        let st = open();
        assert_eq!(st.first_index(), 0);
        assert_eq!(st.last_index(), 0);
        assert_eq!(st.last_term(), 0);
        assert_eq!(st.commit_index(), 0);
    }

    #[test]
    fn test_append_advances_tail() {
        let mut st = open();
        let host = TestHost::new(1);

        let e1 = st.append_entry(&host, EntryType::Noop, "").unwrap();
        let e2 = st.append_entry(&host, EntryType::Data, "hello").unwrap();

        assert_eq!(e1.index, 1);
        assert_eq!(e2.index, 2);
        assert_eq!(st.first_index(), 1);
        assert_eq!(st.last_index(), 2);
        assert_eq!(st.last_term(), 1);
        assert_eq!(st.get_entry(2).unwrap().data, "hello");
    }

    #[test]
    fn test_append_pulses_doorbell() {
        let mut st = open();
        let mut rx = st.take_notify_receiver().unwrap();
        let host = TestHost::new(1);

        st.append_entry(&host, EntryType::Data, "x").unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_gap_buffers_until_filled() {
        let mut st = open();

        st.write_entry(Entry::new(1, 1, 0, EntryType::Noop, "")).unwrap();
        // entry 3 arrives before entry 2
        st.write_entry(Entry::new(1, 3, 0, EntryType::Data, "c")).unwrap();
        assert_eq!(st.last_index(), 1);
        assert!(st.get_entry(3).is_some());

        // filling the gap advances the tail through both
        st.write_entry(Entry::new(1, 2, 0, EntryType::Data, "b")).unwrap();
        assert_eq!(st.last_index(), 3);
        assert_eq!(st.last_term(), 1);
    }

    #[test]
    fn test_write_below_commit_rejected() {
        let mut st = open();
        let mut host = TestHost::new(1);

        st.append_entry(&host, EntryType::Noop, "").unwrap();
        st.append_entry(&host, EntryType::Data, "a").unwrap();
        st.commit_entry(&mut host, 2).unwrap();

        st.write_entry(Entry::new(2, 2, 0, EntryType::Data, "evil")).unwrap();
        assert_eq!(st.get_entry(2).unwrap().data, "a");
    }

    #[test]
    fn test_commit_clamps_and_applies() {
        let mut st = open();
        let mut host = TestHost::new(1);

        st.append_entry(&host, EntryType::Noop, "").unwrap();
        st.append_entry(&host, EntryType::Data, "a").unwrap();

        // commit beyond the tail clamps to last_index
        st.commit_entry(&mut host, 99).unwrap();
        assert_eq!(st.commit_index(), 2);
        assert_eq!(host.last_applied, 2);
        assert_eq!(host.applied.len(), 2);

        // committing backwards is a no-op
        st.commit_entry(&mut host, 1).unwrap();
        assert_eq!(st.commit_index(), 2);
    }

    #[test]
    fn test_commit_survives_restart() {
        let tmpfile = tempfile::NamedTempFile::new().unwrap();
        let path = tmpfile.path().to_path_buf();
        let mut host = TestHost::new(1);

        {
            let db = crate::storage::RedbDb::open(&path).unwrap();
            let mut st = Storage::new(Box::new(db)).unwrap();
            st.append_entry(&host, EntryType::Noop, "").unwrap();
            st.append_entry(&host, EntryType::Data, "a").unwrap();
            st.append_entry(&host, EntryType::Data, "b").unwrap();
            st.commit_entry(&mut host, 2).unwrap();
        }

        let db = crate::storage::RedbDb::open(&path).unwrap();
        let st2 = Storage::new(Box::new(db)).unwrap();
        assert_eq!(st2.last_index(), 3);
        assert_eq!(st2.commit_index(), 2);
        assert_eq!(st2.first_index(), 1);
        assert_eq!(st2.last_term(), 1);
    }

    #[test]
    fn test_truncate_conflict() {
        let mut st = open();
        let mut host = TestHost::new(2);

        st.write_entry(Entry::new(1, 1, 0, EntryType::Noop, "")).unwrap();
        st.write_entry(Entry::new(2, 2, 0, EntryType::Data, "a")).unwrap();
        st.write_entry(Entry::new(2, 3, 0, EntryType::Data, "b")).unwrap();
        st.commit_entry(&mut host, 1).unwrap();

        st.truncate_from(2).unwrap();
        assert_eq!(st.last_index(), 1);
        assert_eq!(st.last_term(), 1);
        assert!(st.get_entry(2).is_none());
        assert!(st.get_entry(3).is_none());

        // a higher-term entry can now take index 2
        st.write_entry(Entry::new(3, 2, 0, EntryType::Data, "c")).unwrap();
        assert_eq!(st.last_index(), 2);
        assert_eq!(st.last_term(), 3);
    }

    #[test]
    fn test_truncate_never_touches_committed() {
        let mut st = open();
        let mut host = TestHost::new(1);

        st.write_entry(Entry::new(1, 1, 0, EntryType::Data, "keep")).unwrap();
        st.commit_entry(&mut host, 1).unwrap();

        st.truncate_from(1).unwrap();
        assert_eq!(st.get_entry(1).unwrap().data, "keep");
        assert_eq!(st.last_index(), 1);
    }

    /// Service probe sharing its state with the test through an Arc.
    #[derive(Clone, Default)]
    struct Probe(std::sync::Arc<std::sync::Mutex<ProbeState>>);

    #[derive(Default)]
    struct ProbeState {
        last_applied: i64,
        applied: Vec<i64>,
        installs: usize,
    }

    impl Service for Probe {
        fn last_applied(&self) -> i64 {
            self.0.lock().unwrap().last_applied
        }

        fn apply_entry(&mut self, ent: &Entry) {
            let mut s = self.0.lock().unwrap();
            s.last_applied = ent.index;
            s.applied.push(ent.index);
        }

        fn install_snapshot(&mut self) {
            self.0.lock().unwrap().installs += 1;
        }
    }

    #[test]
    fn test_service_sees_committed_entries() {
        let mut st = open();
        let mut host = TestHost::new(1);
        let probe = Probe::default();
        st.set_service(Box::new(probe.clone()));

        st.append_entry(&host, EntryType::Noop, "").unwrap();
        st.append_entry(&host, EntryType::Data, "a").unwrap();
        st.commit_entry(&mut host, 2).unwrap();

        let s = probe.0.lock().unwrap();
        assert_eq!(s.last_applied, 2);
        assert_eq!(s.applied, vec![1, 2]);
        assert_eq!(s.installs, 0);
    }

    #[test]
    fn test_service_behind_first_index_gets_install_hint() {
        let mut st = open();
        let mut host = TestHost::new(4);

        // log starts at index 6 after a snapshot install
        let sn = Snapshot::new(
            State {
                term: 4,
                ..Default::default()
            },
            4,
            7,
            vec![
                Entry::new(4, 6, 7, EntryType::Data, "x"),
                Entry::new(4, 7, 7, EntryType::Data, "y"),
            ],
        );
        st.install_snapshot(&host, &sn).unwrap();
        host.last_applied = 7;

        // a fresh service starts at 0, far behind first_index = 6
        let probe = Probe::default();
        st.set_service(Box::new(probe.clone()));
        st.apply_entries(&mut host).unwrap();

        let s = probe.0.lock().unwrap();
        assert_eq!(s.installs, 1);
        assert!(s.applied.is_empty());
    }

    #[test]
    fn test_create_snapshot_suffix() {
        let mut st = open();
        let host = TestHost::new(1);

        for i in 0..5 {
            st.append_entry(&host, EntryType::Data, &format!("v{i}")).unwrap();
        }
        let sn = st.create_snapshot();
        assert_eq!(sn.last_index(), 5);
        assert_eq!(sn.last_term(), 1);
        assert_eq!(sn.entries().len(), 5);
        assert_eq!(sn.entries().first().unwrap().index, 1);
    }

    #[test]
    fn test_install_snapshot_replaces_log() {
        let mut st = open();
        let mut host = TestHost::new(1);

        st.append_entry(&host, EntryType::Data, "old").unwrap();
        st.commit_entry(&mut host, 1).unwrap();

        let mut state = State {
            term: 4,
            ..Default::default()
        };
        state.members.insert("n1".to_owned(), "a1".to_owned());
        let sn = Snapshot::new(
            state,
            4,
            7,
            vec![
                Entry::new(4, 6, 7, EntryType::Data, "x"),
                Entry::new(4, 7, 7, EntryType::Data, "y"),
            ],
        );

        host.term = 4;
        st.install_snapshot(&host, &sn).unwrap();

        assert_eq!(st.last_index(), 7);
        assert_eq!(st.last_term(), 4);
        assert_eq!(st.commit_index(), 7);
        assert_eq!(st.first_index(), 6);
        assert!(st.get_entry(1).is_none());
        assert_eq!(st.get_entry(7).unwrap().data, "y");
    }

    #[test]
    fn test_clean_all() {
        let mut st = open();
        let mut host = TestHost::new(1);

        st.append_entry(&host, EntryType::Data, "a").unwrap();
        st.commit_entry(&mut host, 1).unwrap();

        st.clean_all(&host).unwrap();
        assert_eq!(st.last_index(), 0);
        assert_eq!(st.commit_index(), 0);
        assert_eq!(st.first_index(), 0);
        assert!(st.get_entry(1).is_none());
    }
}
