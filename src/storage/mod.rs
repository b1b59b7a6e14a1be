//! Flat key/value persistence for the Raft log.
//!
//! The Raft storage layer talks to a [`Db`]: a string-keyed store with
//! `get`/`set`/`all`/`fsync`/`clean_all`/`close`. Two implementations are
//! provided:
//!
//! - [`RedbDb`]: a single-table redb 2.x database. Commits are durable,
//!   which makes `fsync` trivially satisfied.
//! - [`MemDb`]: an in-memory map for tests and cluster simulations.
//!
//! # Key Layout
//!
//! ```text
//! @State                      -> persisted Raft state (term, vote, members)
//! @CommitIndex                -> highest committed index, as decimal text
//! log#<zero-padded-index>     -> one encoded log entry per key
//! ```

mod db;

pub use db::{Db, MemDb, RedbDb, StorageError};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
