//! Db contract and implementations.
//!
//! Values are single text lines (the Raft wire encodings), so the store is
//! string-keyed and string-valued. Each `set` on [`RedbDb`] runs its own
//! write transaction; redb commits are durable on return.

use std::collections::BTreeMap;
use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use thiserror::Error;

use super::Result;

/// The single table holding all Raft keys.
const TABLE: TableDefinition<&str, &str> = TableDefinition::new("raft");

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("redb database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("redb transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Flat key/value store backing the Raft log.
///
/// `fsync` must be durable before returning; callers treat a failure as
/// fatal. `all` is only used on startup, so implementations may
/// materialize the whole key space.
pub trait Db: Send {
    /// Get a value by key, or `None` if absent.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value by key.
    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    /// All key/value pairs, in unspecified order.
    fn all(&self) -> Result<Vec<(String, String)>>;

    /// Make previous writes durable.
    fn fsync(&mut self) -> Result<()>;

    /// Remove every key.
    fn clean_all(&mut self) -> Result<()>;

    /// Release underlying resources. Further calls are undefined.
    fn close(&mut self);
}

/// Db backed by a redb database with a single string table.
pub struct RedbDb {
    db: Database,
}

impl RedbDb {
    /// Open or create a redb database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Database::create(path)?;
        // Make sure the table exists so reads on a fresh file succeed.
        let txn = db.begin_write()?;
        txn.open_table(TABLE)?;
        txn.commit()?;
        Ok(Self { db })
    }

    /// Open a throwaway database backed by a tempfile (for testing).
    ///
    /// The tempfile handle is leaked so the file outlives this call; the
    /// OS reclaims it when the process exits.
    pub fn open_temporary() -> Result<Self> {
        let tmpfile = tempfile::NamedTempFile::new()?;
        let db = Self::open(tmpfile.path())?;
        std::mem::forget(tmpfile);
        Ok(db)
    }
}

impl Db for RedbDb {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_owned()))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TABLE)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn all(&self) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TABLE)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (k, v) = item?;
            out.push((k.value().to_owned(), v.value().to_owned()));
        }
        Ok(out)
    }

    fn fsync(&mut self) -> Result<()> {
        // redb transactions are durable on commit, nothing left to flush.
        Ok(())
    }

    fn clean_all(&mut self) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            txn.delete_table(TABLE)?;
            txn.open_table(TABLE)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the Database handle closes the file.
    }
}

/// In-memory Db for tests and cluster simulations.
#[derive(Debug, Default)]
pub struct MemDb {
    map: BTreeMap<String, String>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Db for MemDb {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.map.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn all(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn fsync(&mut self) -> Result<()> {
        Ok(())
    }

    fn clean_all(&mut self) -> Result<()> {
        self.map.clear();
        Ok(())
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redb_basic_operations() {
        let mut db = RedbDb::open_temporary().unwrap();

        assert_eq!(db.get("missing").unwrap(), None);

        db.set("@State", "{}").unwrap();
        assert_eq!(db.get("@State").unwrap(), Some("{}".to_owned()));

        db.set("@State", "{\"term\":3}").unwrap();
        assert_eq!(db.get("@State").unwrap(), Some("{\"term\":3}".to_owned()));
    }

    #[test]
    fn test_redb_all_and_clean() {
        let mut db = RedbDb::open_temporary().unwrap();

        db.set("log#001", "1 1 0 Noop ").unwrap();
        db.set("log#002", "1 2 1 Data x").unwrap();
        db.set("@State", "{}").unwrap();

        let mut all = db.all().unwrap();
        all.sort();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].0, "@State");
        assert_eq!(all[1], ("log#001".to_owned(), "1 1 0 Noop ".to_owned()));

        db.clean_all().unwrap();
        assert!(db.all().unwrap().is_empty());
        assert_eq!(db.get("@State").unwrap(), None);
    }

    #[test]
    fn test_redb_persists_across_reopen() {
        let tmpfile = tempfile::NamedTempFile::new().unwrap();
        let path = tmpfile.path().to_path_buf();

        {
            let mut db = RedbDb::open(&path).unwrap();
            db.set("log#001", "1 1 0 Data hello world").unwrap();
            db.fsync().unwrap();
            db.close();
        }

        let db = RedbDb::open(&path).unwrap();
        assert_eq!(
            db.get("log#001").unwrap(),
            Some("1 1 0 Data hello world".to_owned())
        );
    }

    #[test]
    fn test_mem_db() {
        let mut db = MemDb::new();

        db.set("a", "1").unwrap();
        db.set("b", "2").unwrap();
        assert_eq!(db.get("a").unwrap(), Some("1".to_owned()));
        assert_eq!(db.all().unwrap().len(), 2);

        db.clean_all().unwrap();
        assert_eq!(db.get("a").unwrap(), None);
    }
}
