//! SQLite persistence for MergeFlow metadata.
//!
//! Projects, commits, branch tips, file versions, merge requests and the
//! audit log live here; blob bytes stay in the content store. The engine
//! writes through inside the critical section that mutates its in-memory
//! state and replays everything from here on startup.

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info};

use crate::errors::DatabaseError;
use crate::locking;

/// Handle to the metadata database.
///
/// One connection behind a `Mutex`; all engine writes are short
/// transactions, so a single connection is not a bottleneck.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file at `path` in WAL mode.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::configure(conn)
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self, DatabaseError> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        debug!("database connection configured");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Apply pending schema migrations.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        schema::run_migrations(&self.conn())
    }

    pub fn schema_version(&self) -> Result<u32, DatabaseError> {
        schema::get_schema_version(&self.conn())
    }

    /// Lock the underlying connection for raw access.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        locking::lock(&self.conn)
    }

    /// Run `f` in an immediate transaction: committed when `f` returns
    /// `Ok`, rolled back (on drop) otherwise.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}
