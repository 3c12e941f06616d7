// src/db/mod.rs

//! Thin driver layer over SQLite
//!
//! All repository code goes through this module so driver-specific error
//! codes surface as the crate taxonomy (column-not-unique,
//! constraint-violation, database-locked) and so busy/locked failures are
//! retried with backoff in one place.

use crate::error::{Error, Result};
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts made for an operation that fails with a locked database.
const MAX_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Map a driver error onto the crate taxonomy.
pub fn map_sqlite_error(e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(failure, message) => {
            use rusqlite::ErrorCode;
            match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Error::DatabaseLocked,
                ErrorCode::ConstraintViolation => {
                    // UNIQUE and PRIMARY KEY violations get their own kind;
                    // everything else stays a generic constraint failure.
                    if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    {
                        Error::ColumnNotUnique
                    } else {
                        Error::ConstraintViolation(
                            message.clone().unwrap_or_else(|| e.to_string()),
                        )
                    }
                }
                _ => Error::DatabaseError(e.to_string()),
            }
        }
        _ => Error::DatabaseError(e.to_string()),
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        map_sqlite_error(e)
    }
}

/// One open repository database
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "opening database");
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `body` inside a transaction, committing on success. A locked
    /// database is retried a bounded number of times; any other error
    /// rolls back and propagates.
    pub fn transaction<T>(
        &mut self,
        mut body: impl FnMut(&Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            let result: Result<T> = (|| {
                let tx = self.conn.transaction()?;
                let value = body(&tx)?;
                tx.commit()?;
                Ok(value)
            })();
            match result {
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    warn!(attempt, "database locked, retrying");
                    std::thread::sleep(RETRY_DELAY);
                }
                other => return other,
            }
        }
    }
}
