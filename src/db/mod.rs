//! SQLite repository layer for the accrual-and-issuance ledger
//!
//! ## Tables
//!
//! - `impact_measurements` - raw measurements from upstream producers
//! - `partial_balances` - per-category fractional remainder
//! - `sequences` - per-category token counters and the certificate counter
//! - `tokens` - issued UIB tokens with their lifecycle status
//! - `certificates` - CDV certificates, each a fixed bundle of tokens
//! - `quotas` - investor slots waiting for a certificate
//!
//! ## Concurrency
//!
//! A file-backed [`LedgerDb`] hands every operation its own connection, so
//! callers on different threads really do run concurrently. Every mutation
//! runs in an IMMEDIATE transaction: SQLite takes the writer lock up front,
//! which makes claim-then-update sequences serializable. Readers in WAL mode
//! never block on writers.

pub mod balances;
pub mod certificates;
pub mod measurements;
pub mod models;
pub mod quotas;
pub mod schema;
pub mod sequences;
pub mod tokens;

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::LedgerError;

/// File name of the ledger database inside the data directory
pub const DB_FILE_NAME: &str = "ledger.db";

enum Backing {
    File { path: PathBuf, busy_timeout: Duration },
    Memory(Mutex<Connection>),
}

/// Handle to the ledger database
pub struct LedgerDb {
    backing: Backing,
}

impl LedgerDb {
    /// Open or create the ledger database inside `data_dir`
    pub fn open(data_dir: &Path, busy_timeout: Duration) -> Result<Self, LedgerError> {
        let path = data_dir.join(DB_FILE_NAME);
        info!("Opening ledger database at {:?}", path);

        let db = Self {
            backing: Backing::File { path, busy_timeout },
        };

        let conn = db.connect()?;
        // WAL lets readers proceed while a writer holds the lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| LedgerError::Internal(format!("Failed to set PRAGMA: {}", e)))?;
        schema::init_schema(&conn)?;

        Ok(db)
    }

    /// Open an in-memory database (for testing and dry runs)
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        debug!("Opening in-memory ledger database");

        let conn = Connection::open_in_memory()
            .map_err(|e| LedgerError::Internal(format!("Failed to open in-memory SQLite: {}", e)))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::init_schema(&conn)?;

        Ok(Self {
            backing: Backing::Memory(Mutex::new(conn)),
        })
    }

    fn connect(&self) -> Result<Connection, LedgerError> {
        match &self.backing {
            Backing::File { path, busy_timeout } => {
                let conn = Connection::open(path)
                    .map_err(|e| LedgerError::Internal(format!("Failed to open SQLite: {}", e)))?;
                conn.busy_timeout(*busy_timeout)?;
                conn.execute_batch("PRAGMA foreign_keys=ON;")?;
                Ok(conn)
            }
            Backing::Memory(_) => Err(LedgerError::Internal(
                "In-memory ledger has no separate connections".into(),
            )),
        }
    }

    /// Run a read-only closure against a connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<T, LedgerError>,
    {
        match &self.backing {
            Backing::File { .. } => {
                let conn = self.connect()?;
                f(&conn)
            }
            Backing::Memory(conn) => {
                let conn = conn
                    .lock()
                    .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))?;
                f(&conn)
            }
        }
    }

    /// Run `f` inside an IMMEDIATE transaction.
    ///
    /// Commits when `f` returns `Ok`; any `Err` rolls back every write `f`
    /// made, so callers never observe a partially applied mutation.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, LedgerError>,
    {
        match &self.backing {
            Backing::File { .. } => {
                let mut conn = self.connect()?;
                run_in_tx(&mut conn, f)
            }
            Backing::Memory(conn) => {
                let mut conn = conn
                    .lock()
                    .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))?;
                run_in_tx(&mut conn, f)
            }
        }
    }

    /// Database statistics
    pub fn stats(&self) -> Result<DbStats, LedgerError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64, LedgerError> {
                let n: i64 = conn
                    .query_row(sql, [], |row| row.get(0))
                    .map_err(|e| LedgerError::Internal(format!("Query failed: {}", e)))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                measurement_count: count("SELECT COUNT(*) FROM impact_measurements")?,
                pending_measurements: count(
                    "SELECT COUNT(*) FROM impact_measurements WHERE consumed = 0",
                )?,
                token_count: count("SELECT COUNT(*) FROM tokens")?,
                certificate_count: count("SELECT COUNT(*) FROM certificates")?,
                quota_count: count("SELECT COUNT(*) FROM quotas")?,
            })
        })
    }
}

fn run_in_tx<F, T>(conn: &mut Connection, f: F) -> Result<T, LedgerError>
where
    F: FnOnce(&Transaction<'_>) -> Result<T, LedgerError>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()
        .map_err(|e| LedgerError::Internal(format!("Commit failed: {}", e)))?;
    Ok(value)
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub measurement_count: u64,
    pub pending_measurements: u64,
    pub token_count: u64,
    pub certificate_count: u64,
    pub quota_count: u64,
}

/// `?, ?, ?` placeholder list for an `IN (...)` clause
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub use models::{
    Category, Certificate, ImpactMeasurement, PartialBalance, Quota, QuotaStatus, Token,
    TokenStatus,
};

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_failed_tx_rolls_back() {
        let db = LedgerDb::open_in_memory().unwrap();

        let result: Result<(), LedgerError> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO sequences (name, last_value) VALUES ('scratch', 1)",
                [],
            )?;
            Err(LedgerError::Conflict("abort".into()))
        });
        assert!(result.is_err());

        let rows: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM sequences", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_file_backed_db_reopens() {
        let dir = TempDir::new().unwrap();
        {
            let db = LedgerDb::open(dir.path(), Duration::from_secs(1)).unwrap();
            db.with_tx(|tx| {
                tx.execute("INSERT INTO sequences (name, last_value) VALUES ('scratch', 7)", [])?;
                Ok(())
            })
            .unwrap();
        }

        let db = LedgerDb::open(dir.path(), Duration::from_secs(1)).unwrap();
        let value: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT last_value FROM sequences WHERE name = 'scratch'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(db.stats().unwrap().token_count, 0);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(3), "?, ?, ?");
        assert_eq!(placeholders(1), "?");
    }
}
