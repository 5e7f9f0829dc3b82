//! SQLite ledger database
//!
//! Single source of truth for money movements and license state.
//!
//! ## Tables
//!
//! - `ledger_entries` - Immutable financial entries with a unique idempotency key
//! - `purchases` - License state (cycle day, pause, cycles completed)
//! - `packages` - Catalog read model (rates, cycle cap)
//! - `referral_edges` - Referral graph read model
//! - `pool_participants`, `pool_cycles`, `pool_allocations` - Pool plans
//! - `commission_outbox` - First-cycle completions awaiting commission

pub mod schema;
pub mod ledger;
pub mod purchases;
pub mod packages;
pub mod referrals;
pub mod pool;
pub mod outbox;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::EngineError;

/// Map a SQLite error with context. Constraint failures (CHECK, triggers)
/// mean the write broke a ledger rule and are not retryable.
pub(crate) fn db_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> EngineError {
    move |e| match e {
        rusqlite::Error::SqliteFailure(ref err, _) if err.code == ErrorCode::ConstraintViolation => {
            EngineError::InvariantViolation(format!("{}: {}", context, e))
        }
        other => EngineError::Storage(format!("{}: {}", context, other)),
    }
}

/// Whether an error is a UNIQUE index violation
pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// Current UTC timestamp in the format stored by the schema
pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// SQLite database for the ledger and license state
pub struct LedgerDb {
    conn: Mutex<Connection>,
}

impl LedgerDb {
    /// Open or create the ledger database
    pub fn open(storage_dir: &Path) -> Result<Self, EngineError> {
        let db_path = storage_dir.join("ledger.db");
        info!("Opening ledger database at {:?}", db_path);

        let conn = Connection::open(&db_path)
            .map_err(|e| EngineError::Storage(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| EngineError::Storage(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, EngineError> {
        debug!("Opening in-memory ledger database");

        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Storage(format!("Failed to open in-memory SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Storage(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), EngineError> {
        let conn = self.lock()?;
        schema::init_schema(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, EngineError> {
        self.conn
            .lock()
            .map_err(|e| EngineError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Run a read with shared access
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, EngineError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run one unit of work as a single atomic commit.
    ///
    /// The transaction is IMMEDIATE so the write lock is taken before any
    /// read; an `Err` from `f` rolls everything back.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, EngineError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Transaction failed"))?;

        let value = f(&tx)?;

        tx.commit().map_err(db_err("Commit failed"))?;
        Ok(value)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, EngineError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64, EngineError> {
                conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                    .map(|n| n as u64)
                    .map_err(db_err("Query failed"))
            };

            Ok(DbStats {
                ledger_entries: count("SELECT COUNT(*) FROM ledger_entries")?,
                purchases: count("SELECT COUNT(*) FROM purchases")?,
                active_purchases: count("SELECT COUNT(*) FROM purchases WHERE status = 'active'")?,
                referral_edges: count("SELECT COUNT(*) FROM referral_edges")?,
                pending_commissions: count(
                    "SELECT COUNT(*) FROM commission_outbox WHERE resolved_at IS NULL",
                )?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub ledger_entries: u64,
    pub purchases: u64,
    pub active_purchases: u64,
    pub referral_edges: u64,
    pub pending_commissions: u64,
}

// Re-exports
pub use ledger::{EntryStatus, EntryType, IdempotencyKey, LedgerEntry, LedgerQuery, RecordOutcome};
pub use packages::{Package, PackageTerms};
pub use purchases::{Purchase, PurchaseStatus};
pub use referrals::ReferralEdge;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_and_stats() {
        let db = LedgerDb::open_in_memory().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.ledger_entries, 0);
        assert_eq!(stats.purchases, 0);
    }

    #[test]
    fn test_open_on_disk_reuses_schema() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let db = LedgerDb::open(dir.path()).unwrap();
            assert_eq!(db.stats().unwrap().purchases, 0);
        }
        let db = LedgerDb::open(dir.path()).unwrap();
        assert_eq!(db.stats().unwrap().ledger_entries, 0);
    }

    #[test]
    fn test_with_tx_rolls_back_on_error() {
        let db = LedgerDb::open_in_memory().unwrap();
        let result: Result<(), EngineError> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO packages (id, daily_rate_bps, max_cycles, direct_referral_rate_bps, activation_rate_bps) VALUES ('p', 1250, 5, 1000, 500)",
                [],
            )
            .map_err(db_err("Insert failed"))?;
            Err(EngineError::Internal("abort".into()))
        });
        assert!(result.is_err());
        assert!(db.with_conn(|conn| packages::get_package(conn, "p")).unwrap().is_none());
    }
}
