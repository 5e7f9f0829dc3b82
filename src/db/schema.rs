//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::EngineError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), EngineError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new ledger schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Ledger schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, EngineError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    ).map_err(|e| EngineError::Storage(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), EngineError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| EngineError::Storage(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| EngineError::Storage(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), EngineError> {
    conn.execute_batch(CATALOG_SCHEMA)
        .map_err(|e| EngineError::Storage(format!("Failed to create catalog tables: {}", e)))?;

    conn.execute_batch(LEDGER_SCHEMA)
        .map_err(|e| EngineError::Storage(format!("Failed to create ledger tables: {}", e)))?;

    conn.execute_batch(POOL_SCHEMA)
        .map_err(|e| EngineError::Storage(format!("Failed to create pool tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| EngineError::Storage(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), EngineError> {
    // v1 is the first schema; later steps chain here by `from_version`
    info!(from_version, "No migration steps defined");

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Read models handed in by collaborators: catalog and referral graph
const CATALOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS packages (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT,
    daily_rate_bps INTEGER NOT NULL CHECK (daily_rate_bps BETWEEN 0 AND 10000),
    max_cycles INTEGER NOT NULL CHECK (max_cycles > 0),
    direct_referral_rate_bps INTEGER NOT NULL CHECK (direct_referral_rate_bps BETWEEN 0 AND 10000),
    activation_rate_bps INTEGER NOT NULL CHECK (activation_rate_bps BETWEEN 0 AND 10000),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS referral_edges (
    referrer_id TEXT NOT NULL,
    referred_id TEXT NOT NULL,
    level INTEGER NOT NULL CHECK (level >= 1),
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (referrer_id, referred_id, level)
);
"#;

/// Purchases, ledger and commission outbox
const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS purchases (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    package_id TEXT NOT NULL,
    amount INTEGER NOT NULL CHECK (amount > 0),
    currency TEXT NOT NULL,

    -- Package terms snapshotted at confirmation
    daily_rate_bps INTEGER NOT NULL,
    max_cycles INTEGER NOT NULL CHECK (max_cycles > 0),
    direct_referral_rate_bps INTEGER NOT NULL,
    activation_rate_bps INTEGER NOT NULL,

    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'active', 'completed', 'cancelled')),
    current_day INTEGER NOT NULL DEFAULT 0 CHECK (current_day BETWEEN 0 AND 9),
    cycles_completed INTEGER NOT NULL DEFAULT 0 CHECK (cycles_completed >= 0),
    first_cycle_completed INTEGER NOT NULL DEFAULT 0,
    next_benefit_date TEXT,
    last_advanced_on TEXT,
    activated_on TEXT,

    -- Optimistic concurrency: every state write bumps the version
    version INTEGER NOT NULL DEFAULT 0,

    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TRIGGER IF NOT EXISTS purchases_first_cycle_sticky
BEFORE UPDATE OF first_cycle_completed ON purchases
WHEN OLD.first_cycle_completed = 1 AND NEW.first_cycle_completed = 0
BEGIN
    SELECT RAISE(ABORT, 'first_cycle_completed cannot revert');
END;

CREATE TABLE IF NOT EXISTS ledger_entries (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    entry_type TEXT NOT NULL
        CHECK (entry_type IN ('earnings', 'commission', 'pool_bonus', 'deposit', 'withdrawal')),
    subtype TEXT NOT NULL,
    amount INTEGER NOT NULL CHECK (amount >= 0),
    currency TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'failed')),
    source_purchase_id TEXT,
    cause_user_id TEXT,
    period_key TEXT NOT NULL,

    -- Canonical (type, subtype, user, source, period) tuple
    idempotency_key TEXT NOT NULL,

    -- Business date the entry belongs to (benefit day, confirmation day, cycle boundary)
    effective_date TEXT NOT NULL,
    note TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    settled_at TEXT
);

-- At most one completed entry per idempotency key
CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_completed_key
    ON ledger_entries(idempotency_key) WHERE status = 'completed';

-- Settled entries are immutable
CREATE TRIGGER IF NOT EXISTS ledger_settled_immutable
BEFORE UPDATE ON ledger_entries
WHEN OLD.status <> 'pending'
BEGIN
    SELECT RAISE(ABORT, 'settled ledger entries are immutable');
END;

CREATE TRIGGER IF NOT EXISTS ledger_settled_no_delete
BEFORE DELETE ON ledger_entries
WHEN OLD.status <> 'pending'
BEGIN
    SELECT RAISE(ABORT, 'settled ledger entries cannot be deleted');
END;

CREATE TABLE IF NOT EXISTS commission_outbox (
    purchase_id TEXT PRIMARY KEY NOT NULL,
    enqueued_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    attempts INTEGER NOT NULL DEFAULT 0,
    resolved_at TEXT,
    resolution TEXT,
    last_error TEXT,
    FOREIGN KEY (purchase_id) REFERENCES purchases(id)
);
"#;

/// Pool participants and frozen per-cycle allocation plans
const POOL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pool_participants (
    participant_id TEXT PRIMARY KEY NOT NULL,
    role TEXT NOT NULL DEFAULT 'leader',
    active INTEGER NOT NULL DEFAULT 1,
    joined_on TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS pool_cycles (
    cycle_number INTEGER PRIMARY KEY NOT NULL CHECK (cycle_number >= 1),
    window_start TEXT NOT NULL,
    boundary TEXT NOT NULL,
    total_eligible_sales INTEGER NOT NULL,
    bonus_rate_bps INTEGER NOT NULL,
    pool_total INTEGER NOT NULL,
    policy TEXT NOT NULL,
    planned_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS pool_allocations (
    cycle_number INTEGER NOT NULL,
    participant_id TEXT NOT NULL,
    amount INTEGER NOT NULL CHECK (amount >= 0),
    weight INTEGER NOT NULL,
    PRIMARY KEY (cycle_number, participant_id),
    FOREIGN KEY (cycle_number) REFERENCES pool_cycles(cycle_number)
);
"#;

/// Index definitions for fast queries
const INDEXES_SCHEMA: &str = r#"
-- One active edge per referred user and level
CREATE UNIQUE INDEX IF NOT EXISTS idx_referral_active_per_level
    ON referral_edges(referred_id, level) WHERE status = 'active';
CREATE INDEX IF NOT EXISTS idx_referral_referrer ON referral_edges(referrer_id, level, status);

CREATE INDEX IF NOT EXISTS idx_purchases_due ON purchases(status, next_benefit_date);
CREATE INDEX IF NOT EXISTS idx_purchases_user ON purchases(user_id);

CREATE INDEX IF NOT EXISTS idx_ledger_user ON ledger_entries(user_id, entry_type, status);
CREATE INDEX IF NOT EXISTS idx_ledger_source ON ledger_entries(source_purchase_id, entry_type, status);
CREATE INDEX IF NOT EXISTS idx_ledger_sales ON ledger_entries(entry_type, subtype, status, effective_date);

CREATE INDEX IF NOT EXISTS idx_outbox_pending ON commission_outbox(resolved_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }
}
