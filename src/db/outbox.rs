//! Commission outbox
//!
//! A purchase lands here in the same transaction that completes its first
//! cycle. The commission engine drains the queue; a row stays pending until
//! the commission is paid or found ineligible.

use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::{db_err, now_timestamp};
use crate::error::EngineError;

/// Outbox row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxItem {
    pub purchase_id: String,
    pub enqueued_at: String,
    pub attempts: u32,
    pub resolved_at: Option<String>,
    pub resolution: Option<String>,
    pub last_error: Option<String>,
}

impl OutboxItem {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            purchase_id: row.get("purchase_id")?,
            enqueued_at: row.get("enqueued_at")?,
            attempts: row.get("attempts")?,
            resolved_at: row.get("resolved_at")?,
            resolution: row.get("resolution")?,
            last_error: row.get("last_error")?,
        })
    }
}

/// Queue a purchase; a second enqueue is a no-op
pub fn enqueue(conn: &Connection, purchase_id: &str) -> Result<bool, EngineError> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO commission_outbox (purchase_id) VALUES (?)",
            params![purchase_id],
        )
        .map_err(db_err("Enqueue failed"))?;
    Ok(inserted > 0)
}

/// Unresolved rows, oldest first
pub fn pending(conn: &Connection, limit: u32) -> Result<Vec<OutboxItem>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT * FROM commission_outbox WHERE resolved_at IS NULL ORDER BY enqueued_at, purchase_id LIMIT ?",
        )
        .map_err(db_err("Prepare failed"))?;

    let rows = stmt
        .query_map(params![limit as i64], |row| OutboxItem::from_row(row))
        .map_err(db_err("Query failed"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err("Row parse failed"))?;

    Ok(rows)
}

/// Mark a row done with a short resolution tag (`paid`, `no_referrer`, ...)
pub fn resolve(conn: &Connection, purchase_id: &str, resolution: &str) -> Result<(), EngineError> {
    conn.execute(
        r#"
        UPDATE commission_outbox
        SET resolved_at = ?, resolution = ?, attempts = attempts + 1
        WHERE purchase_id = ? AND resolved_at IS NULL
        "#,
        params![now_timestamp(), resolution, purchase_id],
    )
    .map_err(db_err("Update failed"))?;
    Ok(())
}

/// Count a failed attempt and keep the row pending
pub fn record_failure(conn: &Connection, purchase_id: &str, error: &str) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE commission_outbox SET attempts = attempts + 1, last_error = ? WHERE purchase_id = ?",
        params![error, purchase_id],
    )
    .map_err(db_err("Update failed"))?;
    Ok(())
}
