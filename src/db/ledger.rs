//! Ledger entries and the record-once primitive
//!
//! Every payout is keyed by an [`IdempotencyKey`]. The partial UNIQUE index
//! `idx_ledger_completed_key` guarantees at most one `completed` row per key
//! at the storage layer, so concurrent schedulers or retried requests cannot
//! double-pay: the loser of a race hits the constraint and gets the winner's
//! row back.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{db_err, is_unique_violation, now_timestamp};
use crate::error::EngineError;
use crate::money::Amount;

/// Ledger entry subtypes
pub mod subtypes {
    /// Daily cashback on an active license day
    pub const DAILY_BENEFIT: &str = "daily_benefit";
    /// One-time 10% to the level-1 referrer after the first full cycle
    pub const DIRECT_REFERRAL: &str = "direct_referral";
    /// One-time 5% to the referrer at purchase confirmation
    pub const LICENSE_ACTIVATION: &str = "license_activation";
    /// Biweekly pool share
    pub const POOL_CYCLE: &str = "pool_cycle";
    /// Confirmed license sale; feeds pool sales
    pub const LICENSE_PURCHASE: &str = "license_purchase";
    /// User withdrawal
    pub const PAYOUT: &str = "payout";

    pub const ALL: &[&str] = &[
        DAILY_BENEFIT,
        DIRECT_REFERRAL,
        LICENSE_ACTIVATION,
        POOL_CYCLE,
        LICENSE_PURCHASE,
        PAYOUT,
    ];

    pub fn is_valid(subtype: &str) -> bool {
        ALL.contains(&subtype)
    }
}

/// Ledger entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Earnings,
    Commission,
    PoolBonus,
    Deposit,
    Withdrawal,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Earnings => "earnings",
            EntryType::Commission => "commission",
            EntryType::PoolBonus => "pool_bonus",
            EntryType::Deposit => "deposit",
            EntryType::Withdrawal => "withdrawal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "earnings" => Some(EntryType::Earnings),
            "commission" => Some(EntryType::Commission),
            "pool_bonus" => Some(EntryType::PoolBonus),
            "deposit" => Some(EntryType::Deposit),
            "withdrawal" => Some(EntryType::Withdrawal),
            _ => None,
        }
    }
}

/// Ledger entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntryStatus::Pending),
            "completed" => Some(EntryStatus::Completed),
            "failed" => Some(EntryStatus::Failed),
            _ => None,
        }
    }
}

/// Composite identity of an at-most-once payout
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyKey {
    pub user_id: String,
    pub entry_type: EntryType,
    pub subtype: String,
    pub source_purchase_id: Option<String>,
    pub period_key: String,
}

impl IdempotencyKey {
    /// Earnings for one lifetime active day of a purchase
    pub fn earnings(user_id: &str, purchase_id: &str, period_key: u32) -> Self {
        Self {
            user_id: user_id.to_string(),
            entry_type: EntryType::Earnings,
            subtype: subtypes::DAILY_BENEFIT.to_string(),
            source_purchase_id: Some(purchase_id.to_string()),
            period_key: period_key.to_string(),
        }
    }

    /// One-time commission to `referrer_id` caused by `purchase_id`
    pub fn commission(referrer_id: &str, subtype: &str, purchase_id: &str) -> Self {
        Self {
            user_id: referrer_id.to_string(),
            entry_type: EntryType::Commission,
            subtype: subtype.to_string(),
            source_purchase_id: Some(purchase_id.to_string()),
            period_key: "once".to_string(),
        }
    }

    /// Pool share for a participant in one cycle
    pub fn pool_bonus(participant_id: &str, cycle_number: u32) -> Self {
        Self {
            user_id: participant_id.to_string(),
            entry_type: EntryType::PoolBonus,
            subtype: subtypes::POOL_CYCLE.to_string(),
            source_purchase_id: None,
            period_key: cycle_number.to_string(),
        }
    }

    /// The confirmed sale behind a purchase
    pub fn license_purchase(user_id: &str, purchase_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            entry_type: EntryType::Deposit,
            subtype: subtypes::LICENSE_PURCHASE.to_string(),
            source_purchase_id: Some(purchase_id.to_string()),
            period_key: "once".to_string(),
        }
    }

    /// A withdrawal request; each request is its own period
    pub fn withdrawal(user_id: &str, request_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            entry_type: EntryType::Withdrawal,
            subtype: subtypes::PAYOUT.to_string(),
            source_purchase_id: None,
            period_key: request_id.to_string(),
        }
    }

    /// Canonical string stored in the unique index. `|` is reserved, see
    /// [`validate_id`].
    pub fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.entry_type.as_str(),
            self.subtype,
            self.user_id,
            self.source_purchase_id.as_deref().unwrap_or("-"),
            self.period_key
        )
    }
}

/// Reject identifiers that would make canonical keys ambiguous
pub fn validate_id(field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{} is required", field)));
    }
    if value.contains('|') {
        return Err(EngineError::InvalidInput(format!(
            "{} must not contain '|': {}",
            field, value
        )));
    }
    Ok(())
}

/// Ledger entry row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: String,
    pub user_id: String,
    pub entry_type: EntryType,
    pub subtype: String,
    pub amount: Amount,
    pub currency: String,
    pub status: EntryStatus,
    pub source_purchase_id: Option<String>,
    pub cause_user_id: Option<String>,
    pub period_key: String,
    pub idempotency_key: String,
    pub effective_date: NaiveDate,
    pub note: Option<String>,
    pub created_at: String,
    pub settled_at: Option<String>,
}

impl LedgerEntry {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let entry_type: String = row.get("entry_type")?;
        let status: String = row.get("status")?;

        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            entry_type: EntryType::parse(&entry_type).ok_or_else(|| invalid_text("entry_type", &entry_type))?,
            subtype: row.get("subtype")?,
            amount: row.get("amount")?,
            currency: row.get("currency")?,
            status: EntryStatus::parse(&status).ok_or_else(|| invalid_text("status", &status))?,
            source_purchase_id: row.get("source_purchase_id")?,
            cause_user_id: row.get("cause_user_id")?,
            period_key: row.get("period_key")?,
            idempotency_key: row.get("idempotency_key")?,
            effective_date: row.get("effective_date")?,
            note: row.get("note")?,
            created_at: row.get("created_at")?,
            settled_at: row.get("settled_at")?,
        })
    }
}

pub(crate) fn invalid_text(column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unexpected {} value: {}", column, value).into(),
    )
}

/// Everything an entry needs besides its key
#[derive(Debug, Clone)]
pub struct EntryDraft {
    pub amount: Amount,
    pub currency: String,
    pub cause_user_id: Option<String>,
    pub effective_date: NaiveDate,
    pub note: Option<String>,
}

/// Result of [`record_once`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub entry: LedgerEntry,
    /// The key was already paid; `entry` is the pre-existing row
    pub already_existed: bool,
}

/// Query parameters for listing entries - camelCase for URL params
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerQuery {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, rename = "type")]
    pub entry_type: Option<EntryType>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub status: Option<EntryStatus>,
    #[serde(default)]
    pub source_purchase_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 { 100 }

impl Default for LedgerQuery {
    fn default() -> Self {
        Self {
            user_id: None,
            entry_type: None,
            subtype: None,
            status: None,
            source_purchase_id: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

// ============================================================================
// Read Operations
// ============================================================================

/// Get entry by ID
pub fn get_entry(conn: &Connection, id: &str) -> Result<Option<LedgerEntry>, EngineError> {
    conn.query_row(
        "SELECT * FROM ledger_entries WHERE id = ?",
        params![id],
        |row| LedgerEntry::from_row(row),
    )
    .optional()
    .map_err(db_err("Query failed"))
}

/// The completed entry for a key, if any
pub fn find_completed(conn: &Connection, key: &IdempotencyKey) -> Result<Option<LedgerEntry>, EngineError> {
    conn.query_row(
        "SELECT * FROM ledger_entries WHERE idempotency_key = ? AND status = 'completed'",
        params![key.canonical()],
        |row| LedgerEntry::from_row(row),
    )
    .optional()
    .map_err(db_err("Query failed"))
}

/// List entries with optional filters, newest first
pub fn list_entries(conn: &Connection, query: &LedgerQuery) -> Result<Vec<LedgerEntry>, EngineError> {
    let mut sql = String::from("SELECT * FROM ledger_entries");
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];
    let mut conditions = vec![];

    if let Some(ref user_id) = query.user_id {
        conditions.push("user_id = ?");
        params.push(Box::new(user_id.clone()));
    }
    if let Some(entry_type) = query.entry_type {
        conditions.push("entry_type = ?");
        params.push(Box::new(entry_type.as_str()));
    }
    if let Some(ref subtype) = query.subtype {
        conditions.push("subtype = ?");
        params.push(Box::new(subtype.clone()));
    }
    if let Some(status) = query.status {
        conditions.push("status = ?");
        params.push(Box::new(status.as_str()));
    }
    if let Some(ref source) = query.source_purchase_id {
        conditions.push("source_purchase_id = ?");
        params.push(Box::new(source.clone()));
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    sql.push_str(" ORDER BY effective_date DESC, created_at DESC, id LIMIT ? OFFSET ?");
    params.push(Box::new(query.limit as i64));
    params.push(Box::new(query.offset as i64));

    debug!("Executing query: {}", sql);

    let mut stmt = conn.prepare(&sql).map_err(db_err("Prepare failed"))?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let rows = stmt
        .query_map(param_refs.as_slice(), |row| LedgerEntry::from_row(row))
        .map_err(db_err("Query failed"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err("Row parse failed"))?;

    Ok(rows)
}

/// Completed earnings entries recorded for a purchase
pub fn count_completed_earnings(conn: &Connection, purchase_id: &str) -> Result<u32, EngineError> {
    conn.query_row(
        "SELECT COUNT(*) FROM ledger_entries WHERE source_purchase_id = ? AND entry_type = 'earnings' AND status = 'completed'",
        params![purchase_id],
        |row| row.get::<_, u32>(0),
    )
    .map_err(db_err("Count query failed"))
}

/// Latest completed earnings entry for a purchase
pub fn latest_earnings(conn: &Connection, purchase_id: &str) -> Result<Option<LedgerEntry>, EngineError> {
    conn.query_row(
        r#"
        SELECT * FROM ledger_entries
        WHERE source_purchase_id = ? AND entry_type = 'earnings' AND status = 'completed'
        ORDER BY CAST(period_key AS INTEGER) DESC
        LIMIT 1
        "#,
        params![purchase_id],
        |row| LedgerEntry::from_row(row),
    )
    .optional()
    .map_err(db_err("Query failed"))
}

/// Sum of completed license sales with `from <= effective_date < before`
pub fn sum_license_sales(
    conn: &Connection,
    from: Option<NaiveDate>,
    before: NaiveDate,
) -> Result<Amount, EngineError> {
    conn.query_row(
        r#"
        SELECT COALESCE(SUM(amount), 0) FROM ledger_entries
        WHERE entry_type = 'deposit' AND subtype = 'license_purchase' AND status = 'completed'
          AND (?1 IS NULL OR effective_date >= ?1)
          AND effective_date < ?2
        "#,
        params![from, before],
        |row| row.get::<_, i64>(0),
    )
    .map_err(db_err("Sum query failed"))
}

/// Sum of completed amounts per entry type for a user
pub fn completed_totals_by_type(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<(EntryType, Amount)>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT entry_type, COALESCE(SUM(amount), 0) FROM ledger_entries WHERE user_id = ? AND status = 'completed' GROUP BY entry_type",
        )
        .map_err(db_err("Prepare failed"))?;

    let rows = stmt
        .query_map(params![user_id], |row| {
            let raw: String = row.get(0)?;
            let entry_type = EntryType::parse(&raw).ok_or_else(|| invalid_text("entry_type", &raw))?;
            Ok((entry_type, row.get::<_, i64>(1)?))
        })
        .map_err(db_err("Query failed"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err("Row parse failed"))?;

    Ok(rows)
}

/// Sum of pending withdrawals for a user (reserved funds)
pub fn pending_withdrawals(conn: &Connection, user_id: &str) -> Result<Amount, EngineError> {
    conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM ledger_entries WHERE user_id = ? AND entry_type = 'withdrawal' AND status = 'pending'",
        params![user_id],
        |row| row.get::<_, i64>(0),
    )
    .map_err(db_err("Sum query failed"))
}

/// Keys holding more than one completed row. Always empty while the unique
/// index exists; used by invariant scans against imported data.
pub fn duplicate_completed_keys(conn: &Connection) -> Result<Vec<(String, i64)>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT idempotency_key, COUNT(*) FROM ledger_entries WHERE status = 'completed' GROUP BY idempotency_key HAVING COUNT(*) > 1",
        )
        .map_err(db_err("Prepare failed"))?;

    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(db_err("Query failed"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err("Row parse failed"))?;

    Ok(rows)
}

/// Pending or completed entry for a key, completed first
pub fn find_open(conn: &Connection, key: &IdempotencyKey) -> Result<Option<LedgerEntry>, EngineError> {
    conn.query_row(
        r#"
        SELECT * FROM ledger_entries
        WHERE idempotency_key = ? AND status IN ('pending', 'completed')
        ORDER BY status = 'completed' DESC, created_at
        LIMIT 1
        "#,
        params![key.canonical()],
        |row| LedgerEntry::from_row(row),
    )
    .optional()
    .map_err(db_err("Query failed"))
}

fn query_ids(conn: &Connection, sql: &str) -> Result<Vec<String>, EngineError> {
    let mut stmt = conn.prepare(sql).map_err(db_err("Prepare failed"))?;
    let ids = stmt
        .query_map([], |row| row.get(0))
        .map_err(db_err("Query failed"))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(db_err("Row parse failed"))?;
    Ok(ids)
}

/// Purchases with more completed earnings than `max_cycles * 8`
pub fn earnings_over_cap(conn: &Connection) -> Result<Vec<String>, EngineError> {
    query_ids(
        conn,
        r#"
        SELECT p.id FROM purchases p
        JOIN (
            SELECT source_purchase_id, COUNT(*) AS paid FROM ledger_entries
            WHERE entry_type = 'earnings' AND status = 'completed'
            GROUP BY source_purchase_id
        ) e ON e.source_purchase_id = p.id
        WHERE e.paid > p.max_cycles * 8
        ORDER BY p.id
        "#,
    )
}

/// Purchases with more than 8 completed earnings in one cycle
pub fn earnings_cycle_overruns(conn: &Connection) -> Result<Vec<String>, EngineError> {
    query_ids(
        conn,
        r#"
        SELECT DISTINCT source_purchase_id FROM ledger_entries
        WHERE entry_type = 'earnings' AND status = 'completed'
        GROUP BY source_purchase_id, (CAST(period_key AS INTEGER) - 1) / 8
        HAVING COUNT(*) > 8
        ORDER BY source_purchase_id
        "#,
    )
}

/// Referral commissions whose (referrer, referred) pair has no level-1 edge
pub fn commissions_without_level_one_edge(conn: &Connection) -> Result<Vec<String>, EngineError> {
    query_ids(
        conn,
        r#"
        SELECT l.id FROM ledger_entries l
        WHERE l.entry_type = 'commission' AND l.status = 'completed'
          AND NOT EXISTS (
            SELECT 1 FROM referral_edges r
            WHERE r.referrer_id = l.user_id AND r.referred_id = l.cause_user_id AND r.level = 1
          )
        ORDER BY l.id
        "#,
    )
}

// ============================================================================
// Write Operations
// ============================================================================

fn insert_entry(
    conn: &Connection,
    key: &IdempotencyKey,
    draft: &EntryDraft,
    status: EntryStatus,
) -> Result<String, rusqlite::Error> {
    let id = Uuid::new_v4().to_string();
    let settled_at = (status != EntryStatus::Pending).then(now_timestamp);

    conn.execute(
        r#"
        INSERT INTO ledger_entries (
            id, user_id, entry_type, subtype, amount, currency, status,
            source_purchase_id, cause_user_id, period_key, idempotency_key,
            effective_date, note, settled_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            id,
            key.user_id,
            key.entry_type.as_str(),
            key.subtype,
            draft.amount,
            draft.currency,
            status.as_str(),
            key.source_purchase_id,
            draft.cause_user_id,
            key.period_key,
            key.canonical(),
            draft.effective_date,
            draft.note,
            settled_at,
        ],
    )?;

    Ok(id)
}

fn validate_draft(key: &IdempotencyKey, draft: &EntryDraft) -> Result<(), EngineError> {
    if draft.amount < 0 {
        return Err(EngineError::InvalidInput(format!(
            "negative amount {} for {}",
            draft.amount,
            key.canonical()
        )));
    }
    if !subtypes::is_valid(&key.subtype) {
        return Err(EngineError::InvalidInput(format!(
            "Invalid subtype: {}. Valid subtypes: {:?}",
            key.subtype,
            subtypes::ALL
        )));
    }
    Ok(())
}

/// Record a completed entry at most once per key.
///
/// `build` is only invoked when the key is not yet paid. A concurrent
/// writer that wins the race surfaces as a unique violation, which is the
/// already-existed branch, not an error.
pub fn record_once<F>(
    conn: &Connection,
    key: &IdempotencyKey,
    build: F,
) -> Result<RecordOutcome, EngineError>
where
    F: FnOnce() -> Result<EntryDraft, EngineError>,
{
    if let Some(existing) = find_completed(conn, key)? {
        debug!(key = %key.canonical(), entry_id = %existing.id, "Ledger key already recorded");
        return Ok(RecordOutcome { entry: existing, already_existed: true });
    }

    let draft = build()?;
    validate_draft(key, &draft)?;

    match insert_entry(conn, key, &draft, EntryStatus::Completed) {
        Ok(id) => {
            let entry = get_entry(conn, &id)?
                .ok_or_else(|| EngineError::Internal("Entry not found after insert".into()))?;
            Ok(RecordOutcome { entry, already_existed: false })
        }
        Err(e) if is_unique_violation(&e) => {
            warn!(key = %key.canonical(), "Lost insert race, returning existing ledger entry");
            let existing = find_completed(conn, key)?.ok_or_else(|| {
                EngineError::InvariantViolation(format!(
                    "unique violation on {} but no completed row found",
                    key.canonical()
                ))
            })?;
            Ok(RecordOutcome { entry: existing, already_existed: true })
        }
        Err(e) => Err(db_err("Insert failed")(e)),
    }
}

/// Record a pending entry (settled later with [`settle_entry`])
pub fn record_pending(
    conn: &Connection,
    key: &IdempotencyKey,
    draft: EntryDraft,
) -> Result<LedgerEntry, EngineError> {
    validate_draft(key, &draft)?;

    let id = insert_entry(conn, key, &draft, EntryStatus::Pending)
        .map_err(db_err("Insert failed"))?;

    get_entry(conn, &id)?
        .ok_or_else(|| EngineError::Internal("Entry not found after insert".into()))
}

/// Move a pending entry to `completed` or `failed`.
///
/// Completing an entry whose key already holds a completed row fails the
/// pending one instead and returns the existing row.
pub fn settle_entry(
    conn: &Connection,
    id: &str,
    outcome: EntryStatus,
) -> Result<RecordOutcome, EngineError> {
    if outcome == EntryStatus::Pending {
        return Err(EngineError::InvalidInput("cannot settle an entry to pending".into()));
    }

    let entry = get_entry(conn, id)?
        .ok_or_else(|| EngineError::NotFound(format!("ledger entry {}", id)))?;

    if entry.status != EntryStatus::Pending {
        if entry.status == outcome {
            return Ok(RecordOutcome { entry, already_existed: true });
        }
        return Err(EngineError::InvariantViolation(format!(
            "ledger entry {} already settled as {}",
            id,
            entry.status.as_str()
        )));
    }

    let result = conn.execute(
        "UPDATE ledger_entries SET status = ?, settled_at = ? WHERE id = ? AND status = 'pending'",
        params![outcome.as_str(), now_timestamp(), id],
    );

    match result {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            conn.execute(
                "UPDATE ledger_entries SET status = 'failed', settled_at = ?, note = 'duplicate of completed entry' WHERE id = ?",
                params![now_timestamp(), id],
            )
            .map_err(db_err("Update failed"))?;

            let key: String = entry.idempotency_key.clone();
            let existing = conn
                .query_row(
                    "SELECT * FROM ledger_entries WHERE idempotency_key = ? AND status = 'completed'",
                    params![key],
                    |row| LedgerEntry::from_row(row),
                )
                .map_err(db_err("Query failed"))?;
            return Ok(RecordOutcome { entry: existing, already_existed: true });
        }
        Err(e) => return Err(db_err("Update failed")(e)),
    }

    let settled = get_entry(conn, id)?
        .ok_or_else(|| EngineError::Internal("Entry not found after settle".into()))?;
    Ok(RecordOutcome { entry: settled, already_existed: false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LedgerDb;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    fn draft(amount: Amount) -> EntryDraft {
        EntryDraft {
            amount,
            currency: "USDT".into(),
            cause_user_id: None,
            effective_date: date(2),
            note: None,
        }
    }

    #[test]
    fn test_record_once_is_idempotent() {
        let db = LedgerDb::open_in_memory().unwrap();
        let key = IdempotencyKey::earnings("alice", "p1", 1);

        let first = db.with_conn(|conn| record_once(conn, &key, || Ok(draft(1250)))).unwrap();
        assert!(!first.already_existed);
        assert_eq!(first.entry.amount, 1250);
        assert_eq!(first.entry.status, EntryStatus::Completed);

        let mut built = false;
        let second = db
            .with_conn(|conn| {
                record_once(conn, &key, || {
                    built = true;
                    Ok(draft(9999))
                })
            })
            .unwrap();
        assert!(second.already_existed);
        assert!(!built);
        assert_eq!(second.entry, first.entry);
    }

    #[test]
    fn test_unique_index_blocks_raw_duplicate() {
        let db = LedgerDb::open_in_memory().unwrap();
        let key = IdempotencyKey::pool_bonus("leader", 1);

        db.with_conn(|conn| {
            insert_entry(conn, &key, &draft(10), EntryStatus::Completed).map_err(db_err("Insert failed"))
        })
        .unwrap();

        // Bypasses the pre-check: the storage constraint must still hold
        let err = db
            .with_conn(|conn| Ok(insert_entry(conn, &key, &draft(10), EntryStatus::Completed)))
            .unwrap()
            .unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[test]
    fn test_completed_entries_are_immutable() {
        let db = LedgerDb::open_in_memory().unwrap();
        let key = IdempotencyKey::earnings("alice", "p1", 1);
        let outcome = db.with_conn(|conn| record_once(conn, &key, || Ok(draft(1250)))).unwrap();

        let update = db.with_conn(|conn| {
            conn.execute(
                "UPDATE ledger_entries SET amount = 1 WHERE id = ?",
                params![outcome.entry.id],
            )
            .map_err(db_err("Update failed"))
        });
        assert!(update.unwrap_err().is_invariant_violation());

        let delete = db.with_conn(|conn| {
            conn.execute("DELETE FROM ledger_entries WHERE id = ?", params![outcome.entry.id])
                .map_err(db_err("Delete failed"))
        });
        assert!(delete.is_err());
    }

    #[test]
    fn test_pending_settle_lifecycle() {
        let db = LedgerDb::open_in_memory().unwrap();
        let key = IdempotencyKey::withdrawal("alice", "w1");

        let pending = db.with_conn(|conn| record_pending(conn, &key, draft(500))).unwrap();
        assert_eq!(pending.status, EntryStatus::Pending);
        assert!(pending.settled_at.is_none());

        let settled = db
            .with_conn(|conn| settle_entry(conn, &pending.id, EntryStatus::Completed))
            .unwrap();
        assert!(!settled.already_existed);
        assert_eq!(settled.entry.status, EntryStatus::Completed);

        let again = db
            .with_conn(|conn| settle_entry(conn, &pending.id, EntryStatus::Completed))
            .unwrap();
        assert!(again.already_existed);

        let flip = db.with_conn(|conn| settle_entry(conn, &pending.id, EntryStatus::Failed));
        assert!(flip.unwrap_err().is_invariant_violation());
    }

    #[test]
    fn test_settle_duplicate_key_fails_pending_row() {
        let db = LedgerDb::open_in_memory().unwrap();
        let key = IdempotencyKey::withdrawal("alice", "w1");

        let a = db.with_conn(|conn| record_pending(conn, &key, draft(500))).unwrap();
        let b = db.with_conn(|conn| record_pending(conn, &key, draft(500))).unwrap();

        db.with_conn(|conn| settle_entry(conn, &a.id, EntryStatus::Completed)).unwrap();
        let dup = db.with_conn(|conn| settle_entry(conn, &b.id, EntryStatus::Completed)).unwrap();
        assert!(dup.already_existed);
        assert_eq!(dup.entry.id, a.id);

        let b_row = db.with_conn(|conn| get_entry(conn, &b.id)).unwrap().unwrap();
        assert_eq!(b_row.status, EntryStatus::Failed);
    }

    #[test]
    fn test_sales_window_and_listing() {
        let db = LedgerDb::open_in_memory().unwrap();
        for (i, day) in [1u32, 5, 20].iter().enumerate() {
            let key = IdempotencyKey::license_purchase("buyer", &format!("p{}", i));
            let mut d = draft(10_000);
            d.effective_date = date(*day);
            db.with_conn(|conn| record_once(conn, &key, || Ok(d))).unwrap();
        }

        let total = db.with_conn(|conn| sum_license_sales(conn, None, date(15))).unwrap();
        assert_eq!(total, 20_000);
        let windowed = db.with_conn(|conn| sum_license_sales(conn, Some(date(2)), date(21))).unwrap();
        assert_eq!(windowed, 20_000);

        let listed = db
            .with_conn(|conn| {
                list_entries(conn, &LedgerQuery {
                    user_id: Some("buyer".into()),
                    entry_type: Some(EntryType::Deposit),
                    limit: 2,
                    ..Default::default()
                })
            })
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].effective_date, date(20));
    }

    #[test]
    fn test_validate_id_rejects_separator() {
        assert!(validate_id("user_id", "a|b").is_err());
        assert!(validate_id("user_id", " ").is_err());
        assert!(validate_id("user_id", "alice").is_ok());
    }
}
