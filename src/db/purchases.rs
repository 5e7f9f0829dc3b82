//! Purchase (license) state
//!
//! Only the accrual engine writes cycle state. Every write is a
//! compare-and-set on `version`, so two concurrent advances of the same
//! purchase cannot both commit.

use chrono::NaiveDate;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::ledger::invalid_text;
use super::packages::PackageTerms;
use super::{db_err, is_unique_violation};
use crate::cycle::CycleState;
use crate::error::EngineError;
use crate::money::{Amount, Bps};

/// Purchase lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Pending => "pending",
            PurchaseStatus::Active => "active",
            PurchaseStatus::Completed => "completed",
            PurchaseStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PurchaseStatus::Pending),
            "active" => Some(PurchaseStatus::Active),
            "completed" => Some(PurchaseStatus::Completed),
            "cancelled" => Some(PurchaseStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PurchaseStatus::Completed | PurchaseStatus::Cancelled)
    }
}

/// Purchase row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    pub id: String,
    pub user_id: String,
    pub package_id: String,
    pub amount: Amount,
    pub currency: String,
    pub terms: PackageTerms,
    pub status: PurchaseStatus,
    pub cycle: CycleState,
    pub next_benefit_date: Option<NaiveDate>,
    pub last_advanced_on: Option<NaiveDate>,
    pub activated_on: Option<NaiveDate>,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Purchase {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let status: String = row.get("status")?;

        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            package_id: row.get("package_id")?,
            amount: row.get("amount")?,
            currency: row.get("currency")?,
            terms: PackageTerms {
                daily_rate_bps: Bps(row.get("daily_rate_bps")?),
                max_cycles: row.get("max_cycles")?,
                direct_referral_rate_bps: Bps(row.get("direct_referral_rate_bps")?),
                activation_rate_bps: Bps(row.get("activation_rate_bps")?),
            },
            status: PurchaseStatus::parse(&status).ok_or_else(|| invalid_text("status", &status))?,
            cycle: CycleState {
                current_day: row.get("current_day")?,
                cycles_completed: row.get("cycles_completed")?,
                first_cycle_completed: row.get("first_cycle_completed")?,
            },
            next_benefit_date: row.get("next_benefit_date")?,
            last_advanced_on: row.get("last_advanced_on")?,
            activated_on: row.get("activated_on")?,
            version: row.get("version")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// Daily payout on an active day
    pub fn daily_payout(&self) -> Amount {
        self.terms.daily_rate_bps.apply(self.amount)
    }
}

/// Input for creating a purchase from a confirmed deposit
#[derive(Debug, Clone)]
pub struct NewPurchase {
    pub id: String,
    pub user_id: String,
    pub package_id: String,
    pub amount: Amount,
    pub currency: String,
    pub terms: PackageTerms,
    pub status: PurchaseStatus,
    pub activated_on: Option<NaiveDate>,
}

/// State delta written by one advance
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub status: PurchaseStatus,
    pub cycle: CycleState,
    pub next_benefit_date: Option<NaiveDate>,
    pub last_advanced_on: Option<NaiveDate>,
}

/// Query parameters for listing purchases
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseQuery {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: Option<PurchaseStatus>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 { 100 }

impl Default for PurchaseQuery {
    fn default() -> Self {
        Self {
            user_id: None,
            status: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

/// Get purchase by ID
pub fn get_purchase(conn: &Connection, id: &str) -> Result<Option<Purchase>, EngineError> {
    conn.query_row(
        "SELECT * FROM purchases WHERE id = ?",
        params![id],
        |row| Purchase::from_row(row),
    )
    .optional()
    .map_err(db_err("Query failed"))
}

/// Get purchase by ID or fail with NotFound
pub fn require_purchase(conn: &Connection, id: &str) -> Result<Purchase, EngineError> {
    get_purchase(conn, id)?.ok_or_else(|| EngineError::NotFound(format!("purchase {}", id)))
}

/// Insert a purchase. Returns false when the ID already exists.
pub fn insert_purchase(conn: &Connection, input: &NewPurchase) -> Result<bool, EngineError> {
    let (cycle, next_benefit_date) = match (input.status, input.activated_on) {
        (PurchaseStatus::Active, Some(on)) => (CycleState::start(), on.succ_opt()),
        (PurchaseStatus::Active, None) => {
            return Err(EngineError::InvalidInput("active purchase needs an activation date".into()));
        }
        _ => (
            CycleState { current_day: 0, cycles_completed: 0, first_cycle_completed: false },
            None,
        ),
    };

    let result = conn.execute(
        r#"
        INSERT INTO purchases (
            id, user_id, package_id, amount, currency,
            daily_rate_bps, max_cycles, direct_referral_rate_bps, activation_rate_bps,
            status, current_day, cycles_completed, first_cycle_completed,
            next_benefit_date, activated_on
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            input.id,
            input.user_id,
            input.package_id,
            input.amount,
            input.currency,
            input.terms.daily_rate_bps.0,
            input.terms.max_cycles,
            input.terms.direct_referral_rate_bps.0,
            input.terms.activation_rate_bps.0,
            input.status.as_str(),
            cycle.current_day,
            cycle.cycles_completed,
            cycle.first_cycle_completed,
            next_benefit_date,
            input.activated_on,
        ],
    );

    match result {
        Ok(_) => Ok(true),
        Err(e) if is_unique_violation(&e) => Ok(false),
        Err(e) => Err(db_err("Insert failed")(e)),
    }
}

/// Compare-and-set the cycle state. A stale `expected_version` means another
/// writer committed first; the caller retries the whole unit.
pub fn update_state(
    conn: &Connection,
    id: &str,
    expected_version: i64,
    update: &StateUpdate,
) -> Result<i64, EngineError> {
    let changed = conn
        .execute(
            r#"
            UPDATE purchases SET
                status = ?, current_day = ?, cycles_completed = ?, first_cycle_completed = ?,
                next_benefit_date = ?, last_advanced_on = ?,
                version = version + 1, updated_at = datetime('now')
            WHERE id = ? AND version = ?
            "#,
            params![
                update.status.as_str(),
                update.cycle.current_day,
                update.cycle.cycles_completed,
                update.cycle.first_cycle_completed,
                update.next_benefit_date,
                update.last_advanced_on,
                id,
                expected_version,
            ],
        )
        .map_err(db_err("Update failed"))?;

    if changed == 0 {
        return Err(EngineError::Storage(format!(
            "purchase {} was modified concurrently (expected version {})",
            id, expected_version
        )));
    }

    Ok(expected_version + 1)
}

/// IDs of active purchases due on or before `as_of`
pub fn list_due(conn: &Connection, as_of: NaiveDate) -> Result<Vec<String>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT id FROM purchases WHERE status = 'active' AND next_benefit_date <= ? ORDER BY next_benefit_date, id",
        )
        .map_err(db_err("Prepare failed"))?;

    let ids = stmt
        .query_map(params![as_of], |row| row.get(0))
        .map_err(db_err("Query failed"))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(db_err("Row parse failed"))?;

    Ok(ids)
}

/// IDs of all purchases in the given statuses
pub fn list_ids_by_status(conn: &Connection, statuses: &[PurchaseStatus]) -> Result<Vec<String>, EngineError> {
    if statuses.is_empty() {
        return Ok(vec![]);
    }

    let placeholders: Vec<_> = statuses.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT id FROM purchases WHERE status IN ({}) ORDER BY id",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql).map_err(db_err("Prepare failed"))?;

    let ids = stmt
        .query_map(params_from_iter(statuses.iter().map(|s| s.as_str())), |row| row.get(0))
        .map_err(db_err("Query failed"))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(db_err("Row parse failed"))?;

    Ok(ids)
}

/// List purchases with optional filters
pub fn list_purchases(conn: &Connection, query: &PurchaseQuery) -> Result<Vec<Purchase>, EngineError> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT * FROM purchases
            WHERE (?1 IS NULL OR user_id = ?1) AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at DESC, id
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .map_err(db_err("Prepare failed"))?;

    let rows = stmt
        .query_map(
            params![
                query.user_id,
                query.status.map(|s| s.as_str()),
                query.limit as i64,
                query.offset as i64,
            ],
            |row| Purchase::from_row(row),
        )
        .map_err(db_err("Query failed"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err("Row parse failed"))?;

    Ok(rows)
}
