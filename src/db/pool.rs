//! Pool participants and frozen allocation plans
//!
//! The first run of a cycle freezes who gets what. Later runs read the plan
//! back instead of recomputing it, so a partially paid cycle resumes with
//! the same amounts even if sales or participants changed in between.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::db_err;
use crate::error::EngineError;
use crate::money::{Amount, Bps};

/// Someone eligible for pool bonuses (leader, administrator)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolParticipant {
    pub participant_id: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub joined_on: NaiveDate,
}

fn default_role() -> String {
    "leader".to_string()
}

fn default_active() -> bool {
    true
}

impl PoolParticipant {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            participant_id: row.get("participant_id")?,
            role: row.get("role")?,
            active: row.get("active")?,
            joined_on: row.get("joined_on")?,
        })
    }
}

/// Header of a frozen cycle plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCycleRecord {
    pub cycle_number: u32,
    pub window_start: NaiveDate,
    pub boundary: NaiveDate,
    pub total_eligible_sales: Amount,
    pub bonus_rate_bps: Bps,
    pub pool_total: Amount,
    pub policy: String,
    pub planned_at: String,
}

impl PoolCycleRecord {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            cycle_number: row.get("cycle_number")?,
            window_start: row.get("window_start")?,
            boundary: row.get("boundary")?,
            total_eligible_sales: row.get("total_eligible_sales")?,
            bonus_rate_bps: Bps(row.get("bonus_rate_bps")?),
            pool_total: row.get("pool_total")?,
            policy: row.get("policy")?,
            planned_at: row.get("planned_at")?,
        })
    }
}

/// One participant's share of a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolAllocation {
    pub participant_id: String,
    pub amount: Amount,
    pub weight: i64,
}

/// Insert or update a participant
pub fn upsert_participant(conn: &Connection, participant: &PoolParticipant) -> Result<(), EngineError> {
    if participant.participant_id.is_empty() {
        return Err(EngineError::InvalidInput("participant_id is required".into()));
    }

    conn.execute(
        r#"
        INSERT INTO pool_participants (participant_id, role, active, joined_on)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(participant_id) DO UPDATE SET
            role = excluded.role,
            active = excluded.active,
            joined_on = excluded.joined_on
        "#,
        params![
            participant.participant_id,
            participant.role,
            participant.active,
            participant.joined_on,
        ],
    )
    .map_err(db_err("Upsert failed"))?;

    Ok(())
}

/// Active participants who joined before `boundary`, ordered by ID
pub fn eligible_participants(conn: &Connection, boundary: NaiveDate) -> Result<Vec<PoolParticipant>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT * FROM pool_participants WHERE active = 1 AND joined_on < ? ORDER BY participant_id",
        )
        .map_err(db_err("Prepare failed"))?;

    let rows = stmt
        .query_map(params![boundary], |row| PoolParticipant::from_row(row))
        .map_err(db_err("Query failed"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err("Row parse failed"))?;

    Ok(rows)
}

/// Frozen plan for a cycle, if one exists
pub fn get_plan(
    conn: &Connection,
    cycle_number: u32,
) -> Result<Option<(PoolCycleRecord, Vec<PoolAllocation>)>, EngineError> {
    let record = conn
        .query_row(
            "SELECT * FROM pool_cycles WHERE cycle_number = ?",
            params![cycle_number],
            |row| PoolCycleRecord::from_row(row),
        )
        .optional()
        .map_err(db_err("Query failed"))?;

    let Some(record) = record else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT participant_id, amount, weight FROM pool_allocations WHERE cycle_number = ? ORDER BY participant_id",
        )
        .map_err(db_err("Prepare failed"))?;

    let allocations = stmt
        .query_map(params![cycle_number], |row| {
            Ok(PoolAllocation {
                participant_id: row.get(0)?,
                amount: row.get(1)?,
                weight: row.get(2)?,
            })
        })
        .map_err(db_err("Query failed"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err("Row parse failed"))?;

    Ok(Some((record, allocations)))
}

/// Cycle numbers with a frozen plan, ascending
pub fn planned_cycles(conn: &Connection) -> Result<Vec<u32>, EngineError> {
    let mut stmt = conn
        .prepare("SELECT cycle_number FROM pool_cycles ORDER BY cycle_number")
        .map_err(db_err("Prepare failed"))?;
    let cycles = stmt
        .query_map([], |row| row.get(0))
        .map_err(db_err("Query failed"))?
        .collect::<Result<Vec<u32>, _>>()
        .map_err(db_err("Row read failed"))?;
    Ok(cycles)
}

/// Persist a plan. The allocations must add up to the pool total.
pub fn insert_plan(
    conn: &Connection,
    record: &PoolCycleRecord,
    allocations: &[PoolAllocation],
) -> Result<(), EngineError> {
    let allocated: Amount = allocations.iter().map(|a| a.amount).sum();
    if allocated != record.pool_total {
        return Err(EngineError::InvariantViolation(format!(
            "pool cycle {} allocates {} of {}",
            record.cycle_number, allocated, record.pool_total
        )));
    }

    conn.execute(
        r#"
        INSERT INTO pool_cycles (
            cycle_number, window_start, boundary, total_eligible_sales,
            bonus_rate_bps, pool_total, policy
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            record.cycle_number,
            record.window_start,
            record.boundary,
            record.total_eligible_sales,
            record.bonus_rate_bps.0,
            record.pool_total,
            record.policy,
        ],
    )
    .map_err(db_err("Insert failed"))?;

    let mut stmt = conn
        .prepare(
            "INSERT INTO pool_allocations (cycle_number, participant_id, amount, weight) VALUES (?, ?, ?, ?)",
        )
        .map_err(db_err("Prepare failed"))?;

    for allocation in allocations {
        stmt.execute(params![
            record.cycle_number,
            allocation.participant_id,
            allocation.amount,
            allocation.weight,
        ])
        .map_err(db_err("Insert failed"))?;
    }

    Ok(())
}

/// Completed license sales made by the participant's level-1 referrals with
/// `from <= effective_date < before`
pub fn referral_volume(
    conn: &Connection,
    participant_id: &str,
    from: Option<NaiveDate>,
    before: NaiveDate,
) -> Result<Amount, EngineError> {
    conn.query_row(
        r#"
        SELECT COALESCE(SUM(l.amount), 0)
        FROM ledger_entries l
        JOIN referral_edges r
          ON r.referred_id = l.user_id AND r.level = 1 AND r.status = 'active'
        WHERE r.referrer_id = ?1
          AND l.entry_type = 'deposit' AND l.subtype = 'license_purchase' AND l.status = 'completed'
          AND (?2 IS NULL OR l.effective_date >= ?2)
          AND l.effective_date < ?3
        "#,
        params![participant_id, from, before],
        |row| row.get::<_, i64>(0),
    )
    .map_err(db_err("Sum query failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LedgerDb;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    fn participant(id: &str, joined: NaiveDate, active: bool) -> PoolParticipant {
        PoolParticipant {
            participant_id: id.into(),
            role: "leader".into(),
            active,
            joined_on: joined,
        }
    }

    #[test]
    fn test_eligible_participants_filters_inactive_and_late() {
        let db = LedgerDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert_participant(conn, &participant("a", date(1), true))?;
            upsert_participant(conn, &participant("b", date(1), false))?;
            upsert_participant(conn, &participant("c", date(15), true))?;
            Ok(())
        })
        .unwrap();

        let eligible = db.with_conn(|conn| eligible_participants(conn, date(15))).unwrap();
        let ids: Vec<_> = eligible.iter().map(|p| p.participant_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn test_plan_roundtrip_and_conservation() {
        let db = LedgerDb::open_in_memory().unwrap();
        let record = PoolCycleRecord {
            cycle_number: 1,
            window_start: date(1),
            boundary: date(15),
            total_eligible_sales: 100_000,
            bonus_rate_bps: Bps(500),
            pool_total: 5_000,
            policy: "equal".into(),
            planned_at: String::new(),
        };
        let allocations = vec![
            PoolAllocation { participant_id: "a".into(), amount: 2_500, weight: 1 },
            PoolAllocation { participant_id: "b".into(), amount: 2_500, weight: 1 },
        ];

        db.with_conn(|conn| insert_plan(conn, &record, &allocations)).unwrap();
        let (loaded, loaded_allocations) = db.with_conn(|conn| get_plan(conn, 1)).unwrap().unwrap();
        assert_eq!(loaded.pool_total, 5_000);
        assert_eq!(loaded_allocations, allocations);

        let short = vec![PoolAllocation { participant_id: "a".into(), amount: 1, weight: 1 }];
        let err = db
            .with_conn(|conn| insert_plan(conn, &PoolCycleRecord { cycle_number: 2, ..record.clone() }, &short))
            .unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(db.with_conn(|conn| get_plan(conn, 2)).unwrap().is_none());
    }
}
