//! Referral graph read model
//!
//! Edges are pushed in by the onboarding service. Only level 1 pays a
//! direct commission; deeper levels are stored for reporting and pool
//! weighting.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use super::db_err;
use crate::error::EngineError;

/// One referrer -> referred edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralEdge {
    pub referrer_id: String,
    pub referred_id: String,
    pub level: u32,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "active".to_string()
}

impl ReferralEdge {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            referrer_id: row.get("referrer_id")?,
            referred_id: row.get("referred_id")?,
            level: row.get("level")?,
            status: row.get("status")?,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// Insert or update an edge
pub fn upsert_edge(conn: &Connection, edge: &ReferralEdge) -> Result<(), EngineError> {
    if edge.level == 0 {
        return Err(EngineError::InvalidInput("referral level starts at 1".into()));
    }
    if edge.referrer_id.is_empty() || edge.referred_id.is_empty() {
        return Err(EngineError::InvalidInput("referral edge needs both user IDs".into()));
    }

    conn.execute(
        r#"
        INSERT INTO referral_edges (referrer_id, referred_id, level, status)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(referrer_id, referred_id, level) DO UPDATE SET status = excluded.status
        "#,
        params![edge.referrer_id, edge.referred_id, edge.level, edge.status],
    )
    .map_err(db_err("Upsert failed"))?;

    Ok(())
}

/// Active edges pointing at `referred_id` on the given level
pub fn active_edges_for(
    conn: &Connection,
    referred_id: &str,
    level: u32,
) -> Result<Vec<ReferralEdge>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT * FROM referral_edges WHERE referred_id = ? AND level = ? AND status = 'active' ORDER BY referrer_id",
        )
        .map_err(db_err("Prepare failed"))?;

    let rows = stmt
        .query_map(params![referred_id, level], |row| ReferralEdge::from_row(row))
        .map_err(db_err("Query failed"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err("Row parse failed"))?;

    Ok(rows)
}

/// The single active level-1 referrer of a user, if any.
///
/// More than one active level-1 edge means the read model is corrupt.
pub fn level_one_referrer(conn: &Connection, referred_id: &str) -> Result<Option<String>, EngineError> {
    let mut edges = active_edges_for(conn, referred_id, 1)?;
    match edges.len() {
        0 => Ok(None),
        1 => Ok(edges.pop().map(|e| e.referrer_id)),
        n => Err(EngineError::InvariantViolation(format!(
            "user {} has {} active level-1 referrers",
            referred_id, n
        ))),
    }
}

/// Users directly referred by `referrer_id`
pub fn direct_referrals(conn: &Connection, referrer_id: &str) -> Result<Vec<String>, EngineError> {
    let mut stmt = conn
        .prepare(
            "SELECT referred_id FROM referral_edges WHERE referrer_id = ? AND level = 1 AND status = 'active' ORDER BY referred_id",
        )
        .map_err(db_err("Prepare failed"))?;

    let ids = stmt
        .query_map(params![referrer_id], |row| row.get(0))
        .map_err(db_err("Query failed"))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(db_err("Row parse failed"))?;

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LedgerDb;

    fn edge(referrer: &str, referred: &str, level: u32) -> ReferralEdge {
        ReferralEdge {
            referrer_id: referrer.into(),
            referred_id: referred.into(),
            level,
            status: "active".into(),
        }
    }

    #[test]
    fn test_level_one_lookup() {
        let db = LedgerDb::open_in_memory().unwrap();
        db.with_conn(|conn| upsert_edge(conn, &edge("sponsor", "alice", 1))).unwrap();
        db.with_conn(|conn| upsert_edge(conn, &edge("grand", "alice", 2))).unwrap();

        let referrer = db.with_conn(|conn| level_one_referrer(conn, "alice")).unwrap();
        assert_eq!(referrer.as_deref(), Some("sponsor"));
        assert_eq!(db.with_conn(|conn| level_one_referrer(conn, "bob")).unwrap(), None);
        assert_eq!(
            db.with_conn(|conn| direct_referrals(conn, "sponsor")).unwrap(),
            vec!["alice".to_string()]
        );
    }

    #[test]
    fn test_second_active_level_one_edge_is_rejected() {
        let db = LedgerDb::open_in_memory().unwrap();
        db.with_conn(|conn| upsert_edge(conn, &edge("sponsor", "alice", 1))).unwrap();
        let err = db
            .with_conn(|conn| upsert_edge(conn, &edge("other", "alice", 1)))
            .unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_deactivated_edge_is_ignored() {
        let db = LedgerDb::open_in_memory().unwrap();
        let mut e = edge("sponsor", "alice", 1);
        db.with_conn(|conn| upsert_edge(conn, &e)).unwrap();
        e.status = "inactive".into();
        db.with_conn(|conn| upsert_edge(conn, &e)).unwrap();

        assert_eq!(db.with_conn(|conn| level_one_referrer(conn, "alice")).unwrap(), None);
        db.with_conn(|conn| upsert_edge(conn, &edge("other", "alice", 1))).unwrap();
        assert_eq!(
            db.with_conn(|conn| level_one_referrer(conn, "alice")).unwrap().as_deref(),
            Some("other")
        );
    }
}
