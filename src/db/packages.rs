//! Package catalog read model
//!
//! The catalog itself is owned by an external service; it pushes the terms
//! each package pays under so deposits can snapshot them.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::db_err;
use crate::config::PackageDefaults;
use crate::error::EngineError;
use crate::money::Bps;

/// Payout terms of a package, copied onto every purchase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageTerms {
    pub daily_rate_bps: Bps,
    pub max_cycles: u32,
    pub direct_referral_rate_bps: Bps,
    pub activation_rate_bps: Bps,
}

impl PackageTerms {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_cycles == 0 {
            return Err(EngineError::InvalidInput("max_cycles must be positive".into()));
        }
        self.daily_rate_bps.validate("daily_rate_bps")?;
        self.direct_referral_rate_bps.validate("direct_referral_rate_bps")?;
        self.activation_rate_bps.validate("activation_rate_bps")?;
        Ok(())
    }
}

impl From<&PackageDefaults> for PackageTerms {
    fn from(d: &PackageDefaults) -> Self {
        Self {
            daily_rate_bps: d.daily_rate_bps,
            max_cycles: d.max_cycles,
            direct_referral_rate_bps: d.direct_referral_rate_bps,
            activation_rate_bps: d.activation_rate_bps,
        }
    }
}

/// Catalog row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub id: String,
    pub name: Option<String>,
    #[serde(flatten)]
    pub terms: PackageTerms,
}

impl Package {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            terms: PackageTerms {
                daily_rate_bps: Bps(row.get("daily_rate_bps")?),
                max_cycles: row.get("max_cycles")?,
                direct_referral_rate_bps: Bps(row.get("direct_referral_rate_bps")?),
                activation_rate_bps: Bps(row.get("activation_rate_bps")?),
            },
        })
    }
}

/// Get a package by ID
pub fn get_package(conn: &Connection, id: &str) -> Result<Option<Package>, EngineError> {
    conn.query_row(
        "SELECT * FROM packages WHERE id = ?",
        params![id],
        |row| Package::from_row(row),
    )
    .optional()
    .map_err(db_err("Query failed"))
}

/// Insert or replace catalog terms
pub fn upsert_package(conn: &Connection, package: &Package) -> Result<(), EngineError> {
    package.terms.validate()?;

    conn.execute(
        r#"
        INSERT INTO packages (id, name, daily_rate_bps, max_cycles, direct_referral_rate_bps, activation_rate_bps)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            daily_rate_bps = excluded.daily_rate_bps,
            max_cycles = excluded.max_cycles,
            direct_referral_rate_bps = excluded.direct_referral_rate_bps,
            activation_rate_bps = excluded.activation_rate_bps,
            updated_at = datetime('now')
        "#,
        params![
            package.id,
            package.name,
            package.terms.daily_rate_bps.0,
            package.terms.max_cycles,
            package.terms.direct_referral_rate_bps.0,
            package.terms.activation_rate_bps.0,
        ],
    )
    .map_err(db_err("Upsert failed"))?;

    Ok(())
}

/// List all packages
pub fn list_packages(conn: &Connection) -> Result<Vec<Package>, EngineError> {
    let mut stmt = conn
        .prepare("SELECT * FROM packages ORDER BY id")
        .map_err(db_err("Prepare failed"))?;

    let rows = stmt
        .query_map([], |row| Package::from_row(row))
        .map_err(db_err("Query failed"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err("Row parse failed"))?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LedgerDb;

    #[test]
    fn test_upsert_and_get() {
        let db = LedgerDb::open_in_memory().unwrap();
        let mut pkg = Package {
            id: "gold".into(),
            name: Some("Gold".into()),
            terms: PackageTerms::from(&PackageDefaults::default()),
        };

        db.with_conn(|conn| upsert_package(conn, &pkg)).unwrap();
        pkg.terms.max_cycles = 3;
        db.with_conn(|conn| upsert_package(conn, &pkg)).unwrap();

        let loaded = db.with_conn(|conn| get_package(conn, "gold")).unwrap().unwrap();
        assert_eq!(loaded.terms.max_cycles, 3);
        assert_eq!(loaded.terms.daily_rate_bps, Bps(1250));
        assert_eq!(db.with_conn(list_packages).unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_invalid_terms() {
        let db = LedgerDb::open_in_memory().unwrap();
        let pkg = Package {
            id: "bad".into(),
            name: None,
            terms: PackageTerms {
                max_cycles: 0,
                ..PackageTerms::from(&PackageDefaults::default())
            },
        };
        assert!(db.with_conn(|conn| upsert_package(conn, &pkg)).is_err());
    }
}
