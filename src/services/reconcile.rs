//! Reconciliation between the ledger and purchase state
//!
//! The ledger is authoritative. `reconcile_*` re-derives each purchase's
//! cycle position from its completed earnings and rewrites drifted state;
//! `verify_invariants` scans the whole ledger for conditions that must
//! never hold and only reports them.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::cycle::CycleState;
use crate::db::ledger;
use crate::db::purchases::{self, StateUpdate};
use crate::db::{outbox, LedgerDb, PurchaseStatus};
use crate::error::EngineError;

use super::events::{EngineEvent, EventBus};

/// Outcome for one purchase
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub purchase_id: String,
    pub completed_earnings: u32,
    pub stored: CycleState,
    pub derived: CycleState,
    pub repaired: bool,
    pub status: PurchaseStatus,
}

/// Outcome of a full pass
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub checked: usize,
    pub repaired: usize,
    pub failed: Vec<String>,
}

/// Ledger-wide invariant scan
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvariantReport {
    /// Idempotency keys with more than one completed entry
    pub duplicate_keys: Vec<String>,
    /// Purchases with more than `max_cycles * 8` earnings
    pub earnings_over_cap: Vec<String>,
    /// Purchases with more than 8 earnings in one cycle
    pub cycle_overruns: Vec<String>,
    /// Commission entries not backed by a level-1 edge
    pub commissions_without_level_one: Vec<String>,
}

impl InvariantReport {
    pub fn is_clean(&self) -> bool {
        self.duplicate_keys.is_empty()
            && self.earnings_over_cap.is_empty()
            && self.cycle_overruns.is_empty()
            && self.commissions_without_level_one.is_empty()
    }
}

/// Reconciliation service
pub struct ReconcileService {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
}

impl ReconcileService {
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    /// Re-derive one purchase from the ledger and repair drift
    pub fn reconcile_purchase(&self, purchase_id: &str) -> Result<ReconcileReport, EngineError> {
        let report = self.db.with_tx(|tx| {
            let purchase = purchases::require_purchase(tx, purchase_id)?;
            let max_cycles = purchase.terms.max_cycles;
            let completed_earnings = ledger::count_completed_earnings(tx, purchase_id)?;

            if matches!(purchase.status, PurchaseStatus::Pending | PurchaseStatus::Cancelled) {
                return Ok(ReconcileReport {
                    purchase_id: purchase_id.to_string(),
                    completed_earnings,
                    stored: purchase.cycle,
                    derived: purchase.cycle,
                    repaired: false,
                    status: purchase.status,
                });
            }

            let mut derived = CycleState::derive(completed_earnings, purchase.cycle.cycles_completed, max_cycles)?;
            derived.first_cycle_completed |= purchase.cycle.first_cycle_completed;

            let capped = derived.is_capped(max_cycles);
            if purchase.status == PurchaseStatus::Completed && !capped {
                return Err(EngineError::InvariantViolation(format!(
                    "purchase {} is completed but the ledger shows {} earnings",
                    purchase_id, completed_earnings
                )));
            }

            // Missed enqueue; a resolved row is left alone
            if derived.first_cycle_completed {
                outbox::enqueue(tx, purchase_id)?;
            }

            let status = if capped { PurchaseStatus::Completed } else { PurchaseStatus::Active };
            let repaired = derived != purchase.cycle || status != purchase.status;

            if repaired {
                purchases::update_state(
                    tx,
                    purchase_id,
                    purchase.version,
                    &StateUpdate {
                        status,
                        cycle: derived,
                        next_benefit_date: if capped { None } else { purchase.next_benefit_date },
                        last_advanced_on: purchase.last_advanced_on,
                    },
                )?;
            }

            Ok(ReconcileReport {
                purchase_id: purchase_id.to_string(),
                completed_earnings,
                stored: purchase.cycle,
                derived,
                repaired,
                status,
            })
        })?;

        if report.repaired {
            warn!(
                purchase_id = %purchase_id,
                stored = ?report.stored,
                derived = ?report.derived,
                "Purchase state repaired from ledger"
            );
            self.events.emit(EngineEvent::StateRepaired {
                purchase_id: purchase_id.to_string(),
                from_day: report.stored.current_day,
                to_day: report.derived.current_day,
            });
        }

        Ok(report)
    }

    /// Reconcile every active or completed purchase
    pub fn reconcile_all(&self) -> Result<ReconcileSummary, EngineError> {
        let ids = self.db.with_conn(|conn| {
            purchases::list_ids_by_status(conn, &[PurchaseStatus::Active, PurchaseStatus::Completed])
        })?;

        let mut summary = ReconcileSummary::default();
        for id in ids {
            summary.checked += 1;
            match self.reconcile_purchase(&id) {
                Ok(report) if report.repaired => summary.repaired += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(purchase_id = %id, error = %e, "Reconciliation failed");
                    if e.is_invariant_violation() {
                        self.events.emit(EngineEvent::InvariantViolated {
                            entity: format!("purchase:{}", id),
                            detail: e.to_string(),
                        });
                    }
                    summary.failed.push(id);
                }
            }
        }

        info!(
            checked = summary.checked,
            repaired = summary.repaired,
            failed = summary.failed.len(),
            "Reconciliation pass finished"
        );
        Ok(summary)
    }

    /// Scan the ledger for invariant violations
    pub fn verify_invariants(&self) -> Result<InvariantReport, EngineError> {
        let report = self.db.with_conn(|conn| {
            Ok(InvariantReport {
                duplicate_keys: ledger::duplicate_completed_keys(conn)?
                    .into_iter()
                    .map(|(key, _)| key)
                    .collect(),
                earnings_over_cap: ledger::earnings_over_cap(conn)?,
                cycle_overruns: ledger::earnings_cycle_overruns(conn)?,
                commissions_without_level_one: ledger::commissions_without_level_one_edge(conn)?,
            })
        })?;

        if !report.is_clean() {
            error!(report = ?report, "Ledger invariants violated");
            self.events.emit(EngineEvent::InvariantViolated {
                entity: "ledger".into(),
                detail: format!("{:?}", report),
            });
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Days, NaiveDate};
    use crate::config::PackageDefaults;
    use crate::db::ledger::{record_once, EntryDraft, IdempotencyKey};
    use crate::db::purchases::{insert_purchase, NewPurchase};
    use crate::db::PackageTerms;

    fn setup() -> (Arc<LedgerDb>, ReconcileService) {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        db.with_conn(|conn| {
            insert_purchase(conn, &NewPurchase {
                id: "p1".into(),
                user_id: "alice".into(),
                package_id: "gold".into(),
                amount: 10_000,
                currency: "USDT".into(),
                terms: PackageTerms::from(&PackageDefaults::default()),
                status: PurchaseStatus::Active,
                activated_on: NaiveDate::from_ymd_opt(2026, 1, 1),
            })
            .map(|_| ())
        })
        .unwrap();
        let service = ReconcileService::new(db.clone(), Arc::new(EventBus::new()));
        (db, service)
    }

    /// Simulates a crash after the ledger write but before the state update
    fn write_earnings(db: &LedgerDb, days: u32) {
        for period in 1..=days {
            db.with_conn(|conn| {
                record_once(conn, &IdempotencyKey::earnings("alice", "p1", period), || {
                    Ok(EntryDraft {
                        amount: 1_250,
                        currency: "USDT".into(),
                        cause_user_id: None,
                        effective_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap() + Days::new(period as u64),
                        note: None,
                    })
                })
                .map(|_| ())
            })
            .unwrap();
        }
    }

    #[test]
    fn test_repairs_drift_and_enqueues_commission() {
        let (db, service) = setup();
        write_earnings(&db, 8);

        let report = service.reconcile_purchase("p1").unwrap();
        assert!(report.repaired);
        assert_eq!(report.stored.current_day, 1);
        assert_eq!(report.derived.current_day, 9);
        assert!(report.derived.first_cycle_completed);

        let pending = db.with_conn(|conn| outbox::pending(conn, 10)).unwrap();
        assert_eq!(pending.len(), 1);

        // Second pass finds nothing to do
        assert!(!service.reconcile_purchase("p1").unwrap().repaired);
    }

    #[test]
    fn test_reconcile_all_and_clean_invariants() {
        let (db, service) = setup();
        write_earnings(&db, 3);

        let summary = service.reconcile_all().unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.repaired, 1);
        assert!(summary.failed.is_empty());

        assert!(service.verify_invariants().unwrap().is_clean());
    }

    #[test]
    fn test_earnings_past_cap_are_reported() {
        let (db, service) = setup();
        // Default terms allow 5 cycles of 8 days
        write_earnings(&db, 41);

        let report = service.verify_invariants().unwrap();
        assert_eq!(report.earnings_over_cap, vec!["p1".to_string()]);
        assert!(report.cycle_overruns.is_empty());
        assert!(!report.is_clean());
    }

    #[test]
    fn test_ninth_earnings_in_cycle_is_reported() {
        let (db, service) = setup();
        write_earnings(&db, 8);
        // Misattributed payout for a period alice already received
        db.with_conn(|conn| {
            record_once(conn, &IdempotencyKey::earnings("mallory", "p1", 3), || {
                Ok(EntryDraft {
                    amount: 1_250,
                    currency: "USDT".into(),
                    cause_user_id: None,
                    effective_date: NaiveDate::from_ymd_opt(2026, 1, 4).unwrap(),
                    note: None,
                })
            })
            .map(|_| ())
        })
        .unwrap();

        let report = service.verify_invariants().unwrap();
        assert_eq!(report.cycle_overruns, vec!["p1".to_string()]);
        assert!(report.earnings_over_cap.is_empty());
        assert!(!report.is_clean());
    }

    #[test]
    fn test_commission_without_edge_is_reported() {
        let (db, service) = setup();
        db.with_conn(|conn| {
            record_once(
                conn,
                &IdempotencyKey::commission("grandparent", crate::db::ledger::subtypes::DIRECT_REFERRAL, "p1"),
                || {
                    Ok(EntryDraft {
                        amount: 1_000,
                        currency: "USDT".into(),
                        cause_user_id: Some("alice".into()),
                        effective_date: NaiveDate::from_ymd_opt(2026, 1, 9).unwrap(),
                        note: None,
                    })
                },
            )
            .map(|_| ())
        })
        .unwrap();

        let report = service.verify_invariants().unwrap();
        assert_eq!(report.commissions_without_level_one.len(), 1);
        assert!(!report.is_clean());
    }
}
