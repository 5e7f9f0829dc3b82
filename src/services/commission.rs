//! Referral commission engine
//!
//! Two independent one-time payouts to the level-1 referrer of a purchase:
//!
//! | Subtype | Rate | When |
//! |---------|------|------|
//! | `license_activation` | activation rate (5%) | deposit confirmation |
//! | `direct_referral` | direct rate (10%) | first cycle completed |
//!
//! Each has its own idempotency key, so paying one never blocks or
//! duplicates the other. Levels above 1 are never paid.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::db::ledger::{self, subtypes, EntryDraft, IdempotencyKey, RecordOutcome};
use crate::db::{outbox, purchases, referrals, LedgerDb, Purchase};
use crate::error::{EngineError, Ineligible};

use super::events::{EngineEvent, EventBus};

/// Outbox rows handled per drain
const OUTBOX_BATCH: u32 = 500;

/// Summary of one outbox drain
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionBatchSummary {
    pub paid: usize,
    pub already_paid: usize,
    pub ineligible: usize,
    pub failed: usize,
}

/// Referral commission engine
pub struct CommissionEngine {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
}

impl CommissionEngine {
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    /// Pay the direct-referral commission for a purchase whose first cycle
    /// is complete. A second call returns the existing entry unchanged.
    pub fn process_direct_commission(&self, purchase_id: &str) -> Result<RecordOutcome, EngineError> {
        let outcome = self.db.with_tx(|tx| {
            let purchase = purchases::require_purchase(tx, purchase_id)?;
            if !purchase.cycle.first_cycle_completed {
                return Err(Ineligible::FirstCycleIncomplete.into());
            }

            let referrer_id = require_referrer(tx, &purchase)?;
            let outcome = record_commission(
                tx,
                &purchase,
                &referrer_id,
                subtypes::DIRECT_REFERRAL,
                Utc::now().date_naive(),
            )?;

            outbox::resolve(tx, purchase_id, "paid")?;
            Ok(outcome)
        })?;

        if outcome.already_existed {
            debug!(purchase_id = %purchase_id, entry_id = %outcome.entry.id, "Direct commission already paid");
        } else {
            self.emit_paid(&outcome);
        }

        Ok(outcome)
    }

    /// Drain the commission outbox.
    ///
    /// Ineligible purchases resolve their row; transient failures stay
    /// queued for the next run.
    pub fn process_direct_commissions(&self) -> Result<CommissionBatchSummary, EngineError> {
        let items = self.db.with_conn(|conn| outbox::pending(conn, OUTBOX_BATCH))?;
        let mut summary = CommissionBatchSummary::default();

        for item in items {
            match self.process_direct_commission(&item.purchase_id) {
                Ok(outcome) if outcome.already_existed => summary.already_paid += 1,
                Ok(_) => summary.paid += 1,
                Err(EngineError::NotEligible(reason)) => {
                    info!(purchase_id = %item.purchase_id, reason = %reason, "Direct commission not eligible");
                    self.db.with_conn(|conn| outbox::resolve(conn, &item.purchase_id, reason.tag()))?;
                    summary.ineligible += 1;
                }
                Err(e) => {
                    if e.is_invariant_violation() {
                        error!(purchase_id = %item.purchase_id, error = %e, "Commission halted for manual reconciliation");
                        self.events.emit(EngineEvent::InvariantViolated {
                            entity: format!("purchase:{}", item.purchase_id),
                            detail: e.to_string(),
                        });
                    } else {
                        warn!(purchase_id = %item.purchase_id, error = %e, "Direct commission failed, will retry");
                    }
                    self.db
                        .with_conn(|conn| outbox::record_failure(conn, &item.purchase_id, &e.to_string()))?;
                    summary.failed += 1;
                }
            }
        }

        if summary.paid + summary.already_paid + summary.ineligible + summary.failed > 0 {
            info!(
                paid = summary.paid,
                already_paid = summary.already_paid,
                ineligible = summary.ineligible,
                failed = summary.failed,
                "Commission outbox drained"
            );
        }

        Ok(summary)
    }

    pub(crate) fn emit_paid(&self, outcome: &RecordOutcome) {
        self.events.emit(EngineEvent::CommissionPaid {
            referrer_id: outcome.entry.user_id.clone(),
            subtype: outcome.entry.subtype.clone(),
            purchase_id: outcome.entry.source_purchase_id.clone().unwrap_or_default(),
            amount: outcome.entry.amount,
        });
    }
}

/// Pay the activation commission inside the deposit transaction.
///
/// Returns `None` when the buyer has no referrer.
pub(crate) fn record_activation_commission(
    conn: &Connection,
    purchase: &Purchase,
    confirmed_on: NaiveDate,
) -> Result<Option<RecordOutcome>, EngineError> {
    let referrer_id = match require_referrer(conn, purchase) {
        Ok(id) => id,
        Err(EngineError::NotEligible(reason)) => {
            debug!(purchase_id = %purchase.id, reason = %reason, "No activation commission");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    record_commission(conn, purchase, &referrer_id, subtypes::LICENSE_ACTIVATION, confirmed_on).map(Some)
}

fn require_referrer(conn: &Connection, purchase: &Purchase) -> Result<String, EngineError> {
    let referrer_id = referrals::level_one_referrer(conn, &purchase.user_id)?.ok_or(Ineligible::NoReferrer)?;
    if referrer_id == purchase.user_id {
        return Err(Ineligible::SelfReferral.into());
    }
    Ok(referrer_id)
}

fn record_commission(
    conn: &Connection,
    purchase: &Purchase,
    referrer_id: &str,
    subtype: &str,
    effective_date: NaiveDate,
) -> Result<RecordOutcome, EngineError> {
    let rate = match subtype {
        subtypes::DIRECT_REFERRAL => purchase.terms.direct_referral_rate_bps,
        subtypes::LICENSE_ACTIVATION => purchase.terms.activation_rate_bps,
        other => {
            return Err(EngineError::Internal(format!("not a commission subtype: {}", other)));
        }
    };

    let key = IdempotencyKey::commission(referrer_id, subtype, &purchase.id);
    ledger::record_once(conn, &key, || {
        Ok(EntryDraft {
            amount: rate.apply(purchase.amount),
            currency: purchase.currency.clone(),
            cause_user_id: Some(purchase.user_id.clone()),
            effective_date,
            note: None,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackageDefaults;
    use crate::cycle::CycleState;
    use crate::db::purchases::{insert_purchase, update_state, NewPurchase, PurchaseStatus, StateUpdate};
    use crate::db::referrals::upsert_edge;
    use crate::db::{PackageTerms, ReferralEdge};

    fn setup(with_referrer: bool) -> (Arc<LedgerDb>, CommissionEngine) {
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
            })?;
            if with_referrer {
                upsert_edge(conn, &ReferralEdge {
                    referrer_id: "sponsor".into(),
                    referred_id: "alice".into(),
                    level: 1,
                    status: "active".into(),
                })?;
            }
            Ok(())
        })
        .unwrap();
        let engine = CommissionEngine::new(db.clone(), Arc::new(EventBus::new()));
        (db, engine)
    }

    fn complete_first_cycle(db: &LedgerDb) {
        db.with_conn(|conn| {
            update_state(conn, "p1", 0, &StateUpdate {
                status: PurchaseStatus::Active,
                cycle: CycleState { current_day: 9, cycles_completed: 0, first_cycle_completed: true },
                next_benefit_date: NaiveDate::from_ymd_opt(2026, 1, 10),
                last_advanced_on: NaiveDate::from_ymd_opt(2026, 1, 9),
            })?;
            outbox::enqueue(conn, "p1")?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_gated_on_first_cycle() {
        let (_db, engine) = setup(true);
        let err = engine.process_direct_commission("p1").unwrap_err();
        assert!(matches!(err, EngineError::NotEligible(Ineligible::FirstCycleIncomplete)));
    }

    #[test]
    fn test_paid_once() {
        let (db, engine) = setup(true);
        complete_first_cycle(&db);

        let first = engine.process_direct_commission("p1").unwrap();
        assert!(!first.already_existed);
        assert_eq!(first.entry.amount, 1_000);
        assert_eq!(first.entry.user_id, "sponsor");
        assert_eq!(first.entry.cause_user_id.as_deref(), Some("alice"));

        let second = engine.process_direct_commission("p1").unwrap();
        assert!(second.already_existed);
        assert_eq!(second.entry, first.entry);
    }

    #[test]
    fn test_outbox_drain_resolves_ineligible() {
        let (db, engine) = setup(false);
        complete_first_cycle(&db);

        let summary = engine.process_direct_commissions().unwrap();
        assert_eq!(summary.ineligible, 1);
        assert!(db.with_conn(|conn| outbox::pending(conn, 10)).unwrap().is_empty());
    }

    #[test]
    fn test_activation_is_independent_of_direct() {
        let (db, engine) = setup(true);
        let purchase = db.with_conn(|conn| purchases::require_purchase(conn, "p1")).unwrap();
        let on = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();

        let activation = db
            .with_conn(|conn| record_activation_commission(conn, &purchase, on))
            .unwrap()
            .unwrap();
        assert_eq!(activation.entry.amount, 500);
        assert_eq!(activation.entry.subtype, subtypes::LICENSE_ACTIVATION);

        complete_first_cycle(&db);
        let direct = engine.process_direct_commission("p1").unwrap();
        assert!(!direct.already_existed);
        assert_eq!(direct.entry.subtype, subtypes::DIRECT_REFERRAL);
    }
}
