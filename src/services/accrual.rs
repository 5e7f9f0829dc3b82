//! Benefit accrual engine
//!
//! Advances one purchase by one day. The ledger write, the cycle state
//! delta and the commission outbox row commit together, so a crash leaves
//! either all of them or none.
//!
//! The cycle position is re-derived from the completed earnings count on
//! every advance. A stored counter that disagrees is repaired in the same
//! transaction and logged.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cycle::{CycleState, Step};
use crate::db::ledger::{self, EntryDraft, IdempotencyKey};
use crate::db::purchases::{self, PurchaseQuery, StateUpdate};
use crate::db::{outbox, LedgerDb, LedgerEntry, Purchase, PurchaseStatus};
use crate::error::{EngineError, Ineligible};

use super::events::{EngineEvent, EventBus};

/// What a call to [`AccrualEngine::advance_one_day`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceKind {
    /// Active day paid (or found already paid) and the cycle moved on
    Paid,
    /// Pause day consumed
    Paused,
    /// Already advanced for this date; nothing written
    AlreadyAdvanced,
}

/// Result of one advance
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceOutcome {
    pub kind: AdvanceKind,
    /// Earnings entry of the day; the latest one for `AlreadyAdvanced`
    pub entry: Option<LedgerEntry>,
    /// The earnings key was already paid by an earlier attempt
    pub already_existed: bool,
    pub first_cycle_completed_now: bool,
    pub purchase: Purchase,
}

/// Benefit accrual engine
pub struct AccrualEngine {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
}

impl AccrualEngine {
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get(&self, purchase_id: &str) -> Result<Option<Purchase>, EngineError> {
        self.db.with_conn(|conn| purchases::get_purchase(conn, purchase_id))
    }

    pub fn list(&self, query: &PurchaseQuery) -> Result<Vec<Purchase>, EngineError> {
        self.db.with_conn(|conn| purchases::list_purchases(conn, query))
    }

    /// Active purchases due on `as_of`
    pub fn list_due(&self, as_of: NaiveDate) -> Result<Vec<String>, EngineError> {
        self.db.with_conn(|conn| purchases::list_due(conn, as_of))
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Advance a purchase by one day.
    ///
    /// `admin_override` skips the due-date check. Calling again for a date
    /// that was already processed returns `AlreadyAdvanced` without writing.
    pub fn advance_one_day(
        &self,
        purchase_id: &str,
        as_of: NaiveDate,
        admin_override: bool,
    ) -> Result<AdvanceOutcome, EngineError> {
        let mut emitted = Vec::new();

        let outcome = self.db.with_tx(|tx| {
            let purchase = purchases::require_purchase(tx, purchase_id)?;
            let max_cycles = purchase.terms.max_cycles;

            let replay = !admin_override && purchase.last_advanced_on == Some(as_of);

            match purchase.status {
                PurchaseStatus::Active => {}
                PurchaseStatus::Completed if replay => {
                    debug!(purchase_id = %purchase_id, as_of = %as_of, "Final day already advanced");
                    return already_advanced(tx, purchase);
                }
                PurchaseStatus::Completed => {
                    return Err(Ineligible::CycleCapReached {
                        cycles_completed: purchase.cycle.cycles_completed,
                    }
                    .into());
                }
                other => {
                    return Err(Ineligible::PurchaseNotActive { status: other.as_str().into() }.into());
                }
            }

            let due = purchase.next_benefit_date.ok_or_else(|| {
                EngineError::InvariantViolation(format!(
                    "active purchase {} has no next benefit date",
                    purchase_id
                ))
            })?;

            if !admin_override && as_of < due {
                if replay {
                    debug!(purchase_id = %purchase_id, as_of = %as_of, "Already advanced today");
                    return already_advanced(tx, purchase);
                }
                return Err(Ineligible::NotDue { next_benefit_date: due }.into());
            }

            let state = derive_state(tx, &purchase, &mut emitted)?;
            if state.is_capped(max_cycles) {
                return Err(Ineligible::CycleCapReached { cycles_completed: state.cycles_completed }.into());
            }

            let transition = state.advance(max_cycles)?;

            let mut entry = None;
            let mut already_existed = false;
            if let Step::Payout { day, period_key } = transition.step {
                let key = IdempotencyKey::earnings(&purchase.user_id, purchase_id, period_key);
                let recorded = ledger::record_once(tx, &key, || {
                    Ok(EntryDraft {
                        amount: purchase.daily_payout(),
                        currency: purchase.currency.clone(),
                        cause_user_id: None,
                        effective_date: as_of,
                        note: Some(format!("cycle {} day {}", state.cycles_completed + 1, day)),
                    })
                })?;

                if recorded.already_existed {
                    debug!(purchase_id = %purchase_id, period_key, "Earnings already recorded, advancing state");
                } else {
                    emitted.push(EngineEvent::DayPaid {
                        purchase_id: purchase_id.to_string(),
                        user_id: purchase.user_id.clone(),
                        period_key,
                        amount: recorded.entry.amount,
                    });
                }
                already_existed = recorded.already_existed;
                entry = Some(recorded.entry);
            } else {
                emitted.push(EngineEvent::PauseDay {
                    purchase_id: purchase_id.to_string(),
                    cycles_completed: transition.next.cycles_completed,
                });
            }

            if transition.first_cycle_completed_now {
                outbox::enqueue(tx, purchase_id)?;
                emitted.push(EngineEvent::FirstCycleCompleted {
                    purchase_id: purchase_id.to_string(),
                    user_id: purchase.user_id.clone(),
                });
            }

            // An early override never moves the schedule backwards
            let schedule_date = purchase.last_advanced_on.map_or(as_of, |last| last.max(as_of));

            let (status, next_benefit_date) = if transition.cap_reached {
                emitted.push(EngineEvent::PurchaseCompleted {
                    purchase_id: purchase_id.to_string(),
                    cycles_completed: transition.next.cycles_completed,
                });
                (PurchaseStatus::Completed, None)
            } else {
                let next = schedule_date
                    .succ_opt()
                    .ok_or_else(|| EngineError::InvalidInput(format!("date {} out of range", as_of)))?;
                (PurchaseStatus::Active, Some(next))
            };

            purchases::update_state(
                tx,
                purchase_id,
                purchase.version,
                &StateUpdate {
                    status,
                    cycle: transition.next,
                    next_benefit_date,
                    last_advanced_on: Some(schedule_date),
                },
            )?;

            let purchase = purchases::require_purchase(tx, purchase_id)?;

            Ok(AdvanceOutcome {
                kind: if entry.is_some() { AdvanceKind::Paid } else { AdvanceKind::Paused },
                entry,
                already_existed,
                first_cycle_completed_now: transition.first_cycle_completed_now,
                purchase,
            })
        })?;

        for event in emitted {
            self.events.emit(event);
        }

        info!(
            purchase_id = %purchase_id,
            kind = ?outcome.kind,
            day = outcome.purchase.cycle.current_day,
            cycles_completed = outcome.purchase.cycle.cycles_completed,
            "Advanced purchase"
        );

        Ok(outcome)
    }

    /// Administrative cancellation. Cancelling twice is a no-op; a
    /// completed purchase cannot be cancelled.
    pub fn cancel_purchase(&self, purchase_id: &str, reason: Option<String>) -> Result<Purchase, EngineError> {
        let purchase = self.db.with_tx(|tx| {
            let purchase = purchases::require_purchase(tx, purchase_id)?;
            match purchase.status {
                PurchaseStatus::Cancelled => return Ok(None),
                PurchaseStatus::Completed => {
                    return Err(Ineligible::PurchaseNotActive { status: "completed".into() }.into());
                }
                PurchaseStatus::Active | PurchaseStatus::Pending => {}
            }

            purchases::update_state(
                tx,
                purchase_id,
                purchase.version,
                &StateUpdate {
                    status: PurchaseStatus::Cancelled,
                    cycle: purchase.cycle,
                    next_benefit_date: None,
                    last_advanced_on: purchase.last_advanced_on,
                },
            )?;

            purchases::require_purchase(tx, purchase_id).map(Some)
        })?;

        match purchase {
            Some(p) => {
                info!(purchase_id = %purchase_id, reason = ?reason, "Purchase cancelled");
                self.events.emit(EngineEvent::PurchaseCancelled {
                    purchase_id: purchase_id.to_string(),
                    reason,
                });
                Ok(p)
            }
            None => self
                .get(purchase_id)?
                .ok_or_else(|| EngineError::NotFound(format!("purchase {}", purchase_id))),
        }
    }
}

fn already_advanced(conn: &rusqlite::Connection, purchase: Purchase) -> Result<AdvanceOutcome, EngineError> {
    let entry = ledger::latest_earnings(conn, &purchase.id)?;
    Ok(AdvanceOutcome {
        kind: AdvanceKind::AlreadyAdvanced,
        already_existed: entry.is_some(),
        entry,
        first_cycle_completed_now: false,
        purchase,
    })
}

/// Cycle position derived from the ledger; the stored flag stays sticky
fn derive_state(
    conn: &rusqlite::Connection,
    purchase: &Purchase,
    emitted: &mut Vec<EngineEvent>,
) -> Result<CycleState, EngineError> {
    let count = ledger::count_completed_earnings(conn, &purchase.id)?;
    let mut derived = CycleState::derive(count, purchase.cycle.cycles_completed, purchase.terms.max_cycles)?;
    derived.first_cycle_completed |= purchase.cycle.first_cycle_completed;

    if derived != purchase.cycle {
        warn!(
            purchase_id = %purchase.id,
            stored = ?purchase.cycle,
            derived = ?derived,
            earnings = count,
            "Stored cycle state drifted from ledger, using derived state"
        );
        emitted.push(EngineEvent::StateRepaired {
            purchase_id: purchase.id.clone(),
            from_day: purchase.cycle.current_day,
            to_day: derived.current_day,
        });
    }

    Ok(derived)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackageDefaults;
    use crate::db::purchases::{insert_purchase, NewPurchase};
    use crate::db::PackageTerms;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    fn engine_with_purchase(amount: i64, max_cycles: u32) -> AccrualEngine {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        db.with_conn(|conn| {
            insert_purchase(conn, &NewPurchase {
                id: "p1".into(),
                user_id: "alice".into(),
                package_id: "gold".into(),
                amount,
                currency: "USDT".into(),
                terms: PackageTerms {
                    max_cycles,
                    ..PackageTerms::from(&PackageDefaults::default())
                },
                status: PurchaseStatus::Active,
                activated_on: Some(date(1)),
            })
        })
        .unwrap();
        AccrualEngine::new(db, Arc::new(EventBus::new()))
    }

    #[test]
    fn test_first_cycle_pays_full_amount() {
        let engine = engine_with_purchase(10_000, 5);
        let mut total = 0;

        for d in 2..=9 {
            let out = engine.advance_one_day("p1", date(d), false).unwrap();
            assert_eq!(out.kind, AdvanceKind::Paid);
            total += out.entry.unwrap().amount;
        }

        let p = engine.get("p1").unwrap().unwrap();
        assert_eq!(total, 10_000);
        assert!(p.cycle.first_cycle_completed);
        assert!(p.cycle.is_pause_day());

        let pause = engine.advance_one_day("p1", date(10), false).unwrap();
        assert_eq!(pause.kind, AdvanceKind::Paused);
        assert_eq!(pause.purchase.cycle.current_day, 1);
        assert_eq!(pause.purchase.cycle.cycles_completed, 1);
    }

    #[test]
    fn test_same_day_is_idempotent() {
        let engine = engine_with_purchase(10_000, 5);
        let first = engine.advance_one_day("p1", date(2), false).unwrap();
        let again = engine.advance_one_day("p1", date(2), false).unwrap();

        assert_eq!(again.kind, AdvanceKind::AlreadyAdvanced);
        assert_eq!(again.entry.unwrap().id, first.entry.unwrap().id);
        assert_eq!(again.purchase.cycle.current_day, 2);
    }

    #[test]
    fn test_not_due_is_rejected_without_override() {
        let engine = engine_with_purchase(10_000, 5);
        let err = engine.advance_one_day("p1", date(1), false).unwrap_err();
        assert!(matches!(err, EngineError::NotEligible(Ineligible::NotDue { .. })));

        let out = engine.advance_one_day("p1", date(1), true).unwrap();
        assert_eq!(out.kind, AdvanceKind::Paid);
    }

    #[test]
    fn test_cap_completes_purchase() {
        let engine = engine_with_purchase(10_000, 1);
        for d in 2..=10 {
            engine.advance_one_day("p1", date(d), false).unwrap();
        }

        let p = engine.get("p1").unwrap().unwrap();
        assert_eq!(p.status, PurchaseStatus::Completed);
        assert_eq!(p.cycle.cycles_completed, 1);
        assert_eq!(p.next_benefit_date, None);

        // Redelivered trigger for the final pause day
        let again = engine.advance_one_day("p1", date(10), false).unwrap();
        assert_eq!(again.kind, AdvanceKind::AlreadyAdvanced);
        assert_eq!(again.purchase.status, PurchaseStatus::Completed);
        assert_eq!(again.entry.unwrap().amount, 1_250);

        let err = engine.advance_one_day("p1", date(11), true).unwrap_err();
        assert!(matches!(err, EngineError::NotEligible(Ineligible::CycleCapReached { cycles_completed: 1 })));
    }

    #[test]
    fn test_early_override_keeps_schedule() {
        let engine = engine_with_purchase(10_000, 5);
        for d in 2..=5 {
            engine.advance_one_day("p1", date(d), false).unwrap();
        }

        let out = engine.advance_one_day("p1", date(3), true).unwrap();
        assert_eq!(out.kind, AdvanceKind::Paid);
        assert_eq!(out.purchase.next_benefit_date, Some(date(6)));
        assert_eq!(out.purchase.last_advanced_on, Some(date(5)));

        let err = engine.advance_one_day("p1", date(4), false).unwrap_err();
        assert!(matches!(err, EngineError::NotEligible(Ineligible::NotDue { .. })));
        let replay = engine.advance_one_day("p1", date(5), false).unwrap();
        assert_eq!(replay.kind, AdvanceKind::AlreadyAdvanced);

        let p = engine.get("p1").unwrap().unwrap();
        assert_eq!(p.cycle.current_day, 6);
    }

    #[test]
    fn test_cancel_is_idempotent_and_blocks_advance() {
        let engine = engine_with_purchase(10_000, 5);
        let p = engine.cancel_purchase("p1", Some("chargeback".into())).unwrap();
        assert_eq!(p.status, PurchaseStatus::Cancelled);
        assert_eq!(engine.cancel_purchase("p1", None).unwrap().status, PurchaseStatus::Cancelled);

        let err = engine.advance_one_day("p1", date(2), true).unwrap_err();
        assert!(err.is_not_eligible());
    }

    #[test]
    fn test_unknown_purchase() {
        let engine = engine_with_purchase(10_000, 5);
        assert!(matches!(
            engine.advance_one_day("nope", date(2), false),
            Err(EngineError::NotFound(_))
        ));
    }
}
