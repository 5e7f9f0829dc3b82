//! End-to-end scenarios against an on-disk ledger
//!
//! Each test drives the engines the way the daemon does: deposits come in,
//! days are advanced, commissions and pool cycles are processed, and the
//! ledger is checked at the end.

use chrono::{Duration as Days, NaiveDate};
use license_ledger::db::ledger::{self as ledger_db, subtypes, EntryDraft, IdempotencyKey};
use license_ledger::db::pool::PoolParticipant;
use license_ledger::db::{EntryType, LedgerQuery, Package, PackageTerms, PurchaseStatus, ReferralEdge};
use license_ledger::services::{AdvanceKind, DepositEvent, Services};
use license_ledger::{Config, EngineError, Ineligible, LedgerDb, Scheduler};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Helper to create services over a temporary storage directory
fn open_services(dir: &TempDir) -> Services {
    let db = Arc::new(LedgerDb::open(dir.path()).unwrap());
    Services::new(db, &Config::default())
}

fn deposit(services: &Services, purchase_id: &str, user_id: &str, amount: i64, confirmed_on: NaiveDate) {
    services
        .deposits
        .confirm_deposit(&DepositEvent {
            purchase_id: purchase_id.into(),
            user_id: user_id.into(),
            amount,
            package_id: "standard".into(),
            currency: None,
            confirmed_on,
        })
        .unwrap();
}

fn refer(services: &Services, referrer: &str, referred: &str, level: u32) {
    services
        .deposits
        .upsert_referral(&ReferralEdge {
            referrer_id: referrer.into(),
            referred_id: referred.into(),
            level,
            status: "active".into(),
        })
        .unwrap();
}

/// Advance `days` consecutive days starting the day after `activated_on`
fn advance_days(services: &Services, purchase_id: &str, activated_on: NaiveDate, days: i64) -> Vec<AdvanceKind> {
    (1..=days)
        .map(|n| {
            services
                .accrual
                .advance_one_day(purchase_id, activated_on + Days::days(n), false)
                .unwrap()
                .kind
        })
        .collect()
}

/// 100.00 at 12.5% a day returns the principal over the first cycle
#[test]
fn test_first_cycle_returns_principal() {
    let dir = TempDir::new().unwrap();
    let services = open_services(&dir);
    let start = date(2026, 1, 1);
    deposit(&services, "p1", "alice", 10_000, start);

    let kinds = advance_days(&services, "p1", start, 8);
    assert!(kinds.iter().all(|k| *k == AdvanceKind::Paid));

    let balance = services.ledger.balance("alice").unwrap();
    assert_eq!(balance.earnings, 10_000);
    assert_eq!(balance.deposits, 10_000);
    assert_eq!(balance.available, 10_000);

    let purchase = services.accrual.get("p1").unwrap().unwrap();
    assert!(purchase.cycle.first_cycle_completed);
    assert_eq!(purchase.cycle.current_day, 9);

    // Day 9 rests
    let pause = services.accrual.advance_one_day("p1", start + Days::days(9), false).unwrap();
    assert_eq!(pause.kind, AdvanceKind::Paused);
    assert!(pause.entry.is_none());
    assert_eq!(pause.purchase.cycle.cycles_completed, 1);
    assert_eq!(services.ledger.balance("alice").unwrap().earnings, 10_000);
}

/// Re-running a day never pays twice
#[test]
fn test_same_day_rerun_is_noop() {
    let dir = TempDir::new().unwrap();
    let services = open_services(&dir);
    let start = date(2026, 1, 1);
    deposit(&services, "p1", "alice", 10_000, start);

    let day = start + Days::days(1);
    let first = services.accrual.advance_one_day("p1", day, false).unwrap();
    let again = services.accrual.advance_one_day("p1", day, false).unwrap();

    assert_eq!(first.kind, AdvanceKind::Paid);
    assert_eq!(again.kind, AdvanceKind::AlreadyAdvanced);
    assert_eq!(again.entry.unwrap().id, first.entry.unwrap().id);
    assert_eq!(services.ledger.balance("alice").unwrap().earnings, 1_250);

    let err = services.accrual.advance_one_day("p1", start, false).unwrap_err();
    assert!(matches!(err, EngineError::NotEligible(Ineligible::NotDue { .. })));
}

/// Direct commission waits for the first cycle and is paid once
#[test]
fn test_direct_commission_after_first_cycle() {
    let dir = TempDir::new().unwrap();
    let services = open_services(&dir);
    let start = date(2026, 1, 1);
    refer(&services, "sponsor", "alice", 1);
    deposit(&services, "p1", "alice", 10_000, start);

    let early = services.commission.process_direct_commission("p1").unwrap_err();
    assert!(matches!(early, EngineError::NotEligible(Ineligible::FirstCycleIncomplete)));

    advance_days(&services, "p1", start, 7);
    assert!(services.commission.process_direct_commission("p1").is_err());

    services.accrual.advance_one_day("p1", start + Days::days(8), false).unwrap();
    let paid = services.commission.process_direct_commission("p1").unwrap();
    assert!(!paid.already_existed);
    assert_eq!(paid.entry.amount, 1_000);
    assert_eq!(paid.entry.user_id, "sponsor");
    assert_eq!(paid.entry.subtype, subtypes::DIRECT_REFERRAL);

    let again = services.commission.process_direct_commission("p1").unwrap();
    assert!(again.already_existed);
    assert_eq!(again.entry.id, paid.entry.id);

    // The outbox row was resolved by the direct call
    let drained = services.commission.process_direct_commissions().unwrap();
    assert_eq!(drained.paid, 0);

    // Activation (5%) plus direct (10%)
    assert_eq!(services.ledger.balance("sponsor").unwrap().commissions, 1_500);
}

/// Commissions never reach past the level-1 referrer
#[test]
fn test_no_commission_above_level_one() {
    let dir = TempDir::new().unwrap();
    let services = open_services(&dir);
    let start = date(2026, 1, 1);
    refer(&services, "grandparent", "sponsor", 1);
    refer(&services, "sponsor", "alice", 1);
    refer(&services, "grandparent", "alice", 2);
    deposit(&services, "p1", "alice", 10_000, start);

    advance_days(&services, "p1", start, 8);
    let summary = services.commission.process_direct_commissions().unwrap();
    assert_eq!(summary.paid, 1);

    let grandparent = services
        .ledger
        .list(&LedgerQuery {
            user_id: Some("grandparent".into()),
            entry_type: Some(EntryType::Commission),
            ..Default::default()
        })
        .unwrap();
    assert!(grandparent.is_empty());
    assert!(services.reconcile.verify_invariants().unwrap().is_clean());
}

/// A purchase stops after `max_cycles` cycles
#[test]
fn test_lifetime_cap() {
    let dir = TempDir::new().unwrap();
    let services = open_services(&dir);
    services
        .deposits
        .upsert_package(&Package {
            id: "standard".into(),
            name: Some("Standard".into()),
            terms: PackageTerms {
                max_cycles: 2,
                ..PackageTerms::from(&Config::default().default_package)
            },
        })
        .unwrap();
    let start = date(2026, 1, 1);
    deposit(&services, "p1", "alice", 10_000, start);

    let kinds = advance_days(&services, "p1", start, 18);
    assert_eq!(kinds.iter().filter(|k| **k == AdvanceKind::Paid).count(), 16);
    assert_eq!(kinds.iter().filter(|k| **k == AdvanceKind::Paused).count(), 2);

    let purchase = services.accrual.get("p1").unwrap().unwrap();
    assert_eq!(purchase.status, PurchaseStatus::Completed);
    assert_eq!(purchase.next_benefit_date, None);
    assert_eq!(services.ledger.balance("alice").unwrap().earnings, 20_000);

    let err = services
        .accrual
        .advance_one_day("p1", start + Days::days(19), true)
        .unwrap_err();
    assert!(matches!(err, EngineError::NotEligible(Ineligible::CycleCapReached { cycles_completed: 2 })));
    assert!(services.reconcile.verify_invariants().unwrap().is_clean());
}

/// Pool cycle 1 pays 5% of 1000.00 once, split evenly
#[test]
fn test_pool_cycle_pays_once() {
    let dir = TempDir::new().unwrap();
    let services = open_services(&dir);
    for leader in ["leader-a", "leader-b"] {
        services
            .pool
            .upsert_participant(&PoolParticipant {
                participant_id: leader.into(),
                role: "leader".into(),
                active: true,
                joined_on: date(2024, 12, 1),
            })
            .unwrap();
    }
    deposit(&services, "p1", "alice", 50_000, date(2025, 1, 3));
    deposit(&services, "p2", "bob", 50_000, date(2025, 1, 10));

    let (_, boundary) = services.pool.cycle_bounds(1).unwrap();
    assert_eq!(boundary, date(2025, 1, 15));

    let open = services.pool.process_pool_cycle(1, date(2025, 1, 14)).unwrap_err();
    assert!(matches!(open, EngineError::NotEligible(Ineligible::PoolCycleOpen { .. })));

    let first = services.pool.process_pool_cycle(1, boundary).unwrap();
    assert!(first.plan_created);
    assert_eq!(first.total_eligible_sales, 100_000);
    assert_eq!(first.pool_total, 5_000);
    assert_eq!(first.paid, 2);
    assert_eq!(first.distributed_now, 5_000);
    assert_eq!(services.ledger.balance("leader-a").unwrap().pool_bonuses, 2_500);

    let rerun = services.pool.process_pool_cycle(1, boundary).unwrap();
    assert!(!rerun.plan_created);
    assert_eq!(rerun.paid, 0);
    assert_eq!(rerun.already_paid, 2);
    assert_eq!(rerun.distributed_now, 0);
}

/// A run that died after paying some participants resumes with the rest
#[test]
fn test_pool_resume_after_partial_payout() {
    let dir = TempDir::new().unwrap();
    let services = open_services(&dir);
    for leader in ["leader-a", "leader-b"] {
        services
            .pool
            .upsert_participant(&PoolParticipant {
                participant_id: leader.into(),
                role: "leader".into(),
                active: true,
                joined_on: date(2024, 12, 1),
            })
            .unwrap();
    }
    deposit(&services, "p1", "alice", 100_000, date(2025, 1, 3));

    // leader-a was paid before the crash
    services
        .db
        .with_conn(|conn| {
            ledger_db::record_once(conn, &IdempotencyKey::pool_bonus("leader-a", 1), || {
                Ok(EntryDraft {
                    amount: 2_500,
                    currency: "USDT".into(),
                    cause_user_id: None,
                    effective_date: date(2025, 1, 15),
                    note: None,
                })
            })
            .map(|_| ())
        })
        .unwrap();

    let resumed = services.pool.process_pool_cycle(1, date(2025, 1, 20)).unwrap();
    assert_eq!(resumed.paid, 1);
    assert_eq!(resumed.already_paid, 1);
    assert_eq!(resumed.distributed_now, 2_500);
    assert_eq!(services.ledger.balance("leader-a").unwrap().pool_bonuses, 2_500);
    assert_eq!(services.ledger.balance("leader-b").unwrap().pool_bonuses, 2_500);
}

/// State survives a restart and picks up where the ledger left off
#[test]
fn test_restart_keeps_position() {
    let dir = TempDir::new().unwrap();
    let start = date(2026, 1, 1);
    {
        let services = open_services(&dir);
        deposit(&services, "p1", "alice", 10_000, start);
        advance_days(&services, "p1", start, 3);
    }

    let services = open_services(&dir);
    let summary = services.reconcile.reconcile_all().unwrap();
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.repaired, 0);

    let next = services.accrual.advance_one_day("p1", start + Days::days(4), false).unwrap();
    assert_eq!(next.kind, AdvanceKind::Paid);
    assert!(next.entry.unwrap().note.unwrap().contains("day 4"));
    assert_eq!(services.ledger.balance("alice").unwrap().earnings, 5_000);
}

/// Daily batches over several purchases, one day at a time
#[tokio::test]
async fn test_scheduler_runs_full_cycle() {
    let dir = TempDir::new().unwrap();
    let services = Arc::new(open_services(&dir));
    let start = date(2026, 1, 1);
    refer(&services, "sponsor", "alice", 1);
    for (id, user) in [("p1", "alice"), ("p2", "bob"), ("p3", "carol")] {
        deposit(&services, id, user, 10_000, start);
    }

    let scheduler = Scheduler::new(services.clone(), 2, Duration::from_secs(3600));
    let mut paid = 0;
    let mut paused = 0;
    for n in 1..=9 {
        let summary = scheduler.run_daily_batch(start + Days::days(n)).await.unwrap();
        assert_eq!(summary.failed, 0);
        paid += summary.paid;
        paused += summary.paused;
        if n == 8 {
            // alice's first cycle closed; bob and carol have no referrer
            assert_eq!(summary.commissions.paid, 1);
            assert_eq!(summary.commissions.ineligible, 2);
        }
    }

    assert_eq!(paid, 24);
    assert_eq!(paused, 3);
    assert_eq!(services.ledger.balance("sponsor").unwrap().commissions, 1_500);
    assert!(services.reconcile.verify_invariants().unwrap().is_clean());
}
