//! Pool distribution engine
//!
//! Cycle `n` covers `[epoch + (n-1)*interval, epoch + n*interval)` and can
//! only be processed once its boundary has passed. The first run freezes
//! the allocation plan; every run then pays each unpaid allocation in its
//! own transaction, checked against the participant's ledger key. A run
//! that dies halfway is resumed by running the same cycle again.

use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{Config, PoolPolicyKind, PoolSalesWindow};
use crate::db::ledger::{self, EntryDraft, IdempotencyKey};
use crate::db::pool::{self as pool_db, PoolAllocation, PoolCycleRecord, PoolParticipant};
use crate::db::LedgerDb;
use crate::error::{EngineError, Ineligible};
use crate::money::{Amount, Bps};

use super::events::{EngineEvent, EventBus};
use super::policy::{policy_for, DistributionPolicy};

/// Sales counted for a cycle: `from <= effective_date < before`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SalesWindow {
    pub from: Option<NaiveDate>,
    pub before: NaiveDate,
}

/// Pool settings taken from [`Config`]
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub epoch: NaiveDate,
    pub interval_days: u32,
    pub bonus_rate: Bps,
    pub policy: PoolPolicyKind,
    pub sales_window: PoolSalesWindow,
    pub currency: String,
}

impl From<&Config> for PoolSettings {
    fn from(config: &Config) -> Self {
        Self {
            epoch: config.program_epoch,
            interval_days: config.pool_interval_days,
            bonus_rate: config.pool_bonus_rate_bps,
            policy: config.pool_policy,
            sales_window: config.pool_sales_window,
            currency: config.currency.clone(),
        }
    }
}

/// Result of one pool run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCycleSummary {
    pub cycle_number: u32,
    pub boundary: NaiveDate,
    pub total_eligible_sales: Amount,
    pub pool_total: Amount,
    pub policy: String,
    /// This run froze the plan
    pub plan_created: bool,
    pub paid: usize,
    pub already_paid: usize,
    pub zero_share: usize,
    pub failed: usize,
    /// Amount written by this run
    pub distributed_now: Amount,
}

/// Pool distribution engine
pub struct PoolEngine {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
    settings: PoolSettings,
    policy: Box<dyn DistributionPolicy>,
}

impl PoolEngine {
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>, settings: PoolSettings) -> Self {
        let policy = policy_for(settings.policy);
        Self { db, events, settings, policy }
    }

    /// Use a custom distribution policy
    pub fn with_policy(mut self, policy: Box<dyn DistributionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    // =========================================================================
    // Cycle Calendar
    // =========================================================================

    /// `(window_start, boundary)` of cycle `n`
    pub fn cycle_bounds(&self, cycle_number: u32) -> Result<(NaiveDate, NaiveDate), EngineError> {
        if cycle_number == 0 {
            return Err(EngineError::InvalidInput("pool cycles start at 1".into()));
        }
        let interval = self.settings.interval_days as i64;
        let start = self.settings.epoch + Duration::days((cycle_number as i64 - 1) * interval);
        let boundary = start + Duration::days(interval);
        Ok((start, boundary))
    }

    /// The cycle containing `date`, `None` before the epoch
    pub fn cycle_number_for(&self, date: NaiveDate) -> Option<u32> {
        let elapsed = (date - self.settings.epoch).num_days();
        if elapsed < 0 {
            return None;
        }
        Some((elapsed / self.settings.interval_days as i64) as u32 + 1)
    }

    /// The latest cycle whose boundary is on or before `as_of`
    pub fn last_closed_cycle(&self, as_of: NaiveDate) -> Option<u32> {
        let elapsed = (as_of - self.settings.epoch).num_days();
        let closed = elapsed / self.settings.interval_days as i64;
        (closed >= 1).then_some(closed as u32)
    }

    fn sales_window(&self, window_start: NaiveDate, boundary: NaiveDate) -> SalesWindow {
        match self.settings.sales_window {
            PoolSalesWindow::Cumulative => SalesWindow { from: Some(self.settings.epoch), before: boundary },
            PoolSalesWindow::Cycle => SalesWindow { from: Some(window_start), before: boundary },
        }
    }

    // =========================================================================
    // Processing
    // =========================================================================

    /// Frozen plan for a cycle, if it was processed before
    pub fn get_plan(&self, cycle_number: u32) -> Result<Option<(PoolCycleRecord, Vec<PoolAllocation>)>, EngineError> {
        self.db.with_conn(|conn| pool_db::get_plan(conn, cycle_number))
    }

    pub fn upsert_participant(&self, participant: &PoolParticipant) -> Result<(), EngineError> {
        ledger::validate_id("participant_id", &participant.participant_id)?;
        self.db.with_conn(|conn| pool_db::upsert_participant(conn, participant))
    }

    /// Pay cycle `n`. Re-running pays only what is still unpaid.
    pub fn process_pool_cycle(&self, cycle_number: u32, as_of: NaiveDate) -> Result<PoolCycleSummary, EngineError> {
        let (window_start, boundary) = self.cycle_bounds(cycle_number)?;
        if as_of < boundary {
            return Err(Ineligible::PoolCycleOpen { boundary }.into());
        }

        let (record, allocations, plan_created) = self.load_or_freeze_plan(cycle_number, window_start, boundary)?;

        let mut summary = PoolCycleSummary {
            cycle_number,
            boundary,
            total_eligible_sales: record.total_eligible_sales,
            pool_total: record.pool_total,
            policy: record.policy.clone(),
            plan_created,
            paid: 0,
            already_paid: 0,
            zero_share: 0,
            failed: 0,
            distributed_now: 0,
        };

        for allocation in &allocations {
            if allocation.amount == 0 {
                summary.zero_share += 1;
                continue;
            }

            match self.pay_allocation(&record, allocation) {
                Ok(outcome) if outcome.already_existed => summary.already_paid += 1,
                Ok(outcome) => {
                    summary.paid += 1;
                    summary.distributed_now += outcome.entry.amount;
                    self.events.emit(EngineEvent::PoolBonusPaid {
                        participant_id: allocation.participant_id.clone(),
                        cycle_number,
                        amount: outcome.entry.amount,
                    });
                }
                Err(e) => {
                    summary.failed += 1;
                    if e.is_invariant_violation() {
                        error!(participant_id = %allocation.participant_id, cycle_number, error = %e, "Pool payout halted");
                        self.events.emit(EngineEvent::InvariantViolated {
                            entity: format!("pool:{}:{}", cycle_number, allocation.participant_id),
                            detail: e.to_string(),
                        });
                    } else {
                        warn!(participant_id = %allocation.participant_id, cycle_number, error = %e, "Pool payout failed, rerun to resume");
                    }
                }
            }
        }

        info!(
            cycle_number,
            pool_total = record.pool_total,
            paid = summary.paid,
            already_paid = summary.already_paid,
            failed = summary.failed,
            "Pool cycle processed"
        );
        self.events.emit(EngineEvent::PoolCycleProcessed {
            cycle_number,
            paid: summary.paid,
            skipped: summary.already_paid + summary.zero_share,
        });

        Ok(summary)
    }

    /// Process every closed cycle without a plan, plus the latest planned
    /// one so an interrupted payout resumes. Cycles skipped for lack of
    /// participants are retried on every run.
    pub fn process_closed_cycles(&self, as_of: NaiveDate) -> Result<Vec<PoolCycleSummary>, EngineError> {
        let Some(last_closed) = self.last_closed_cycle(as_of) else {
            return Ok(vec![]);
        };
        let planned = self.db.with_conn(pool_db::planned_cycles)?;
        let latest_planned = planned.last().copied();

        let mut summaries = Vec::new();
        for cycle_number in 1..=last_closed {
            if planned.binary_search(&cycle_number).is_ok() && Some(cycle_number) != latest_planned {
                continue;
            }
            match self.process_pool_cycle(cycle_number, as_of) {
                Ok(summary) => summaries.push(summary),
                Err(EngineError::NotEligible(reason)) => {
                    debug!(cycle_number, reason = %reason, "Pool cycle skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summaries)
    }

    fn load_or_freeze_plan(
        &self,
        cycle_number: u32,
        window_start: NaiveDate,
        boundary: NaiveDate,
    ) -> Result<(PoolCycleRecord, Vec<PoolAllocation>, bool), EngineError> {
        self.db.with_tx(|tx| {
            if let Some((record, allocations)) = pool_db::get_plan(tx, cycle_number)? {
                debug!(cycle_number, "Using frozen pool plan");
                return Ok((record, allocations, false));
            }

            let window = self.sales_window(window_start, boundary);
            let total_eligible_sales = ledger::sum_license_sales(tx, window.from, window.before)?;
            let pool_total = self.settings.bonus_rate.apply(total_eligible_sales);

            let participants = pool_db::eligible_participants(tx, boundary)?;
            if participants.is_empty() {
                return Err(Ineligible::NoPoolParticipants { cycle_number }.into());
            }

            let weighted = participants
                .iter()
                .map(|p| -> Result<(String, i64), EngineError> {
                    Ok((p.participant_id.clone(), self.policy.weight(tx, p, &window)?))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let allocations = self.policy.allocate(pool_total, &weighted);

            let record = PoolCycleRecord {
                cycle_number,
                window_start,
                boundary,
                total_eligible_sales,
                bonus_rate_bps: self.settings.bonus_rate,
                pool_total,
                policy: self.policy.name().to_string(),
                planned_at: String::new(),
            };
            pool_db::insert_plan(tx, &record, &allocations)?;

            info!(
                cycle_number,
                total_eligible_sales,
                pool_total,
                participants = allocations.len(),
                policy = %record.policy,
                "Pool plan frozen"
            );

            let (record, allocations) = pool_db::get_plan(tx, cycle_number)?
                .ok_or_else(|| EngineError::Internal("Pool plan not found after insert".into()))?;
            Ok((record, allocations, true))
        })
    }

    fn pay_allocation(
        &self,
        record: &PoolCycleRecord,
        allocation: &PoolAllocation,
    ) -> Result<ledger::RecordOutcome, EngineError> {
        let key = IdempotencyKey::pool_bonus(&allocation.participant_id, record.cycle_number);
        self.db.with_tx(|tx| {
            ledger::record_once(tx, &key, || {
                Ok(EntryDraft {
                    amount: allocation.amount,
                    currency: self.settings.currency.clone(),
                    cause_user_id: None,
                    effective_date: record.boundary,
                    note: Some(format!("pool cycle {} ({})", record.cycle_number, record.policy)),
                })
            })
        })
    }
}
