//! Daily batch scheduler
//!
//! Advances every due purchase, then drains the commission outbox and pays
//! any pool cycle whose boundary has passed. Purchases run in parallel up
//! to `max_concurrency`; the same purchase never runs twice at once, whether
//! the second attempt comes from the batch or from an HTTP trigger.
//!
//! Stopping the loop drops queued work. A unit already inside its
//! transaction finishes; nothing is left half-applied.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::services::{AdvanceKind, AdvanceOutcome, CommissionBatchSummary, PoolCycleSummary, Services};

/// Attempts per purchase when the failure is transient
const MAX_ATTEMPTS: u32 = 3;

/// Per-key async locks
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }

    fn release(&self, key: &str) {
        // Only the map itself still holds the lock
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Result of one daily batch
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub due: usize,
    pub paid: usize,
    pub paused: usize,
    pub already_advanced: usize,
    pub not_eligible: usize,
    pub failed: usize,
    pub commissions: CommissionBatchSummary,
}

/// Batch runner shared by the daemon loop and the HTTP triggers
pub struct Scheduler {
    services: Arc<Services>,
    locks: Arc<KeyedLocks>,
    max_concurrency: usize,
    interval: Duration,
}

impl Scheduler {
    pub fn new(services: Arc<Services>, max_concurrency: usize, interval: Duration) -> Self {
        Self {
            services,
            locks: Arc::new(KeyedLocks::new()),
            max_concurrency: max_concurrency.max(1),
            interval,
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Advance one purchase under its lock, retrying transient failures
    pub async fn advance(
        &self,
        purchase_id: &str,
        as_of: NaiveDate,
        admin_override: bool,
    ) -> Result<AdvanceOutcome, EngineError> {
        advance_locked(
            self.services.clone(),
            self.locks.clone(),
            purchase_id.to_string(),
            as_of,
            admin_override,
        )
        .await
    }

    /// Advance every purchase due on `as_of`, then drain the commission outbox
    pub async fn run_daily_batch(&self, as_of: NaiveDate) -> Result<BatchSummary, EngineError> {
        let accrual = self.services.accrual.clone();
        let due = blocking(move || accrual.list_due(as_of)).await?;

        let mut summary = BatchSummary {
            due: due.len(),
            ..Default::default()
        };
        info!(as_of = %as_of, due = due.len(), "Starting daily batch");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();

        for purchase_id in due {
            let semaphore = semaphore.clone();
            let services = self.services.clone();
            let locks = self.locks.clone();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| EngineError::Internal(format!("Semaphore closed: {}", e)))?;
                let result = advance_locked(services, locks, purchase_id.clone(), as_of, false).await;
                Ok::<_, EngineError>((purchase_id, result))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (purchase_id, result) = match joined {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    error!(error = %e, "Batch task failed");
                    summary.failed += 1;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Batch task panicked");
                    summary.failed += 1;
                    continue;
                }
            };

            match result {
                Ok(outcome) => match outcome.kind {
                    AdvanceKind::Paid => summary.paid += 1,
                    AdvanceKind::Paused => summary.paused += 1,
                    AdvanceKind::AlreadyAdvanced => summary.already_advanced += 1,
                },
                Err(EngineError::NotEligible(reason)) => {
                    debug!(purchase_id = %purchase_id, reason = %reason, "Purchase skipped");
                    summary.not_eligible += 1;
                }
                Err(e) => {
                    if e.is_invariant_violation() {
                        error!(purchase_id = %purchase_id, error = %e, "Purchase halted for manual reconciliation");
                    } else {
                        warn!(purchase_id = %purchase_id, error = %e, "Advance failed");
                    }
                    summary.failed += 1;
                }
            }
        }

        let commission = self.services.commission.clone();
        summary.commissions = blocking(move || commission.process_direct_commissions()).await?;

        info!(
            as_of = %as_of,
            paid = summary.paid,
            paused = summary.paused,
            already_advanced = summary.already_advanced,
            not_eligible = summary.not_eligible,
            failed = summary.failed,
            "Daily batch finished"
        );

        Ok(summary)
    }

    /// Pay every closed pool cycle not yet fully paid
    pub async fn run_pool(&self, as_of: NaiveDate) -> Result<Vec<PoolCycleSummary>, EngineError> {
        let pool = self.services.pool.clone();
        blocking(move || pool.process_closed_cycles(as_of)).await
    }

    /// One scheduler tick
    pub async fn tick(&self, as_of: NaiveDate) -> Result<(), EngineError> {
        self.run_daily_batch(as_of).await?;
        let cycles = self.run_pool(as_of).await?;
        for cycle in cycles.iter().filter(|c| c.paid > 0) {
            info!(cycle_number = cycle.cycle_number, paid = cycle.paid, "Pool cycle paid by scheduler");
        }
        Ok(())
    }

    /// Tick on the configured interval until shutdown
    pub async fn run_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            let as_of = Utc::now().date_naive();
            tokio::select! {
                result = self.tick(as_of) => {
                    if let Err(e) = result {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutdown during batch, stopping between units");
                    break;
                }
            }
        }

        info!("Scheduler stopped");
    }
}

async fn advance_locked(
    services: Arc<Services>,
    locks: Arc<KeyedLocks>,
    purchase_id: String,
    as_of: NaiveDate,
    admin_override: bool,
) -> Result<AdvanceOutcome, EngineError> {
    let lock = locks.handle(&purchase_id);
    let result = {
        let _guard = lock.lock().await;
        let mut attempt = 1;
        loop {
            let accrual = services.accrual.clone();
            let id = purchase_id.clone();
            match blocking(move || accrual.advance_one_day(&id, as_of, admin_override)).await {
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    warn!(purchase_id = %purchase_id, attempt, error = %e, "Transient failure, retrying");
                    attempt += 1;
                }
                other => break other,
            }
        }
    };
    drop(lock);
    locks.release(&purchase_id);
    result
}

pub(crate) async fn blocking<F, T>(f: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Internal(format!("Blocking task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::LedgerDb;
    use crate::services::DepositEvent;

    fn scheduler() -> Scheduler {
        let config = Config::default();
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        let services = Arc::new(Services::new(db, &config));
        Scheduler::new(services, 4, Duration::from_secs(3600))
    }

    fn deposit(scheduler: &Scheduler, id: &str) {
        scheduler
            .services()
            .deposits
            .confirm_deposit(&DepositEvent {
                purchase_id: id.into(),
                user_id: format!("user-{}", id),
                amount: 10_000,
                package_id: "gold".into(),
                currency: None,
                confirmed_on: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_batch_advances_all_due_once_per_day() {
        let scheduler = scheduler();
        for id in ["a", "b", "c"] {
            deposit(&scheduler, id);
        }
        let day = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();

        let first = scheduler.run_daily_batch(day).await.unwrap();
        assert_eq!(first.due, 3);
        assert_eq!(first.paid, 3);

        // Nothing is due again until tomorrow
        let second = scheduler.run_daily_batch(day).await.unwrap();
        assert_eq!(second.due, 0);
        assert!(scheduler.locks.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_advances_of_one_purchase_pay_once() {
        let scheduler = Arc::new(scheduler());
        deposit(&scheduler, "a");
        let day = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();

        let (x, y) = tokio::join!(scheduler.advance("a", day, false), scheduler.advance("a", day, false));
        let kinds = [x.unwrap().kind, y.unwrap().kind];
        assert!(kinds.contains(&AdvanceKind::Paid));
        assert!(kinds.contains(&AdvanceKind::AlreadyAdvanced));
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let scheduler = Arc::new(scheduler());
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(scheduler.clone().run_loop(rx));
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
