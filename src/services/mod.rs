//! Service layer for license-ledger
//!
//! Engines encapsulate business rules between triggers (HTTP, scheduler)
//! and repositories. Each engine wraps database operations with:
//! - Eligibility checks
//! - One transaction per unit of work
//! - Event emission for audit/notifications
//!
//! ## Architecture
//!
//! ```text
//! HTTP Handlers / Scheduler (thin)
//!     ↓
//! Engines (accrual, commission, pool, deposits, reconcile)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod accrual;
pub mod commission;
pub mod pool;
pub mod policy;
pub mod deposits;
pub mod reconcile;
pub mod ledger_query;
pub mod response;

// Re-exports
pub use events::{EngineEvent, EventBus, EventListener};
pub use accrual::{AccrualEngine, AdvanceKind, AdvanceOutcome};
pub use commission::{CommissionBatchSummary, CommissionEngine};
pub use pool::{PoolCycleSummary, PoolEngine, PoolSettings};
pub use policy::{DistributionPolicy, EqualSplit, ProportionalSplit};
pub use deposits::{DepositEvent, DepositOutcome, DepositService};
pub use reconcile::{InvariantReport, ReconcileReport, ReconcileService, ReconcileSummary};
pub use ledger_query::{Balance, LedgerQueryService, WithdrawalRequest};

use std::sync::Arc;

use crate::config::Config;
use crate::db::{LedgerDb, PackageTerms};

/// Service container for dependency injection
///
/// Holds all engines with a shared database and event bus.
/// Pass this to HttpServer and the scheduler.
pub struct Services {
    pub db: Arc<LedgerDb>,
    pub accrual: Arc<AccrualEngine>,
    pub commission: Arc<CommissionEngine>,
    pub pool: Arc<PoolEngine>,
    pub deposits: Arc<DepositService>,
    pub reconcile: Arc<ReconcileService>,
    pub ledger: Arc<LedgerQueryService>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Create all services with shared database
    pub fn new(db: Arc<LedgerDb>, config: &Config) -> Self {
        let events = Arc::new(EventBus::new());
        let default_terms = PackageTerms::from(&config.default_package);

        Self {
            accrual: Arc::new(AccrualEngine::new(db.clone(), events.clone())),
            commission: Arc::new(CommissionEngine::new(db.clone(), events.clone())),
            pool: Arc::new(PoolEngine::new(db.clone(), events.clone(), PoolSettings::from(config))),
            deposits: Arc::new(DepositService::new(
                db.clone(),
                events.clone(),
                default_terms,
                config.currency.clone(),
            )),
            reconcile: Arc::new(ReconcileService::new(db.clone(), events.clone())),
            ledger: Arc::new(LedgerQueryService::new(db.clone(), events.clone(), config.currency.clone())),
            events,
            db,
        }
    }
}
