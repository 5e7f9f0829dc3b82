//! Error types for license-ledger

use chrono::NaiveDate;
use thiserror::Error;

/// Why a unit of work was refused. Reported to the caller, never retried
/// automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ineligible {
    PurchaseNotActive { status: String },
    NotDue { next_benefit_date: NaiveDate },
    CycleCapReached { cycles_completed: u32 },
    FirstCycleIncomplete,
    NoReferrer,
    SelfReferral,
    PoolCycleOpen { boundary: NaiveDate },
    NoPoolParticipants { cycle_number: u32 },
    InsufficientBalance { available: i64, requested: i64 },
}

impl Ineligible {
    /// Short machine-readable tag (outbox resolutions, HTTP bodies)
    pub fn tag(&self) -> &'static str {
        match self {
            Ineligible::PurchaseNotActive { .. } => "purchase_not_active",
            Ineligible::NotDue { .. } => "not_due",
            Ineligible::CycleCapReached { .. } => "cycle_cap_reached",
            Ineligible::FirstCycleIncomplete => "first_cycle_incomplete",
            Ineligible::NoReferrer => "no_referrer",
            Ineligible::SelfReferral => "self_referral",
            Ineligible::PoolCycleOpen { .. } => "pool_cycle_open",
            Ineligible::NoPoolParticipants { .. } => "no_pool_participants",
            Ineligible::InsufficientBalance { .. } => "insufficient_balance",
        }
    }
}

impl std::fmt::Display for Ineligible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ineligible::PurchaseNotActive { status } => write!(f, "purchase is {}, not active", status),
            Ineligible::NotDue { next_benefit_date } => {
                write!(f, "next benefit is due on {}", next_benefit_date)
            }
            Ineligible::CycleCapReached { cycles_completed } => {
                write!(f, "cycle cap reached after {} cycles", cycles_completed)
            }
            Ineligible::FirstCycleIncomplete => write!(f, "first cycle not completed"),
            Ineligible::NoReferrer => write!(f, "no active level-1 referrer"),
            Ineligible::SelfReferral => write!(f, "referrer and referred user are the same"),
            Ineligible::PoolCycleOpen { boundary } => {
                write!(f, "pool cycle closes on {}", boundary)
            }
            Ineligible::NoPoolParticipants { cycle_number } => {
                write!(f, "no eligible participants for pool cycle {}", cycle_number)
            }
            Ineligible::InsufficientBalance { available, requested } => write!(
                f,
                "insufficient balance: available {}, requested {}",
                crate::money::format_amount(*available),
                crate::money::format_amount(*requested)
            ),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Not eligible: {0}")]
    NotEligible(Ineligible),

    /// Fatal for the entity: halt and surface for manual reconciliation
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Transient storage failure; the unit of work is safe to retry
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the whole unit of work may be retried as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Storage(_))
    }

    pub fn is_not_eligible(&self) -> bool {
        matches!(self, EngineError::NotEligible(_))
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, EngineError::InvariantViolation(_))
    }
}

impl From<Ineligible> for EngineError {
    fn from(reason: Ineligible) -> Self {
        EngineError::NotEligible(reason)
    }
}
