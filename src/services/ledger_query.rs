//! Read-only ledger projection and withdrawals
//!
//! Balances are never stored; they are summed from completed entries on
//! every call. Pending withdrawals reserve funds until settled.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::ledger::{self, validate_id, EntryDraft, EntryStatus, EntryType, IdempotencyKey, LedgerEntry, LedgerQuery, RecordOutcome};
use crate::db::LedgerDb;
use crate::error::{EngineError, Ineligible};
use crate::money::Amount;

use super::events::{EngineEvent, EventBus};

/// Balance projection for one user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub user_id: String,
    pub earnings: Amount,
    pub commissions: Amount,
    pub pool_bonuses: Amount,
    /// License purchases; not withdrawable
    pub deposits: Amount,
    pub withdrawn: Amount,
    pub pending_withdrawals: Amount,
    pub available: Amount,
}

/// Withdrawal request from the wallet collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    /// Caller-chosen ID; resubmitting the same ID returns the same entry
    pub request_id: String,
    pub user_id: String,
    #[serde(deserialize_with = "crate::money::deserialize_amount")]
    pub amount: Amount,
    #[serde(default)]
    pub currency: Option<String>,
    pub requested_on: NaiveDate,
}

/// Ledger query service
pub struct LedgerQueryService {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
    default_currency: String,
}

impl LedgerQueryService {
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>, default_currency: String) -> Self {
        Self { db, events, default_currency }
    }

    pub fn get(&self, id: &str) -> Result<Option<LedgerEntry>, EngineError> {
        self.db.with_conn(|conn| ledger::get_entry(conn, id))
    }

    pub fn list(&self, query: &LedgerQuery) -> Result<Vec<LedgerEntry>, EngineError> {
        self.db.with_conn(|conn| ledger::list_entries(conn, query))
    }

    pub fn balance(&self, user_id: &str) -> Result<Balance, EngineError> {
        self.db.with_conn(|conn| balance_of(conn, user_id))
    }

    /// Reserve funds with a pending withdrawal entry
    pub fn request_withdrawal(&self, request: &WithdrawalRequest) -> Result<LedgerEntry, EngineError> {
        validate_id("requestId", &request.request_id)?;
        validate_id("userId", &request.user_id)?;
        if request.amount <= 0 {
            return Err(EngineError::InvalidInput(format!(
                "withdrawal amount must be positive, got {}",
                request.amount
            )));
        }

        let key = IdempotencyKey::withdrawal(&request.user_id, &request.request_id);
        let (entry, created) = self.db.with_tx(|tx| {
            if let Some(existing) = ledger::find_open(tx, &key)? {
                return Ok((existing, false));
            }

            let balance = balance_of(tx, &request.user_id)?;
            if balance.available < request.amount {
                return Err(Ineligible::InsufficientBalance {
                    available: balance.available,
                    requested: request.amount,
                }
                .into());
            }

            let entry = ledger::record_pending(
                tx,
                &key,
                EntryDraft {
                    amount: request.amount,
                    currency: request.currency.clone().unwrap_or_else(|| self.default_currency.clone()),
                    cause_user_id: None,
                    effective_date: request.requested_on,
                    note: None,
                },
            )?;
            Ok((entry, true))
        })?;

        if created {
            info!(entry_id = %entry.id, user_id = %entry.user_id, amount = entry.amount, "Withdrawal requested");
            self.events.emit(EngineEvent::WithdrawalRequested {
                entry_id: entry.id.clone(),
                user_id: entry.user_id.clone(),
                amount: entry.amount,
            });
        }

        Ok(entry)
    }

    /// Complete or fail a pending withdrawal
    pub fn settle_withdrawal(&self, entry_id: &str, succeeded: bool) -> Result<RecordOutcome, EngineError> {
        let outcome = if succeeded { EntryStatus::Completed } else { EntryStatus::Failed };

        let result = self.db.with_tx(|tx| {
            let entry = ledger::get_entry(tx, entry_id)?
                .ok_or_else(|| EngineError::NotFound(format!("ledger entry {}", entry_id)))?;
            if entry.entry_type != EntryType::Withdrawal {
                return Err(EngineError::InvalidInput(format!("entry {} is not a withdrawal", entry_id)));
            }
            ledger::settle_entry(tx, entry_id, outcome)
        })?;

        if !result.already_existed {
            self.events.emit(EngineEvent::WithdrawalSettled {
                entry_id: result.entry.id.clone(),
                status: result.entry.status.as_str().to_string(),
            });
        }

        Ok(result)
    }
}

fn balance_of(conn: &rusqlite::Connection, user_id: &str) -> Result<Balance, EngineError> {
    let mut balance = Balance {
        user_id: user_id.to_string(),
        ..Default::default()
    };

    for (entry_type, total) in ledger::completed_totals_by_type(conn, user_id)? {
        match entry_type {
            EntryType::Earnings => balance.earnings = total,
            EntryType::Commission => balance.commissions = total,
            EntryType::PoolBonus => balance.pool_bonuses = total,
            EntryType::Deposit => balance.deposits = total,
            EntryType::Withdrawal => balance.withdrawn = total,
        }
    }

    balance.pending_withdrawals = ledger::pending_withdrawals(conn, user_id)?;
    balance.available = balance.earnings + balance.commissions + balance.pool_bonuses
        - balance.withdrawn
        - balance.pending_withdrawals;

    Ok(balance)
}
