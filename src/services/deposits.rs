//! Deposit intake and collaborator read models
//!
//! The payment collaborator hands over a confirmed deposit; this turns it
//! into an active purchase, a `deposit/license_purchase` sale entry (the
//! input of pool cycles) and the activation commission, all in one
//! transaction. Redelivery of the same event is a no-op.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::ledger::{self, validate_id, EntryDraft, IdempotencyKey, RecordOutcome};
use crate::db::purchases::{self, NewPurchase};
use crate::db::{packages, referrals, LedgerDb, Package, PackageTerms, Purchase, PurchaseStatus, ReferralEdge};
use crate::error::EngineError;
use crate::money::Amount;

use super::commission::record_activation_commission;
use super::events::{EngineEvent, EventBus};

/// Completed-deposit event from the payment collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositEvent {
    pub purchase_id: String,
    pub user_id: String,
    /// Minor units, or a decimal string
    #[serde(deserialize_with = "crate::money::deserialize_amount")]
    pub amount: Amount,
    pub package_id: String,
    #[serde(default)]
    pub currency: Option<String>,
    pub confirmed_on: NaiveDate,
}

/// Result of [`DepositService::confirm_deposit`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositOutcome {
    pub purchase: Purchase,
    /// False when the event was seen before
    pub created: bool,
    pub sale: RecordOutcome,
    pub activation_commission: Option<RecordOutcome>,
}

/// Deposit intake service
pub struct DepositService {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
    default_terms: PackageTerms,
    default_currency: String,
}

impl DepositService {
    pub fn new(
        db: Arc<LedgerDb>,
        events: Arc<EventBus>,
        default_terms: PackageTerms,
        default_currency: String,
    ) -> Self {
        Self { db, events, default_terms, default_currency }
    }

    /// Turn a confirmed deposit into an active purchase
    pub fn confirm_deposit(&self, event: &DepositEvent) -> Result<DepositOutcome, EngineError> {
        validate_id("purchaseId", &event.purchase_id)?;
        validate_id("userId", &event.user_id)?;
        validate_id("packageId", &event.package_id)?;
        if event.amount <= 0 {
            return Err(EngineError::InvalidInput(format!("amount must be positive, got {}", event.amount)));
        }

        let currency = event.currency.clone().unwrap_or_else(|| self.default_currency.clone());

        let outcome = self.db.with_tx(|tx| {
            let terms = match packages::get_package(tx, &event.package_id)? {
                Some(package) => package.terms,
                None => {
                    warn!(package_id = %event.package_id, "Package not in catalog, using default terms");
                    self.default_terms
                }
            };

            let created = purchases::insert_purchase(tx, &NewPurchase {
                id: event.purchase_id.clone(),
                user_id: event.user_id.clone(),
                package_id: event.package_id.clone(),
                amount: event.amount,
                currency: currency.clone(),
                terms,
                status: PurchaseStatus::Active,
                activated_on: Some(event.confirmed_on),
            })?;

            let purchase = purchases::require_purchase(tx, &event.purchase_id)?;
            if !created && (purchase.user_id != event.user_id || purchase.amount != event.amount) {
                return Err(EngineError::InvariantViolation(format!(
                    "deposit for purchase {} conflicts with the stored purchase",
                    event.purchase_id
                )));
            }

            let key = IdempotencyKey::license_purchase(&purchase.user_id, &purchase.id);
            let sale = ledger::record_once(tx, &key, || {
                Ok(EntryDraft {
                    amount: purchase.amount,
                    currency: purchase.currency.clone(),
                    cause_user_id: None,
                    effective_date: event.confirmed_on,
                    note: Some(format!("package {}", purchase.package_id)),
                })
            })?;

            let activation_commission = record_activation_commission(tx, &purchase, event.confirmed_on)?;

            Ok(DepositOutcome { purchase, created, sale, activation_commission })
        })?;

        if outcome.created {
            info!(
                purchase_id = %outcome.purchase.id,
                user_id = %outcome.purchase.user_id,
                amount = outcome.purchase.amount,
                "Purchase activated"
            );
            self.events.emit(EngineEvent::PurchaseActivated {
                purchase_id: outcome.purchase.id.clone(),
                user_id: outcome.purchase.user_id.clone(),
                amount: outcome.purchase.amount,
            });
        }

        if let Some(commission) = outcome.activation_commission.as_ref().filter(|c| !c.already_existed) {
            self.events.emit(EngineEvent::CommissionPaid {
                referrer_id: commission.entry.user_id.clone(),
                subtype: commission.entry.subtype.clone(),
                purchase_id: outcome.purchase.id.clone(),
                amount: commission.entry.amount,
            });
        }

        Ok(outcome)
    }

    // =========================================================================
    // Read models handed in by collaborators
    // =========================================================================

    pub fn upsert_package(&self, package: &Package) -> Result<(), EngineError> {
        validate_id("id", &package.id)?;
        self.db.with_conn(|conn| packages::upsert_package(conn, package))
    }

    pub fn list_packages(&self) -> Result<Vec<Package>, EngineError> {
        self.db.with_conn(packages::list_packages)
    }

    pub fn upsert_referral(&self, edge: &ReferralEdge) -> Result<(), EngineError> {
        validate_id("referrerId", &edge.referrer_id)?;
        validate_id("referredId", &edge.referred_id)?;
        self.db.with_conn(|conn| referrals::upsert_edge(conn, edge))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackageDefaults;
    use crate::db::ledger::subtypes;

    fn service() -> DepositService {
        DepositService::new(
            Arc::new(LedgerDb::open_in_memory().unwrap()),
            Arc::new(EventBus::new()),
            PackageTerms::from(&PackageDefaults::default()),
            "USDT".into(),
        )
    }

    fn event() -> DepositEvent {
        DepositEvent {
            purchase_id: "p1".into(),
            user_id: "alice".into(),
            amount: 10_000,
            package_id: "gold".into(),
            currency: None,
            confirmed_on: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        }
    }

    #[test]
    fn test_confirm_creates_active_purchase() {
        let service = service();
        let out = service.confirm_deposit(&event()).unwrap();

        assert!(out.created);
        assert_eq!(out.purchase.status, PurchaseStatus::Active);
        assert_eq!(out.purchase.cycle.current_day, 1);
        assert_eq!(out.purchase.next_benefit_date, NaiveDate::from_ymd_opt(2026, 1, 2));
        assert_eq!(out.sale.entry.subtype, subtypes::LICENSE_PURCHASE);
        assert!(out.activation_commission.is_none());
    }

    #[test]
    fn test_redelivery_is_noop() {
        let service = service();
        service
            .upsert_referral(&ReferralEdge {
                referrer_id: "sponsor".into(),
                referred_id: "alice".into(),
                level: 1,
                status: "active".into(),
            })
            .unwrap();

        let first = service.confirm_deposit(&event()).unwrap();
        let second = service.confirm_deposit(&event()).unwrap();

        assert!(!second.created);
        assert!(second.sale.already_existed);
        let commission = second.activation_commission.unwrap();
        assert!(commission.already_existed);
        assert_eq!(commission.entry.id, first.activation_commission.unwrap().entry.id);
        assert_eq!(commission.entry.amount, 500);
    }

    #[test]
    fn test_conflicting_redelivery_is_invariant_violation() {
        let service = service();
        service.confirm_deposit(&event()).unwrap();

        let mut other = event();
        other.amount = 20_000;
        assert!(service.confirm_deposit(&other).unwrap_err().is_invariant_violation());
    }

    #[test]
    fn test_catalog_terms_are_snapshotted() {
        let service = service();
        service
            .upsert_package(&Package {
                id: "gold".into(),
                name: None,
                terms: PackageTerms {
                    max_cycles: 2,
                    ..PackageTerms::from(&PackageDefaults::default())
                },
            })
            .unwrap();

        let out = service.confirm_deposit(&event()).unwrap();
        assert_eq!(out.purchase.terms.max_cycles, 2);
    }

    #[test]
    fn test_rejects_bad_input() {
        let service = service();
        let mut bad = event();
        bad.amount = 0;
        assert!(service.confirm_deposit(&bad).is_err());

        let mut bad = event();
        bad.user_id = "a|b".into();
        assert!(service.confirm_deposit(&bad).is_err());
    }
}
