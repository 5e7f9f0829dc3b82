//! Pool distribution policies
//!
//! A policy turns the eligible participants of a cycle into weights; the
//! split itself is shared. Rounding leftovers go one minor unit at a time to
//! the largest fractional shares (ties by participant ID), so the sum of all
//! allocations always equals the pool total.

use rusqlite::Connection;

use crate::config::PoolPolicyKind;
use crate::db::pool::{referral_volume, PoolAllocation, PoolParticipant};
use crate::error::EngineError;
use crate::money::Amount;

use super::pool::SalesWindow;

/// Strategy for weighting pool participants
pub trait DistributionPolicy: Send + Sync {
    /// Stored on the frozen plan
    fn name(&self) -> &'static str;

    /// Weight of one participant for the cycle's sales window
    fn weight(
        &self,
        conn: &Connection,
        participant: &PoolParticipant,
        window: &SalesWindow,
    ) -> Result<i64, EngineError>;

    /// Split `pool_total` by weight
    fn allocate(&self, pool_total: Amount, weighted: &[(String, i64)]) -> Vec<PoolAllocation> {
        split_by_weight(pool_total, weighted)
    }
}

/// Every participant gets the same share
pub struct EqualSplit;

impl DistributionPolicy for EqualSplit {
    fn name(&self) -> &'static str {
        "equal"
    }

    fn weight(&self, _: &Connection, _: &PoolParticipant, _: &SalesWindow) -> Result<i64, EngineError> {
        Ok(1)
    }
}

/// Shares proportional to the license sales of each participant's level-1
/// referrals inside the window
pub struct ProportionalSplit;

impl DistributionPolicy for ProportionalSplit {
    fn name(&self) -> &'static str {
        "proportional"
    }

    fn weight(
        &self,
        conn: &Connection,
        participant: &PoolParticipant,
        window: &SalesWindow,
    ) -> Result<i64, EngineError> {
        referral_volume(conn, &participant.participant_id, window.from, window.before)
    }

    fn allocate(&self, pool_total: Amount, weighted: &[(String, i64)]) -> Vec<PoolAllocation> {
        // Nobody referred anything: fall back to an equal split
        if weighted.iter().all(|(_, w)| *w <= 0) {
            let equal: Vec<_> = weighted.iter().map(|(id, _)| (id.clone(), 1)).collect();
            return split_by_weight(pool_total, &equal);
        }
        split_by_weight(pool_total, weighted)
    }
}

/// Build the policy selected in configuration
pub fn policy_for(kind: PoolPolicyKind) -> Box<dyn DistributionPolicy> {
    match kind {
        PoolPolicyKind::Equal => Box::new(EqualSplit),
        PoolPolicyKind::Proportional => Box::new(ProportionalSplit),
    }
}

/// Largest-remainder split in integer minor units
pub fn split_by_weight(pool_total: Amount, weighted: &[(String, i64)]) -> Vec<PoolAllocation> {
    let total_weight: i128 = weighted.iter().map(|(_, w)| (*w).max(0) as i128).sum();
    if weighted.is_empty() || total_weight == 0 || pool_total <= 0 {
        return weighted
            .iter()
            .map(|(id, w)| PoolAllocation { participant_id: id.clone(), amount: 0, weight: *w })
            .collect();
    }

    let mut allocations = Vec::with_capacity(weighted.len());
    let mut fractions = Vec::with_capacity(weighted.len());
    let mut distributed: Amount = 0;

    for (idx, (id, w)) in weighted.iter().enumerate() {
        let scaled = pool_total as i128 * (*w).max(0) as i128;
        let base = (scaled / total_weight) as Amount;
        fractions.push((scaled % total_weight, idx));
        distributed += base;
        allocations.push(PoolAllocation { participant_id: id.clone(), amount: base, weight: *w });
    }

    // Largest fraction first, then participant ID for determinism
    fractions.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| allocations[a.1].participant_id.cmp(&allocations[b.1].participant_id))
    });

    let mut leftover = pool_total - distributed;
    for (_, idx) in fractions {
        if leftover == 0 {
            break;
        }
        allocations[idx].amount += 1;
        leftover -= 1;
    }

    allocations
}
