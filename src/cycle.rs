//! License cycle state machine
//!
//! A license pays on 8 consecutive active days, rests for 1 pause day, then
//! starts the next cycle. The stored counters on a purchase are a cache: the
//! authoritative position is derived from the number of completed earnings
//! entries in the ledger (see [`CycleState::derive`]).
//!
//! ```text
//! day:   1  2  3  4  5  6  7  8  9 | 1  2 ...
//!        pay pay ...          pay  pause | pay ...
//!                              └─ first cycle completed (once)
//!                                     └─ cycles_completed += 1
//! ```

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Payout days per cycle
pub const ACTIVE_DAYS: u8 = 8;

/// The rest day closing each cycle
pub const PAUSE_DAY: u8 = 9;

/// Position of a purchase within its benefit schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleState {
    /// 0 = not started, 1..=8 active, 9 pause
    pub current_day: u8,
    pub cycles_completed: u32,
    pub first_cycle_completed: bool,
}

/// What the next advance of a purchase does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Pay an active day. `period_key` is the lifetime active-day index
    /// (1-based), unique per purchase.
    Payout { day: u8, period_key: u32 },
    /// Rest day, no payout
    Pause,
}

/// Result of applying one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub step: Step,
    pub next: CycleState,
    /// Day 8 -> 9 of the very first cycle
    pub first_cycle_completed_now: bool,
    /// Pause day consumed, `cycles_completed` incremented
    pub cycle_rolled: bool,
    /// `cycles_completed` reached the package maximum
    pub cap_reached: bool,
}

impl CycleState {
    /// State of a freshly activated purchase
    pub fn start() -> Self {
        Self {
            current_day: 1,
            cycles_completed: 0,
            first_cycle_completed: false,
        }
    }

    pub fn is_pause_day(&self) -> bool {
        self.current_day == PAUSE_DAY
    }

    pub fn is_capped(&self, max_cycles: u32) -> bool {
        self.cycles_completed >= max_cycles
    }

    /// Lifetime active-day index of the current day
    pub fn period_key(&self) -> u32 {
        self.cycles_completed * ACTIVE_DAYS as u32 + self.current_day as u32
    }

    /// Decide the step for the current day
    pub fn next_step(&self) -> Result<Step, EngineError> {
        match self.current_day {
            1..=ACTIVE_DAYS => Ok(Step::Payout {
                day: self.current_day,
                period_key: self.period_key(),
            }),
            PAUSE_DAY => Ok(Step::Pause),
            other => Err(EngineError::InvariantViolation(format!(
                "cycle day {} is outside 1..={}",
                other, PAUSE_DAY
            ))),
        }
    }

    /// Apply one day
    pub fn advance(&self, max_cycles: u32) -> Result<Transition, EngineError> {
        if self.is_capped(max_cycles) {
            return Err(EngineError::InvariantViolation(format!(
                "advance past cap: {} of {} cycles completed",
                self.cycles_completed, max_cycles
            )));
        }

        let step = self.next_step()?;
        let mut next = *self;
        let mut first_cycle_completed_now = false;
        let mut cycle_rolled = false;

        match step {
            Step::Payout { day, .. } => {
                next.current_day = day + 1;
                if next.current_day == PAUSE_DAY && !self.first_cycle_completed {
                    next.first_cycle_completed = true;
                    first_cycle_completed_now = true;
                }
            }
            Step::Pause => {
                next.current_day = 1;
                next.cycles_completed += 1;
                cycle_rolled = true;
            }
        }

        Ok(Transition {
            step,
            next,
            first_cycle_completed_now,
            cycle_rolled,
            cap_reached: next.is_capped(max_cycles),
        })
    }

    /// Rebuild the state from the ledger.
    ///
    /// `completed_earnings` is the count of completed earnings entries for
    /// the purchase. The pause day leaves no ledger trace, so after a whole
    /// number of cycles the stored `cycles_completed` decides whether the
    /// pause was already consumed.
    pub fn derive(
        completed_earnings: u32,
        stored_cycles_completed: u32,
        max_cycles: u32,
    ) -> Result<Self, EngineError> {
        let per_cycle = ACTIVE_DAYS as u32;
        if completed_earnings > max_cycles * per_cycle {
            return Err(EngineError::InvariantViolation(format!(
                "{} earnings entries exceed lifetime cap of {}",
                completed_earnings,
                max_cycles * per_cycle
            )));
        }

        let full = completed_earnings / per_cycle;
        let rem = completed_earnings % per_cycle;

        let (current_day, cycles_completed) = if completed_earnings == 0 || rem != 0 {
            (rem as u8 + 1, full)
        } else if stored_cycles_completed >= full {
            (1, full)
        } else {
            (PAUSE_DAY, full - 1)
        };

        Ok(Self {
            current_day,
            cycles_completed,
            first_cycle_completed: completed_earnings >= per_cycle,
        })
    }
}
