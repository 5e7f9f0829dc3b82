//! Event system for engine operations
//!
//! Every money movement and state transition is broadcast on the bus after
//! its transaction commits. Used for:
//! - Audit logging
//! - Notification hand-off (email, Telegram) by external listeners

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::money::{format_amount, Amount};

/// Events emitted by the engines
#[derive(Debug, Clone)]
pub enum EngineEvent {
    // Purchase lifecycle
    PurchaseActivated {
        purchase_id: String,
        user_id: String,
        amount: Amount,
    },
    DayPaid {
        purchase_id: String,
        user_id: String,
        period_key: u32,
        amount: Amount,
    },
    PauseDay {
        purchase_id: String,
        cycles_completed: u32,
    },
    FirstCycleCompleted {
        purchase_id: String,
        user_id: String,
    },
    PurchaseCompleted {
        purchase_id: String,
        cycles_completed: u32,
    },
    PurchaseCancelled {
        purchase_id: String,
        reason: Option<String>,
    },

    // Commissions
    CommissionPaid {
        referrer_id: String,
        subtype: String,
        purchase_id: String,
        amount: Amount,
    },

    // Pool
    PoolBonusPaid {
        participant_id: String,
        cycle_number: u32,
        amount: Amount,
    },
    PoolCycleProcessed {
        cycle_number: u32,
        paid: usize,
        skipped: usize,
    },

    // Withdrawals
    WithdrawalRequested {
        entry_id: String,
        user_id: String,
        amount: Amount,
    },
    WithdrawalSettled {
        entry_id: String,
        status: String,
    },

    // Reconciliation
    StateRepaired {
        purchase_id: String,
        from_day: u8,
        to_day: u8,
    },
    InvariantViolated {
        entity: String,
        detail: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

/// Event bus for broadcasting engine events
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: EngineEvent) {
        trace!(event = ?event, "Emitting engine event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::DayPaid { purchase_id, user_id, period_key, amount } => {
                info!(
                    purchase_id = %purchase_id,
                    user_id = %user_id,
                    period_key,
                    amount = %format_amount(*amount),
                    "Daily benefit paid"
                );
            }
            EngineEvent::CommissionPaid { referrer_id, subtype, purchase_id, amount } => {
                info!(
                    referrer_id = %referrer_id,
                    subtype = %subtype,
                    purchase_id = %purchase_id,
                    amount = %format_amount(*amount),
                    "Commission paid"
                );
            }
            EngineEvent::PoolBonusPaid { participant_id, cycle_number, amount } => {
                info!(
                    participant_id = %participant_id,
                    cycle_number,
                    amount = %format_amount(*amount),
                    "Pool bonus paid"
                );
            }
            EngineEvent::FirstCycleCompleted { purchase_id, user_id } => {
                info!(purchase_id = %purchase_id, user_id = %user_id, "First cycle completed");
            }
            EngineEvent::PurchaseCompleted { purchase_id, cycles_completed } => {
                info!(purchase_id = %purchase_id, cycles_completed, "Purchase completed");
            }
            EngineEvent::StateRepaired { purchase_id, from_day, to_day } => {
                warn!(purchase_id = %purchase_id, from_day, to_day, "Purchase state repaired from ledger");
            }
            EngineEvent::InvariantViolated { entity, detail } => {
                error!(entity = %entity, detail = %detail, "Invariant violated");
            }
            _ => {
                debug!(event = ?event, "Engine event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Audit listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(EngineEvent::DayPaid {
            purchase_id: "p1".into(),
            user_id: "alice".into(),
            period_key: 3,
            amount: 1_250,
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        match event {
            EngineEvent::DayPaid { purchase_id, period_key, .. } => {
                assert_eq!(purchase_id, "p1");
                assert_eq!(period_key, 3);
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        // Should not panic even with no subscribers
        bus.emit(EngineEvent::PauseDay {
            purchase_id: "p1".into(),
            cycles_completed: 0,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
