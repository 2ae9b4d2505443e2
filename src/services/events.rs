//! Ledger event bus
//!
//! Services announce every state change here. The logging listener turns the
//! stream into an audit trail; other listeners (dashboards, notifiers) can
//! subscribe without touching the services.

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::db::Category;

/// Events emitted by the ledger services
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    // Intake
    MeasurementRecorded {
        id: String,
        category: Category,
        raw_value: String,
    },
    MeasurementsBulkRecorded {
        inserted: usize,
        skipped: usize,
    },

    // Accrual
    TokensMinted {
        run_id: String,
        category: Category,
        count: u64,
        measurements_consumed: usize,
        remainder: Decimal,
    },
    MeasurementRejected {
        id: String,
        category: Category,
        reason: String,
    },
    AccrualFailed {
        category: Category,
        error: String,
    },

    // Issuance
    QuotaRegistered {
        id: String,
        project_id: String,
    },
    CertificateIssued {
        id: String,
        number: String,
        quota_id: String,
        total_tokens: i64,
    },
    IssueRejected {
        quota_id: String,
        reason: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &LedgerEvent);
}

/// Event bus for broadcasting ledger events
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
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
    pub fn emit(&self, event: LedgerEvent) {
        trace!(event = ?event, "Emitting ledger event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
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

/// Audit trail listener
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &LedgerEvent) {
        match event {
            LedgerEvent::TokensMinted {
                run_id,
                category,
                count,
                measurements_consumed,
                remainder,
            } => {
                debug!(
                    run_id = %run_id,
                    category = %category,
                    tokens = count,
                    measurements = measurements_consumed,
                    remainder = %remainder,
                    "Tokens minted"
                );
            }
            LedgerEvent::MeasurementRejected { id, category, reason } => {
                debug!(id = %id, category = %category, reason = %reason, "Measurement rejected");
            }
            LedgerEvent::AccrualFailed { category, error } => {
                warn!(category = %category, error = %error, "Accrual unit rolled back");
            }
            LedgerEvent::CertificateIssued {
                id,
                number,
                quota_id,
                total_tokens,
            } => {
                debug!(
                    certificate_id = %id,
                    number = %number,
                    quota_id = %quota_id,
                    tokens = total_tokens,
                    "Certificate issued"
                );
            }
            LedgerEvent::IssueRejected { quota_id, reason } => {
                debug!(quota_id = %quota_id, reason = %reason, "Issue rejected");
            }
            _ => {
                trace!(event = ?event, "Ledger event");
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
                    debug!(skipped = n, "Event listener lagged, skipped events");
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

        bus.emit(LedgerEvent::TokensMinted {
            run_id: "run-1".into(),
            category: Category::Residue,
            count: 3,
            measurements_consumed: 5,
            remainder: Decimal::new(4, 1),
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        match event {
            LedgerEvent::TokensMinted { category, count, .. } => {
                assert_eq!(category, Category::Residue);
                assert_eq!(count, 3);
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(LedgerEvent::QuotaRegistered {
            id: "q1".into(),
            project_id: "p1".into(),
        });
    }

    #[tokio::test]
    async fn test_logging_listener_stops_when_bus_dropped() {
        let bus = Arc::new(EventBus::new());
        let handle = spawn_logging_listener(bus.clone());
        bus.emit(LedgerEvent::IssueRejected {
            quota_id: "q1".into(),
            reason: "insufficient_stock".into(),
        });
        drop(bus);

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener did not stop")
            .unwrap();
    }
}
