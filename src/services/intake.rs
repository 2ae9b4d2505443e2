//! Measurement intake - the producer side of the impact ledger

use std::sync::Arc;

use crate::db::measurements::{self, BulkResult, PendingSummary, RecordMeasurementInput, RecordOutcome};
use crate::db::{ImpactMeasurement, LedgerDb};
use crate::error::LedgerError;

use super::events::{EventBus, LedgerEvent};

pub struct IntakeService {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
}

impl IntakeService {
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    pub fn get(&self, id: &str) -> Result<Option<ImpactMeasurement>, LedgerError> {
        self.db.with_conn(|conn| measurements::get_measurement(conn, id))
    }

    /// Record one measurement; a repeated source reference returns the
    /// existing row as `Duplicate`.
    pub fn record(&self, input: RecordMeasurementInput) -> Result<RecordOutcome, LedgerError> {
        let outcome = self
            .db
            .with_tx(|tx| measurements::record_measurement(tx, input))?;

        if let RecordOutcome::Inserted(ref m) = outcome {
            self.events.emit(LedgerEvent::MeasurementRecorded {
                id: m.id.clone(),
                category: m.category,
                raw_value: m.raw_value.clone(),
            });
        }

        Ok(outcome)
    }

    /// Import many measurements in one transaction
    pub fn bulk_record(&self, inputs: Vec<RecordMeasurementInput>) -> Result<BulkResult, LedgerError> {
        let result = self.db.with_tx(|tx| measurements::bulk_record(tx, inputs))?;

        if result.inserted > 0 || result.skipped > 0 {
            self.events.emit(LedgerEvent::MeasurementsBulkRecorded {
                inserted: result.inserted as usize,
                skipped: result.skipped as usize,
            });
        }

        Ok(result)
    }

    pub fn pending_summary(&self) -> Result<Vec<PendingSummary>, LedgerError> {
        self.db.with_conn(measurements::pending_summary)
    }

    /// Measurements consumed by one accrual unit
    pub fn consumed_by_run(&self, run_id: &str) -> Result<Vec<ImpactMeasurement>, LedgerError> {
        self.db.with_conn(|conn| measurements::list_by_run(conn, run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Category;

    fn input(source_ref: &str, value: &str) -> RecordMeasurementInput {
        RecordMeasurementInput {
            id: None,
            category: Category::Residue,
            raw_value: value.to_string(),
            recorded_at: None,
            source_kind: "delivery".to_string(),
            source_ref: Some(source_ref.to_string()),
            subject_id: Some("user-1".to_string()),
            note: None,
        }
    }

    #[tokio::test]
    async fn test_record_emits_once_per_insert() {
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();
        let intake = IntakeService::new(Arc::new(LedgerDb::open_in_memory().unwrap()), events);

        assert!(matches!(intake.record(input("d-1", "2.5")).unwrap(), RecordOutcome::Inserted(_)));
        assert!(matches!(intake.record(input("d-1", "2.5")).unwrap(), RecordOutcome::Duplicate(_)));

        match rx.try_recv().unwrap() {
            LedgerEvent::MeasurementRecorded { category, raw_value, .. } => {
                assert_eq!(category, Category::Residue);
                assert_eq!(raw_value, "2.5");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_bulk_record_collects_failures() {
        let intake = IntakeService::new(
            Arc::new(LedgerDb::open_in_memory().unwrap()),
            Arc::new(EventBus::new()),
        );
        let result = intake
            .bulk_record(vec![input("a", "1"), input("b", "-3"), input("a", "1")])
            .unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.errors.len(), 1);

        let pending = intake.pending_summary().unwrap();
        let residue = pending.iter().find(|p| p.category == Category::Residue).unwrap();
        assert_eq!(residue.count, 1);
    }
}
