//! Impact Ledger - append-only raw impact measurements
//!
//! Producers append rows; the accrual engine claims unconsumed rows and flips
//! `consumed` exactly once. Rows are never deleted.

use std::collections::BTreeMap;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::models::{
    current_timestamp, normalize_timestamp, parse_decimal, Category, ImpactMeasurement,
};
use super::placeholders;
use crate::error::LedgerError;

// ============================================================================
// Input Types
// ============================================================================

/// Input for recording a measurement
#[derive(Debug, Clone, Deserialize)]
pub struct RecordMeasurementInput {
    #[serde(default)]
    pub id: Option<String>,
    pub category: Category,
    /// Decimal text, e.g. "0.35"
    pub raw_value: String,
    /// RFC 3339; defaults to now
    #[serde(default)]
    pub recorded_at: Option<String>,
    #[serde(default = "default_source_kind")]
    pub source_kind: String,
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

fn default_source_kind() -> String {
    "manual".to_string()
}

/// Result of a bulk import
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkResult {
    pub inserted: u64,
    pub skipped: u64,
    pub errors: Vec<String>,
}

/// Pending (unconsumed) measurements of one category
#[derive(Debug, Clone, Serialize)]
pub struct PendingSummary {
    pub category: Category,
    pub count: u64,
    /// Sum over the well-formed rows only
    pub raw_total: Decimal,
    pub malformed: u64,
}

/// Outcome of recording one measurement
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Inserted(ImpactMeasurement),
    /// Same (category, source_kind, source_ref) already recorded
    Duplicate(ImpactMeasurement),
}

// ============================================================================
// Read Operations
// ============================================================================

pub fn get_measurement(conn: &Connection, id: &str) -> Result<Option<ImpactMeasurement>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT * FROM impact_measurements WHERE id = ?",
            params![id],
            ImpactMeasurement::from_row,
        )
        .optional()?)
}

fn find_by_source(
    conn: &Connection,
    category: Category,
    source_kind: &str,
    source_ref: &str,
) -> Result<Option<ImpactMeasurement>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT * FROM impact_measurements WHERE category = ? AND source_kind = ? AND source_ref = ?",
            params![category, source_kind, source_ref],
            ImpactMeasurement::from_row,
        )
        .optional()?)
}

/// Unconsumed rows of one category, oldest first, id as tie-break.
///
/// Inside an IMMEDIATE transaction this is the claim: no other writer can
/// consume these rows until the transaction ends.
pub fn claim_pending(conn: &Connection, category: Category) -> Result<Vec<ImpactMeasurement>, LedgerError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM impact_measurements
        WHERE category = ? AND consumed = 0
        ORDER BY recorded_at ASC, id ASC
        "#,
    )?;

    let rows = stmt
        .query_map(params![category], ImpactMeasurement::from_row)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LedgerError::Internal(format!("Row parse failed: {}", e)))?;

    Ok(rows)
}

pub fn pending_summary(conn: &Connection) -> Result<Vec<PendingSummary>, LedgerError> {
    let mut summaries = Vec::with_capacity(Category::ALL.len());
    for category in Category::ALL {
        let pending = claim_pending(conn, category)?;
        let mut raw_total = Decimal::ZERO;
        let mut malformed = 0u64;
        for m in &pending {
            match m.value() {
                Ok(v) => {
                    raw_total = raw_total.checked_add(v).ok_or_else(|| {
                        LedgerError::Invariant(format!("Decimal overflow summing pending {}", category))
                    })?;
                }
                Err(_) => malformed += 1,
            }
        }
        summaries.push(PendingSummary {
            category,
            count: pending.len() as u64,
            raw_total,
            malformed,
        });
    }
    Ok(summaries)
}

/// Measurements consumed by one accrual unit, in claim order
pub fn list_by_run(conn: &Connection, run_id: &str) -> Result<Vec<ImpactMeasurement>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM impact_measurements WHERE consumed_run_id = ? ORDER BY recorded_at ASC, id ASC",
    )?;
    let rows = stmt
        .query_map(params![run_id], ImpactMeasurement::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Consumed count per category
pub fn consumed_counts(conn: &Connection) -> Result<BTreeMap<Category, u64>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT category, COUNT(*) FROM impact_measurements WHERE consumed = 1 GROUP BY category",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, Category>(0)?, row.get::<_, i64>(1)? as u64)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}

// ============================================================================
// Write Operations
// ============================================================================

/// Append one measurement. Duplicate source references are not re-inserted.
pub fn record_measurement(
    conn: &Connection,
    input: RecordMeasurementInput,
) -> Result<RecordOutcome, LedgerError> {
    let value = parse_decimal(&input.raw_value).map_err(LedgerError::InvalidInput)?;
    if value < Decimal::ZERO {
        return Err(LedgerError::InvalidInput(format!(
            "Raw value must not be negative, got {}",
            value
        )));
    }
    if input.source_kind.trim().is_empty() {
        return Err(LedgerError::InvalidInput("source_kind must not be empty".into()));
    }

    if let Some(ref source_ref) = input.source_ref {
        if let Some(existing) = find_by_source(conn, input.category, &input.source_kind, source_ref)? {
            debug!(id = %existing.id, source_ref = %source_ref, "Measurement already recorded");
            return Ok(RecordOutcome::Duplicate(existing));
        }
    }

    let id = input.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let recorded_at = match input.recorded_at.as_deref() {
        Some(raw) => normalize_timestamp(raw)?,
        None => current_timestamp(),
    };

    conn.execute(
        r#"
        INSERT INTO impact_measurements (
            id, category, raw_value, recorded_at,
            source_kind, source_ref, subject_id, note, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            id,
            input.category,
            value.normalize().to_string(),
            recorded_at,
            input.source_kind,
            input.source_ref,
            input.subject_id,
            input.note,
            current_timestamp(),
        ],
    )
    .map_err(|e| LedgerError::Internal(format!("Insert failed: {}", e)))?;

    let created = get_measurement(conn, &id)?
        .ok_or_else(|| LedgerError::Internal("Measurement not found after insert".into()))?;
    Ok(RecordOutcome::Inserted(created))
}

/// Bulk record measurements (historical imports). Per-item failures are
/// collected; the valid items still land.
pub fn bulk_record(
    conn: &Connection,
    inputs: Vec<RecordMeasurementInput>,
) -> Result<BulkResult, LedgerError> {
    let mut result = BulkResult::default();

    for input in inputs {
        let label = input
            .source_ref
            .clone()
            .or_else(|| input.id.clone())
            .unwrap_or_else(|| input.category.to_string());

        match record_measurement(conn, input) {
            Ok(RecordOutcome::Inserted(_)) => result.inserted += 1,
            Ok(RecordOutcome::Duplicate(_)) => result.skipped += 1,
            Err(e) => result.errors.push(format!("{}: {}", label, e)),
        }
    }

    Ok(result)
}

/// Flip `consumed` on exactly the given ids.
///
/// Fails if any id is unknown or already consumed, which inside the
/// accrual transaction rolls back the whole category unit.
pub fn mark_consumed(conn: &Connection, ids: &[String], run_id: &str) -> Result<usize, LedgerError> {
    if ids.is_empty() {
        return Ok(0);
    }

    let now = current_timestamp();
    let sql = format!(
        "UPDATE impact_measurements SET consumed = 1, consumed_run_id = ?, consumed_at = ? \
         WHERE consumed = 0 AND id IN ({})",
        placeholders(ids.len())
    );

    let mut values: Vec<&dyn rusqlite::ToSql> = vec![&run_id, &now];
    values.extend(ids.iter().map(|id| id as &dyn rusqlite::ToSql));

    let updated = conn.execute(&sql, params_from_iter(values))?;
    if updated != ids.len() {
        return Err(LedgerError::Conflict(format!(
            "Expected to consume {} measurements, {} were still pending",
            ids.len(),
            updated
        )));
    }

    Ok(updated)
}
