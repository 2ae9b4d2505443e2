//! Investor quotas waiting for a certificate

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use super::models::{current_timestamp, Quota, QuotaStatus};
use crate::error::LedgerError;

pub fn get_quota(conn: &Connection, id: &str) -> Result<Option<Quota>, LedgerError> {
    Ok(conn
        .query_row("SELECT * FROM quotas WHERE id = ?", params![id], Quota::from_row)
        .optional()?)
}

/// Quotas, oldest first, optionally filtered by status
pub fn list_quotas(conn: &Connection, status: Option<QuotaStatus>) -> Result<Vec<Quota>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM quotas WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt
        .query_map(params![status], Quota::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn register_quota(
    conn: &Connection,
    project_id: &str,
    investor_ref: Option<&str>,
) -> Result<Quota, LedgerError> {
    let project_id = project_id.trim();
    if project_id.is_empty() {
        return Err(LedgerError::InvalidInput("project_id is required".into()));
    }

    let quota = Quota {
        id: Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        investor_ref: investor_ref.map(str::to_string),
        status: QuotaStatus::AwaitingCertificate,
        certificate_id: None,
        created_at: current_timestamp(),
        fulfilled_at: None,
    };

    conn.execute(
        r#"
        INSERT INTO quotas (id, project_id, investor_ref, status, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
        params![
            quota.id,
            quota.project_id,
            quota.investor_ref,
            quota.status,
            quota.created_at,
        ],
    )?;

    debug!(quota_id = %quota.id, project_id = %quota.project_id, "Quota registered");
    Ok(quota)
}

/// Mark a quota fulfilled by `certificate_id`. Only an awaiting quota moves.
pub fn fulfill(conn: &Connection, id: &str, certificate_id: &str) -> Result<(), LedgerError> {
    let updated = conn.execute(
        r#"
        UPDATE quotas SET status = 'fulfilled', certificate_id = ?, fulfilled_at = ?
        WHERE id = ? AND status = 'awaiting_certificate'
        "#,
        params![certificate_id, current_timestamp(), id],
    )?;

    if updated == 1 {
        return Ok(());
    }

    match get_quota(conn, id)? {
        None => Err(LedgerError::NotFound(format!("quota {}", id))),
        Some(quota) => Err(LedgerError::InvalidTransition {
            id: id.to_string(),
            from: quota.status.to_string(),
            to: QuotaStatus::Fulfilled.to_string(),
        }),
    }
}
