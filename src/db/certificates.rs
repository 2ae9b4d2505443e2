//! CDV certificates
//!
//! A certificate row is written inside the issuance transaction, before the
//! tokens it references are consumed (tokens carry a foreign key to it).

use std::collections::BTreeMap;

use chrono::Datelike;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use super::models::{current_timestamp, Category, Certificate};
use super::sequences;
use crate::error::LedgerError;

/// Length of the public validation hash
pub const VALIDATION_HASH_LEN: usize = 32;

/// `{prefix}-{year}-{sequence:06}`
pub fn format_number(prefix: &str, year: i32, sequence: i64) -> String {
    format!("{}-{}-{:06}", prefix, year, sequence)
}

/// Uppercase hex validation hash over a random nonce, the certificate number
/// and its token ids.
pub fn compute_validation_hash(nonce: &str, number: &str, token_ids: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce.as_bytes());
    hasher.update(number.as_bytes());
    for id in token_ids {
        hasher.update(b"|");
        hasher.update(id.as_bytes());
    }
    let mut hash = hex::encode_upper(hasher.finalize());
    hash.truncate(VALIDATION_HASH_LEN);
    hash
}

/// Write a certificate for `quota_id` backed by `tokens_by_category`.
/// Allocates the next certificate sequence number.
pub fn insert_certificate(
    conn: &Connection,
    prefix: &str,
    quota_id: &str,
    project_id: &str,
    tokens_by_category: BTreeMap<Category, Vec<String>>,
) -> Result<Certificate, LedgerError> {
    let total_tokens: usize = tokens_by_category.values().map(Vec::len).sum();
    if total_tokens == 0 {
        return Err(LedgerError::Invariant("Certificate without tokens".into()));
    }

    let sequence_number = sequences::advance(conn, sequences::CERTIFICATE_SEQUENCE, 1)?;
    let number = format_number(prefix, chrono::Utc::now().year(), sequence_number);

    let mut certificate = Certificate {
        id: Uuid::new_v4().to_string(),
        sequence_number,
        number,
        validation_hash: String::new(),
        quota_id: quota_id.to_string(),
        project_id: project_id.to_string(),
        tokens_by_category,
        total_tokens: total_tokens as i64,
        issued_at: current_timestamp(),
    };
    certificate.validation_hash = compute_validation_hash(
        &Uuid::new_v4().to_string(),
        &certificate.number,
        &certificate.token_ids(),
    );

    conn.execute(
        r#"
        INSERT INTO certificates (
            id, sequence_number, number, validation_hash, quota_id, project_id,
            token_ids, total_tokens, issued_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            certificate.id,
            certificate.sequence_number,
            certificate.number,
            certificate.validation_hash,
            certificate.quota_id,
            certificate.project_id,
            serde_json::to_string(&certificate.tokens_by_category)?,
            certificate.total_tokens,
            certificate.issued_at,
        ],
    )?;

    debug!(
        certificate_id = %certificate.id,
        number = %certificate.number,
        total_tokens,
        "Certificate written"
    );
    Ok(certificate)
}

pub fn get_certificate(conn: &Connection, id: &str) -> Result<Option<Certificate>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT * FROM certificates WHERE id = ?",
            params![id],
            Certificate::from_row,
        )
        .optional()?)
}

/// Public lookup; the hash is matched case-insensitively
pub fn find_by_validation_hash(conn: &Connection, hash: &str) -> Result<Option<Certificate>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT * FROM certificates WHERE validation_hash = ?",
            params![hash.trim().to_ascii_uppercase()],
            Certificate::from_row,
        )
        .optional()?)
}

pub fn certificate_for_quota(conn: &Connection, quota_id: &str) -> Result<Option<Certificate>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT * FROM certificates WHERE quota_id = ?",
            params![quota_id],
            Certificate::from_row,
        )
        .optional()?)
}

/// Most recent certificates first
pub fn list_certificates(conn: &Connection, limit: i64) -> Result<Vec<Certificate>, LedgerError> {
    let mut stmt =
        conn.prepare("SELECT * FROM certificates ORDER BY sequence_number DESC LIMIT ?")?;
    let rows = stmt
        .query_map(params![limit], Certificate::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
