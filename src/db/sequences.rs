//! Monotonic counters stored as rows, advanced inside the caller's transaction

use rusqlite::{params, Connection, OptionalExtension};

use super::models::Category;
use crate::error::LedgerError;

pub const CERTIFICATE_SEQUENCE: &str = "certificate";

pub fn token_sequence_name(category: Category) -> String {
    format!("token:{}", category)
}

/// Last value handed out for `name` (0 if never advanced)
pub fn current(conn: &Connection, name: &str) -> Result<i64, LedgerError> {
    let value: Option<i64> = conn
        .query_row(
            "SELECT last_value FROM sequences WHERE name = ?",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.unwrap_or(0))
}

/// Reserve `count` consecutive values and return the first one.
///
/// Must run inside the transaction that uses the values, so a rollback also
/// returns them.
pub fn advance(conn: &Connection, name: &str, count: i64) -> Result<i64, LedgerError> {
    if count <= 0 {
        return Err(LedgerError::InvalidInput(format!(
            "Sequence {} must advance by a positive count, got {}",
            name, count
        )));
    }

    conn.execute(
        r#"
        INSERT INTO sequences (name, last_value) VALUES (?1, ?2)
        ON CONFLICT(name) DO UPDATE SET last_value = last_value + ?2
        "#,
        params![name, count],
    )?;

    let last = current(conn, name)?;
    Ok(last - count + 1)
}
