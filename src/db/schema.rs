//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::LedgerError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new ledger schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Ledger schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, LedgerError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| LedgerError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), LedgerError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(LEDGER_SCHEMA)
        .map_err(|e| LedgerError::Internal(format!("Failed to create ledger tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| LedgerError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), LedgerError> {
    info!(from_version, "No migration steps registered, stamping current version");
    set_schema_version(conn, SCHEMA_VERSION)
}

const LEDGER_SCHEMA: &str = r#"
-- Raw impact measurements (append-only; only `consumed*` columns ever change)
CREATE TABLE IF NOT EXISTS impact_measurements (
    id TEXT PRIMARY KEY NOT NULL,
    category TEXT NOT NULL,
    -- canonical decimal text; validated at accrual time
    raw_value TEXT NOT NULL,
    recorded_at TEXT NOT NULL,

    -- provenance
    source_kind TEXT NOT NULL DEFAULT 'manual',
    source_ref TEXT,
    subject_id TEXT,
    note TEXT,

    consumed INTEGER NOT NULL DEFAULT 0,
    consumed_run_id TEXT,
    consumed_at TEXT,
    created_at TEXT NOT NULL
);

-- Fractional remainder per category, carried between accrual runs
CREATE TABLE IF NOT EXISTS partial_balances (
    category TEXT PRIMARY KEY NOT NULL,
    remainder TEXT NOT NULL DEFAULT '0',
    carried_origin_ids TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL
);

-- Monotonic counters (token sequence per category, certificate sequence)
CREATE TABLE IF NOT EXISTS sequences (
    name TEXT PRIMARY KEY NOT NULL,
    last_value INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS quotas (
    id TEXT PRIMARY KEY NOT NULL,
    project_id TEXT NOT NULL,
    investor_ref TEXT,
    status TEXT NOT NULL DEFAULT 'awaiting_certificate',
    certificate_id TEXT,
    created_at TEXT NOT NULL,
    fulfilled_at TEXT
);

CREATE TABLE IF NOT EXISTS certificates (
    id TEXT PRIMARY KEY NOT NULL,
    sequence_number INTEGER NOT NULL UNIQUE,
    number TEXT NOT NULL UNIQUE,
    validation_hash TEXT NOT NULL UNIQUE,
    quota_id TEXT NOT NULL UNIQUE,
    project_id TEXT NOT NULL,
    -- JSON object: category -> [token id, ...]
    token_ids TEXT NOT NULL,
    total_tokens INTEGER NOT NULL,
    issued_at TEXT NOT NULL,

    FOREIGN KEY (quota_id) REFERENCES quotas(id)
);

CREATE TABLE IF NOT EXISTS tokens (
    id TEXT PRIMARY KEY NOT NULL,
    category TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    -- JSON array of impact_measurements ids
    origin_ids TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'available',
    run_id TEXT NOT NULL,
    issued_at TEXT NOT NULL,
    reserved_at TEXT,
    certificate_id TEXT,
    project_id TEXT,
    assigned_at TEXT,

    UNIQUE (category, sequence_number),
    FOREIGN KEY (certificate_id) REFERENCES certificates(id)
);
"#;

const INDEXES_SCHEMA: &str = r#"
-- Claim order: unconsumed rows of one category, oldest first, id as tie-break
CREATE INDEX IF NOT EXISTS idx_measurements_pending
    ON impact_measurements(category, consumed, recorded_at, id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_measurements_source
    ON impact_measurements(category, source_kind, source_ref)
    WHERE source_ref IS NOT NULL;

-- FIFO selection of available stock
CREATE INDEX IF NOT EXISTS idx_tokens_stock ON tokens(category, status, sequence_number);
CREATE INDEX IF NOT EXISTS idx_tokens_certificate ON tokens(certificate_id);

CREATE INDEX IF NOT EXISTS idx_quotas_status ON quotas(status);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('impact_measurements', 'partial_balances', 'sequences', 'quotas', 'certificates', 'tokens')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);
    }
}
