//! Token Store - issued UIB tokens and their one-way lifecycle
//!
//! Status moves Available -> Reserved -> Consumed and never back. `reserve`
//! is all-or-nothing over a set: either every token in the set was available
//! and is now reserved, or nothing changed.

use std::collections::{BTreeMap, HashSet};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::models::{current_timestamp, Category, Token, TokenStatus};
use super::{placeholders, sequences};
use crate::error::LedgerError;

/// Result of a set reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved(usize),
    /// At least one token was no longer available; nothing was changed
    Conflict { unavailable: Vec<String> },
}

/// Token counts of one category by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub available: u64,
    pub reserved: u64,
    pub consumed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.available + self.reserved + self.consumed
    }

    fn add(&mut self, status: TokenStatus, n: u64) {
        match status {
            TokenStatus::Available => self.available += n,
            TokenStatus::Reserved => self.reserved += n,
            TokenStatus::Consumed => self.consumed += n,
        }
    }
}

// ============================================================================
// Read Operations
// ============================================================================

pub fn get_token(conn: &Connection, id: &str) -> Result<Option<Token>, LedgerError> {
    Ok(conn
        .query_row("SELECT * FROM tokens WHERE id = ?", params![id], Token::from_row)
        .optional()?)
}

/// Tokens of one category, in sequence order
pub fn list_tokens(
    conn: &Connection,
    category: Category,
    status: Option<TokenStatus>,
    limit: i64,
) -> Result<Vec<Token>, LedgerError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM tokens
        WHERE category = ?1 AND (?2 IS NULL OR status = ?2)
        ORDER BY sequence_number ASC
        LIMIT ?3
        "#,
    )?;
    let rows = stmt
        .query_map(params![category, status, limit], Token::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn tokens_for_certificate(conn: &Connection, certificate_id: &str) -> Result<Vec<Token>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM tokens WHERE certificate_id = ? ORDER BY category, sequence_number",
    )?;
    let rows = stmt
        .query_map(params![certificate_id], Token::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// `query(category, status) -> count`
pub fn count(conn: &Connection, category: Category, status: TokenStatus) -> Result<u64, LedgerError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tokens WHERE category = ? AND status = ?",
        params![category, status],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

/// Counts for every category (categories without tokens report zeros)
pub fn counts_by_category(conn: &Connection) -> Result<BTreeMap<Category, StatusCounts>, LedgerError> {
    let mut counts: BTreeMap<Category, StatusCounts> =
        Category::ALL.iter().map(|c| (*c, StatusCounts::default())).collect();

    let mut stmt = conn.prepare("SELECT category, status, COUNT(*) FROM tokens GROUP BY category, status")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, Category>(0)?,
            row.get::<_, TokenStatus>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    for row in rows {
        let (category, status, n) = row?;
        counts.entry(category).or_default().add(status, n as u64);
    }

    Ok(counts)
}

/// Oldest available tokens of a category (FIFO by sequence number)
pub fn select_available(conn: &Connection, category: Category, limit: u32) -> Result<Vec<String>, LedgerError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id FROM tokens
        WHERE category = ? AND status = 'available'
        ORDER BY sequence_number ASC
        LIMIT ?
        "#,
    )?;
    let ids = stmt
        .query_map(params![category, limit], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn statuses_of(conn: &Connection, ids: &[String]) -> Result<BTreeMap<String, TokenStatus>, LedgerError> {
    let sql = format!(
        "SELECT id, status FROM tokens WHERE id IN ({})",
        placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(ids.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, TokenStatus>(1)?))
        })?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}

fn ensure_distinct(ids: &[String]) -> Result<(), LedgerError> {
    let mut seen = HashSet::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(id.as_str()) {
            return Err(LedgerError::Invariant(format!("Token {} listed twice in one set", id)));
        }
    }
    Ok(())
}

// ============================================================================
// Write Operations
// ============================================================================

/// Mint one Available token per origin list, numbered after the category's
/// last sequence number. Runs inside the accrual transaction.
pub fn insert_tokens(
    conn: &Connection,
    category: Category,
    origin_lists: &[Vec<String>],
    run_id: &str,
) -> Result<Vec<Token>, LedgerError> {
    if origin_lists.is_empty() {
        return Ok(Vec::new());
    }

    let first = sequences::advance(
        conn,
        &sequences::token_sequence_name(category),
        origin_lists.len() as i64,
    )?;
    let issued_at = current_timestamp();

    let mut stmt = conn.prepare(
        r#"
        INSERT INTO tokens (id, category, sequence_number, origin_ids, status, run_id, issued_at)
        VALUES (?, ?, ?, ?, 'available', ?, ?)
        "#,
    )?;

    let mut minted = Vec::with_capacity(origin_lists.len());
    for (offset, origins) in origin_lists.iter().enumerate() {
        let token = Token {
            id: Uuid::new_v4().to_string(),
            category,
            sequence_number: first + offset as i64,
            origin_ids: origins.clone(),
            status: TokenStatus::Available,
            run_id: run_id.to_string(),
            issued_at: issued_at.clone(),
            reserved_at: None,
            certificate_id: None,
            project_id: None,
            assigned_at: None,
        };
        stmt.execute(params![
            token.id,
            token.category,
            token.sequence_number,
            serde_json::to_string(&token.origin_ids)?,
            token.run_id,
            token.issued_at,
        ])?;
        minted.push(token);
    }

    debug!(category = %category, count = minted.len(), first_sequence = first, "Tokens minted");
    Ok(minted)
}

/// Available -> Reserved for the whole set, or for none of it.
pub fn reserve(conn: &Connection, ids: &[String]) -> Result<ReserveOutcome, LedgerError> {
    if ids.is_empty() {
        return Ok(ReserveOutcome::Reserved(0));
    }
    ensure_distinct(ids)?;

    let statuses = statuses_of(conn, ids)?;
    let unavailable: Vec<String> = ids
        .iter()
        .filter(|id| statuses.get(*id) != Some(&TokenStatus::Available))
        .cloned()
        .collect();
    if !unavailable.is_empty() {
        debug!(requested = ids.len(), unavailable = unavailable.len(), "Reservation conflict");
        return Ok(ReserveOutcome::Conflict { unavailable });
    }

    let sql = format!(
        "UPDATE tokens SET status = 'reserved', reserved_at = ? WHERE status = 'available' AND id IN ({})",
        placeholders(ids.len())
    );
    let now = current_timestamp();
    let mut values: Vec<&dyn rusqlite::ToSql> = vec![&now];
    values.extend(ids.iter().map(|id| id as &dyn rusqlite::ToSql));

    let updated = conn.execute(&sql, params_from_iter(values))?;
    if updated != ids.len() {
        // Only reachable outside a write transaction; the caller's rollback undoes it
        return Err(LedgerError::Conflict(format!(
            "Reserved {} of {} tokens",
            updated,
            ids.len()
        )));
    }

    Ok(ReserveOutcome::Reserved(updated))
}

/// Reserved -> Consumed. Any token not currently Reserved is an error and
/// nothing is written.
pub fn consume(
    conn: &Connection,
    ids: &[String],
    certificate_id: Option<&str>,
    project_id: Option<&str>,
) -> Result<usize, LedgerError> {
    if ids.is_empty() {
        return Ok(0);
    }
    ensure_distinct(ids)?;

    let statuses = statuses_of(conn, ids)?;
    for id in ids {
        match statuses.get(id) {
            Some(TokenStatus::Reserved) => {}
            Some(other) => {
                return Err(LedgerError::InvalidTransition {
                    id: id.clone(),
                    from: other.to_string(),
                    to: TokenStatus::Consumed.to_string(),
                })
            }
            None => return Err(LedgerError::NotFound(format!("token {}", id))),
        }
    }

    let sql = format!(
        "UPDATE tokens SET status = 'consumed', certificate_id = ?, project_id = ?, assigned_at = ? \
         WHERE status = 'reserved' AND id IN ({})",
        placeholders(ids.len())
    );
    let now = current_timestamp();
    let mut values: Vec<&dyn rusqlite::ToSql> = vec![&certificate_id, &project_id, &now];
    values.extend(ids.iter().map(|id| id as &dyn rusqlite::ToSql));

    let updated = conn.execute(&sql, params_from_iter(values))?;
    if updated != ids.len() {
        return Err(LedgerError::Conflict(format!(
            "Consumed {} of {} tokens",
            updated,
            ids.len()
        )));
    }

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    fn setup_with_tokens(category: Category, n: usize) -> (Connection, Vec<Token>) {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let origins: Vec<Vec<String>> = (0..n).map(|i| vec![format!("m{}", i)]).collect();
        let tokens = insert_tokens(&conn, category, &origins, "run-1").unwrap();
        (conn, tokens)
    }

    fn ids(tokens: &[Token]) -> Vec<String> {
        tokens.iter().map(|t| t.id.clone()).collect()
    }

    #[test]
    fn test_sequence_numbers_continue_across_runs() {
        let (conn, first) = setup_with_tokens(Category::Residue, 2);
        assert_eq!(first[0].sequence_number, 1);
        assert_eq!(first[1].sequence_number, 2);

        let more = insert_tokens(&conn, Category::Residue, &[vec![]], "run-2").unwrap();
        assert_eq!(more[0].sequence_number, 3);

        let other = insert_tokens(&conn, Category::Education, &[vec![]], "run-2").unwrap();
        assert_eq!(other[0].sequence_number, 1);
    }

    #[test]
    fn test_reserve_is_all_or_nothing() {
        let (conn, tokens) = setup_with_tokens(Category::Residue, 3);
        let all = ids(&tokens);

        assert_eq!(reserve(&conn, &all[..1]).unwrap(), ReserveOutcome::Reserved(1));

        // Overlapping set: token 0 is taken, so 1 and 2 must stay available
        let outcome = reserve(&conn, &all).unwrap();
        assert_eq!(
            outcome,
            ReserveOutcome::Conflict { unavailable: vec![all[0].clone()] }
        );
        assert_eq!(count(&conn, Category::Residue, TokenStatus::Available).unwrap(), 2);
        assert_eq!(count(&conn, Category::Residue, TokenStatus::Reserved).unwrap(), 1);
    }

    #[test]
    fn test_reserve_rejects_duplicate_ids() {
        let (conn, tokens) = setup_with_tokens(Category::Residue, 1);
        let id = tokens[0].id.clone();
        assert!(matches!(
            reserve(&conn, &[id.clone(), id]),
            Err(LedgerError::Invariant(_))
        ));
    }

    #[test]
    fn test_consume_requires_reserved() {
        let (conn, tokens) = setup_with_tokens(Category::Product, 2);
        let all = ids(&tokens);

        let err = consume(&conn, &all, None, None).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        assert_eq!(count(&conn, Category::Product, TokenStatus::Available).unwrap(), 2);

        reserve(&conn, &all).unwrap();
        assert_eq!(consume(&conn, &all, None, Some("project-1")).unwrap(), 2);

        // No way back and no second consumption
        assert!(consume(&conn, &all, None, None).is_err());
        assert_eq!(
            reserve(&conn, &all).unwrap(),
            ReserveOutcome::Conflict { unavailable: all.clone() }
        );

        let stored = get_token(&conn, &all[0]).unwrap().unwrap();
        assert_eq!(stored.status, TokenStatus::Consumed);
        assert_eq!(stored.project_id.as_deref(), Some("project-1"));
        assert!(stored.assigned_at.is_some());
    }

    #[test]
    fn test_select_available_is_fifo() {
        let (conn, tokens) = setup_with_tokens(Category::Residue, 4);
        let all = ids(&tokens);
        reserve(&conn, &all[..1]).unwrap();

        let picked = select_available(&conn, Category::Residue, 2).unwrap();
        assert_eq!(picked, vec![all[1].clone(), all[2].clone()]);

        let counts = counts_by_category(&conn).unwrap();
        assert_eq!(counts[&Category::Residue].available, 3);
        assert_eq!(counts[&Category::Residue].reserved, 1);
        assert_eq!(counts[&Category::Education].total(), 0);

        let listed = list_tokens(&conn, Category::Residue, Some(TokenStatus::Available), 10).unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].origin_ids, vec!["m1".to_string()]);
    }
}
