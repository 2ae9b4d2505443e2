//! Balance Tracker - per-category fractional remainder between accrual runs
//!
//! `accumulate` is fixed-point only: the number of whole tokens is the
//! truncated quotient, and whatever is left stays in the remainder. A partial
//! unit is never rounded up into a token.

use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use super::models::{current_timestamp, Category, PartialBalance};
use crate::error::LedgerError;

/// Outcome of adding an amount to a category's remainder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Accumulation {
    pub previous_remainder: Decimal,
    pub amount: Decimal,
    pub total: Decimal,
    pub whole_units: u64,
    pub new_remainder: Decimal,
}

/// Pure conversion: `total = remainder + amount`, `whole = floor(total / rate)`,
/// `new_remainder = total - whole * rate`.
pub fn accumulate(
    remainder: Decimal,
    amount: Decimal,
    rate: Decimal,
) -> Result<Accumulation, LedgerError> {
    if rate <= Decimal::ZERO {
        return Err(LedgerError::Config(format!("Conversion rate must be positive, got {}", rate)));
    }
    if amount < Decimal::ZERO {
        return Err(LedgerError::InvalidInput(format!("Cannot accumulate negative amount {}", amount)));
    }
    if remainder < Decimal::ZERO || remainder >= rate {
        return Err(LedgerError::Invariant(format!(
            "Stored remainder {} outside [0, {})",
            remainder, rate
        )));
    }

    let overflow = || LedgerError::Invariant("Decimal overflow while accumulating".into());

    let total = remainder.checked_add(amount).ok_or_else(overflow)?;
    let mut whole = total.checked_div(rate).ok_or_else(overflow)?.trunc();
    let mut new_remainder = total
        .checked_sub(whole.checked_mul(rate).ok_or_else(overflow)?)
        .ok_or_else(overflow)?;

    // Division is exact to 28 digits; settle any last-digit drift so the
    // remainder lands in [0, rate).
    while new_remainder >= rate {
        whole += Decimal::ONE;
        new_remainder -= rate;
    }
    while new_remainder < Decimal::ZERO {
        whole -= Decimal::ONE;
        new_remainder += rate;
    }

    let whole_units = whole
        .to_u64()
        .ok_or_else(|| LedgerError::Invariant(format!("Token count {} out of range", whole)))?;

    Ok(Accumulation {
        previous_remainder: remainder,
        amount,
        total,
        whole_units,
        new_remainder: new_remainder.normalize(),
    })
}

/// Current balance for a category (the empty balance if it never accrued)
pub fn get_balance(conn: &Connection, category: Category) -> Result<PartialBalance, LedgerError> {
    let row = conn
        .query_row(
            "SELECT * FROM partial_balances WHERE category = ?",
            params![category],
            PartialBalance::from_row,
        )
        .optional()?;
    Ok(row.unwrap_or_else(|| PartialBalance::empty(category)))
}

/// Read, accumulate and persist in one step.
///
/// Callers run this inside the transaction that also writes the tokens the
/// accumulation produced; the stored carried origin ids are left untouched.
pub fn accumulate_in(
    conn: &Connection,
    category: Category,
    amount: Decimal,
    rate: Decimal,
) -> Result<Accumulation, LedgerError> {
    let balance = get_balance(conn, category)?;
    let acc = accumulate(balance.remainder, amount, rate)?;

    conn.execute(
        r#"
        INSERT INTO partial_balances (category, remainder, carried_origin_ids, updated_at)
        VALUES (?1, ?2, '[]', ?3)
        ON CONFLICT(category) DO UPDATE SET remainder = ?2, updated_at = ?3
        "#,
        params![category, acc.new_remainder.to_string(), current_timestamp()],
    )?;

    debug!(
        category = %category,
        previous = %acc.previous_remainder,
        amount = %acc.amount,
        whole_units = acc.whole_units,
        remainder = %acc.new_remainder,
        "Balance accumulated"
    );

    Ok(acc)
}

/// Replace the ids whose value is held in the category's remainder
pub fn set_carried_origins(
    conn: &Connection,
    category: Category,
    origin_ids: &[String],
) -> Result<(), LedgerError> {
    let json = serde_json::to_string(origin_ids)?;
    let updated = conn.execute(
        "UPDATE partial_balances SET carried_origin_ids = ?, updated_at = ? WHERE category = ?",
        params![json, current_timestamp(), category],
    )?;
    if updated != 1 {
        return Err(LedgerError::Invariant(format!(
            "No partial balance row for {} while carrying origins",
            category
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_accumulate_carries_fraction() {
        let acc = accumulate(d("0.4"), d("1.0"), d("1.0")).unwrap();
        assert_eq!(acc.total, d("1.4"));
        assert_eq!(acc.whole_units, 1);
        assert_eq!(acc.new_remainder, d("0.4"));
    }

    #[test]
    fn test_accumulate_truncates_never_rounds_up() {
        let acc = accumulate(Decimal::ZERO, d("2.9999999"), d("1")).unwrap();
        assert_eq!(acc.whole_units, 2);
        assert_eq!(acc.new_remainder, d("0.9999999"));
    }

    #[test]
    fn test_accumulate_non_unit_rate() {
        // 0.3 + 1.0 = 1.3 at 0.25/token -> 5 tokens, 0.05 left
        let acc = accumulate(d("0.2"), d("1.1"), d("0.25")).unwrap();
        assert_eq!(acc.whole_units, 5);
        assert_eq!(acc.new_remainder, d("0.05"));

        let acc = accumulate(Decimal::ZERO, d("0.9"), d("0.3")).unwrap();
        assert_eq!(acc.whole_units, 3);
        assert_eq!(acc.new_remainder, Decimal::ZERO);
    }

    #[test]
    fn test_accumulate_rejects_bad_inputs() {
        assert!(accumulate(Decimal::ZERO, d("1"), Decimal::ZERO).is_err());
        assert!(accumulate(Decimal::ZERO, d("-1"), d("1")).is_err());
        assert!(matches!(
            accumulate(d("1.5"), d("1"), d("1")),
            Err(LedgerError::Invariant(_))
        ));
    }

    #[test]
    fn test_accumulate_in_persists_remainder() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        assert_eq!(get_balance(&conn, Category::Residue).unwrap().remainder, Decimal::ZERO);

        let acc = accumulate_in(&conn, Category::Residue, d("2.7"), d("1")).unwrap();
        assert_eq!(acc.whole_units, 2);
        set_carried_origins(&conn, Category::Residue, &["m9".to_string()]).unwrap();

        let balance = get_balance(&conn, Category::Residue).unwrap();
        assert_eq!(balance.remainder, d("0.7"));
        assert_eq!(balance.carried_origin_ids, vec!["m9".to_string()]);

        // Second accumulation keeps carried ids in place
        let acc = accumulate_in(&conn, Category::Residue, d("0.3"), d("1")).unwrap();
        assert_eq!(acc.whole_units, 1);
        let balance = get_balance(&conn, Category::Residue).unwrap();
        assert_eq!(balance.remainder, Decimal::ZERO);
        assert_eq!(balance.carried_origin_ids, vec!["m9".to_string()]);

        // Other categories untouched
        assert_eq!(get_balance(&conn, Category::Education).unwrap().remainder, Decimal::ZERO);
    }
}
