//! Row types and enums for the ledger tables
//!
//! Values that carry money-like meaning (raw impact values, remainders) are
//! held as `rust_decimal::Decimal` and stored as canonical TEXT. Enums are
//! stored as their lowercase names.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

// ============================================================================
// Timestamp Helpers (SQLite stores timestamps as TEXT)
// ============================================================================

/// Current UTC timestamp, millisecond precision, lexicographically sortable
pub fn current_timestamp() -> String {
    format_timestamp(chrono::Utc::now())
}

pub fn format_timestamp(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Normalise a producer-supplied RFC 3339 timestamp into the stored format
pub fn normalize_timestamp(raw: &str) -> Result<String, LedgerError> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|ts| format_timestamp(ts.with_timezone(&chrono::Utc)))
        .map_err(|e| LedgerError::InvalidInput(format!("Invalid timestamp '{}': {}", raw, e)))
}

// ============================================================================
// Enums
// ============================================================================

/// Impact category. Each category has its own conversion rate, partial
/// balance, token sequence and share of a certificate bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Residue,
    Education,
    Product,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Residue, Category::Education, Category::Product];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Residue => "residue",
            Category::Education => "education",
            Category::Product => "product",
        }
    }

    /// Unit of the raw value measured for this category
    pub fn unit(&self) -> &'static str {
        match self {
            Category::Residue => "kg",
            Category::Education => "hours",
            Category::Product => "units",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "residue" | "residuo" => Ok(Category::Residue),
            "education" | "educacao" => Ok(Category::Education),
            "product" | "produto" => Ok(Category::Product),
            other => Err(LedgerError::InvalidInput(format!("Unknown category: {}", other))),
        }
    }
}

/// Token lifecycle. Only Available -> Reserved -> Consumed is ever allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Available,
    Reserved,
    Consumed,
}

impl TokenStatus {
    pub const ALL: [TokenStatus; 3] =
        [TokenStatus::Available, TokenStatus::Reserved, TokenStatus::Consumed];

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Available => "available",
            TokenStatus::Reserved => "reserved",
            TokenStatus::Consumed => "consumed",
        }
    }

    /// The only status this one may move to
    pub fn next(&self) -> Option<TokenStatus> {
        match self {
            TokenStatus::Available => Some(TokenStatus::Reserved),
            TokenStatus::Reserved => Some(TokenStatus::Consumed),
            TokenStatus::Consumed => None,
        }
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(TokenStatus::Available),
            "reserved" => Ok(TokenStatus::Reserved),
            "consumed" => Ok(TokenStatus::Consumed),
            other => Err(LedgerError::InvalidInput(format!("Unknown token status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    AwaitingCertificate,
    Fulfilled,
}

impl QuotaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaStatus::AwaitingCertificate => "awaiting_certificate",
            QuotaStatus::Fulfilled => "fulfilled",
        }
    }
}

impl fmt::Display for QuotaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuotaStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_certificate" => Ok(QuotaStatus::AwaitingCertificate),
            "fulfilled" => Ok(QuotaStatus::Fulfilled),
            other => Err(LedgerError::InvalidInput(format!("Unknown quota status: {}", other))),
        }
    }
}

macro_rules! text_enum_sql {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: LedgerError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum_sql!(Category);
text_enum_sql!(TokenStatus);
text_enum_sql!(QuotaStatus);

// ============================================================================
// Decimal / JSON column helpers
// ============================================================================

/// Parse a stored decimal column. Malformed values are reported, not coerced.
pub fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    Decimal::from_str(raw.trim()).map_err(|e| format!("'{}' is not a decimal: {}", raw, e))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn decimal_column(row: &Row<'_>, idx: &str) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    parse_decimal(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(LedgerError::Invariant(e)),
        )
    })
}

// ============================================================================
// Impact Measurements
// ============================================================================

/// Raw impact measurement as written by an upstream producer.
///
/// `raw_value` is kept as the stored text: validation happens at accrual time
/// so a malformed row can be reported and left for review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactMeasurement {
    pub id: String,
    pub category: Category,
    pub raw_value: String,
    pub recorded_at: String,
    pub source_kind: String,
    pub source_ref: Option<String>,
    pub subject_id: Option<String>,
    pub note: Option<String>,
    pub consumed: bool,
    pub consumed_run_id: Option<String>,
    pub consumed_at: Option<String>,
    pub created_at: String,
}

impl ImpactMeasurement {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            category: row.get("category")?,
            raw_value: row.get("raw_value")?,
            recorded_at: row.get("recorded_at")?,
            source_kind: row.get("source_kind")?,
            source_ref: row.get("source_ref")?,
            subject_id: row.get("subject_id")?,
            note: row.get("note")?,
            consumed: row.get::<_, i64>("consumed")? != 0,
            consumed_run_id: row.get("consumed_run_id")?,
            consumed_at: row.get("consumed_at")?,
            created_at: row.get("created_at")?,
        })
    }

    /// Validated raw value: a decimal that is not negative
    pub fn value(&self) -> Result<Decimal, String> {
        let value = parse_decimal(&self.raw_value)?;
        if value < Decimal::ZERO {
            return Err(format!("negative raw value {}", value));
        }
        Ok(value)
    }
}

// ============================================================================
// Partial Balances
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialBalance {
    pub category: Category,
    pub remainder: Decimal,
    /// Measurement ids whose value sits in `remainder`, oldest first
    pub carried_origin_ids: Vec<String>,
    pub updated_at: String,
}

impl PartialBalance {
    /// The implicit balance of a category that has never accrued
    pub fn empty(category: Category) -> Self {
        Self {
            category,
            remainder: Decimal::ZERO,
            carried_origin_ids: Vec::new(),
            updated_at: current_timestamp(),
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            category: row.get("category")?,
            remainder: decimal_column(row, "remainder")?,
            carried_origin_ids: json_column(row, "carried_origin_ids")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

// ============================================================================
// Tokens
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub category: Category,
    pub sequence_number: i64,
    pub origin_ids: Vec<String>,
    pub status: TokenStatus,
    pub run_id: String,
    pub issued_at: String,
    pub reserved_at: Option<String>,
    pub certificate_id: Option<String>,
    pub project_id: Option<String>,
    pub assigned_at: Option<String>,
}

impl Token {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            category: row.get("category")?,
            sequence_number: row.get("sequence_number")?,
            origin_ids: json_column(row, "origin_ids")?,
            status: row.get("status")?,
            run_id: row.get("run_id")?,
            issued_at: row.get("issued_at")?,
            reserved_at: row.get("reserved_at")?,
            certificate_id: row.get("certificate_id")?,
            project_id: row.get("project_id")?,
            assigned_at: row.get("assigned_at")?,
        })
    }
}

// ============================================================================
// Quotas
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quota {
    pub id: String,
    pub project_id: String,
    pub investor_ref: Option<String>,
    pub status: QuotaStatus,
    pub certificate_id: Option<String>,
    pub created_at: String,
    pub fulfilled_at: Option<String>,
}

impl Quota {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            investor_ref: row.get("investor_ref")?,
            status: row.get("status")?,
            certificate_id: row.get("certificate_id")?,
            created_at: row.get("created_at")?,
            fulfilled_at: row.get("fulfilled_at")?,
        })
    }
}

// ============================================================================
// Certificates
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub id: String,
    pub sequence_number: i64,
    /// Human facing number, e.g. `CDV-2026-000042`
    pub number: String,
    pub validation_hash: String,
    pub quota_id: String,
    pub project_id: String,
    /// Token ids per category, each list in FIFO (sequence) order
    pub tokens_by_category: BTreeMap<Category, Vec<String>>,
    pub total_tokens: i64,
    pub issued_at: String,
}

impl Certificate {
    /// All token ids in category order, then sequence order
    pub fn token_ids(&self) -> Vec<String> {
        self.tokens_by_category.values().flatten().cloned().collect()
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            sequence_number: row.get("sequence_number")?,
            number: row.get("number")?,
            validation_hash: row.get("validation_hash")?,
            quota_id: row.get("quota_id")?,
            project_id: row.get("project_id")?,
            tokens_by_category: json_column(row, "token_ids")?,
            total_tokens: row.get("total_tokens")?,
            issued_at: row.get("issued_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_parse_accepts_legacy_names() {
        assert_eq!("residuo".parse::<Category>().unwrap(), Category::Residue);
        assert_eq!("Education".parse::<Category>().unwrap(), Category::Education);
        assert!("water".parse::<Category>().is_err());
    }

    #[test]
    fn test_token_status_only_moves_forward() {
        assert_eq!(TokenStatus::Available.next(), Some(TokenStatus::Reserved));
        assert_eq!(TokenStatus::Reserved.next(), Some(TokenStatus::Consumed));
        assert_eq!(TokenStatus::Consumed.next(), None);
    }

    #[test]
    fn test_normalize_timestamp() {
        let ts = normalize_timestamp("2026-03-01T10:00:00-03:00").unwrap();
        assert_eq!(ts, "2026-03-01T13:00:00.000Z");
        assert!(normalize_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_measurement_value_rejects_negative_and_garbage() {
        let mut m = ImpactMeasurement {
            id: "m1".into(),
            category: Category::Residue,
            raw_value: "0.3".into(),
            recorded_at: current_timestamp(),
            source_kind: "delivery".into(),
            source_ref: None,
            subject_id: None,
            note: None,
            consumed: false,
            consumed_run_id: None,
            consumed_at: None,
            created_at: current_timestamp(),
        };
        assert_eq!(m.value().unwrap(), Decimal::new(3, 1));

        m.raw_value = "-1".into();
        assert!(m.value().is_err());

        m.raw_value = "abc".into();
        assert!(m.value().is_err());

        m.raw_value = "0".into();
        assert_eq!(m.value().unwrap(), Decimal::ZERO);
    }
}
