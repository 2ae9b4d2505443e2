//! Stock reporting and the Token Store surface

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::bundle::BundleRatio;
use crate::config::RateConfig;
use crate::db::tokens::{self, ReserveOutcome};
use crate::db::{balances, Category, DbStats, LedgerDb, Token, TokenStatus};
use crate::error::LedgerError;

/// Stock of one category
#[derive(Debug, Clone, Serialize)]
pub struct CategoryStock {
    pub category: Category,
    pub unit: &'static str,
    pub available: u64,
    pub reserved: u64,
    pub consumed: u64,
    pub remainder: Decimal,
    pub rate: Decimal,
    pub bundle_required: u32,
    /// None when the bundle does not draw from this category
    pub certificates_backable: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StockReport {
    pub categories: Vec<CategoryStock>,
    pub bundle_total: u32,
    /// Whole certificates the available stock can back right now
    pub certificates_backable: u64,
}

pub struct StockService {
    db: Arc<LedgerDb>,
    rates: RateConfig,
    ratio: BundleRatio,
}

impl StockService {
    pub fn new(db: Arc<LedgerDb>, rates: RateConfig, ratio: BundleRatio) -> Self {
        Self { db, rates, ratio }
    }

    pub fn stock_report(&self) -> Result<StockReport, LedgerError> {
        self.db.with_conn(|conn| {
            let counts = tokens::counts_by_category(conn)?;
            let mut categories = Vec::with_capacity(Category::ALL.len());

            for category in Category::ALL {
                let c = counts.get(&category).copied().unwrap_or_default();
                let required = self.ratio.required(category);
                categories.push(CategoryStock {
                    category,
                    unit: category.unit(),
                    available: c.available,
                    reserved: c.reserved,
                    consumed: c.consumed,
                    remainder: balances::get_balance(conn, category)?.remainder,
                    rate: self.rates.rate(category),
                    bundle_required: required,
                    certificates_backable: (required > 0).then(|| c.available / required as u64),
                });
            }

            let certificates_backable = categories
                .iter()
                .filter_map(|c| c.certificates_backable)
                .min()
                .unwrap_or(0);

            Ok(StockReport {
                categories,
                bundle_total: self.ratio.total(),
                certificates_backable,
            })
        })
    }

    /// `query(category, status) -> count`
    pub fn query(&self, category: Category, status: TokenStatus) -> Result<u64, LedgerError> {
        self.db.with_conn(|conn| tokens::count(conn, category, status))
    }

    /// All-or-nothing Available -> Reserved
    pub fn reserve(&self, ids: &[String]) -> Result<ReserveOutcome, LedgerError> {
        self.db.with_tx(|tx| tokens::reserve(tx, ids))
    }

    /// Reserved -> Consumed without a certificate (manual retirement)
    pub fn consume(&self, ids: &[String]) -> Result<usize, LedgerError> {
        self.db.with_tx(|tx| tokens::consume(tx, ids, None, None))
    }

    pub fn token(&self, id: &str) -> Result<Option<Token>, LedgerError> {
        self.db.with_conn(|conn| tokens::get_token(conn, id))
    }

    pub fn tokens(
        &self,
        category: Category,
        status: Option<TokenStatus>,
        limit: i64,
    ) -> Result<Vec<Token>, LedgerError> {
        self.db.with_conn(|conn| tokens::list_tokens(conn, category, status, limit))
    }

    pub fn stats(&self) -> Result<DbStats, LedgerError> {
        self.db.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_report_counts_backable_certificates() {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        db.with_tx(|tx| {
            tokens::insert_tokens(tx, Category::Residue, &vec![Vec::new(); 7], "seed")?;
            tokens::insert_tokens(tx, Category::Product, &vec![Vec::new(); 5], "seed")?;
            Ok(())
        })
        .unwrap();

        let ratio = BundleRatio::new(BTreeMap::from([(Category::Residue, 3), (Category::Product, 1)])).unwrap();
        let stock = StockService::new(db, RateConfig::default(), ratio);

        let report = stock.stock_report().unwrap();
        assert_eq!(report.bundle_total, 4);
        // Residue limits: 7 / 3 = 2
        assert_eq!(report.certificates_backable, 2);

        let education = report
            .categories
            .iter()
            .find(|c| c.category == Category::Education)
            .unwrap();
        assert_eq!(education.certificates_backable, None);
        assert_eq!(education.unit, "hours");
    }

    #[test]
    fn test_reserve_then_consume_through_service() {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        let minted = db
            .with_tx(|tx| tokens::insert_tokens(tx, Category::Residue, &vec![Vec::new(); 2], "seed"))
            .unwrap();
        let ids: Vec<String> = minted.iter().map(|t| t.id.clone()).collect();
        let stock = StockService::new(db, RateConfig::default(), BundleRatio::default());

        assert!(stock.consume(&ids).is_err());
        assert_eq!(stock.reserve(&ids).unwrap(), ReserveOutcome::Reserved(2));
        assert_eq!(stock.consume(&ids).unwrap(), 2);
        assert_eq!(stock.query(Category::Residue, TokenStatus::Consumed).unwrap(), 2);
        assert_eq!(stock.query(Category::Residue, TokenStatus::Available).unwrap(), 0);
    }
}
