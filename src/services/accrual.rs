//! Accrual Engine - converts pending impact measurements into tokens
//!
//! Each category is one unit of work inside its own IMMEDIATE transaction:
//!
//! ```text
//! claim pending (oldest first) -> validate -> accumulate remainder
//!     -> attribute origins -> mint tokens -> carry origins -> mark consumed
//! ```
//!
//! If anything in a unit fails, SQLite rolls the whole unit back and the run
//! moves on to the next category. Malformed rows are reported and left
//! pending; they never abort their category.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RateConfig;
use crate::db::{balances, measurements, tokens, Category, LedgerDb};
use crate::error::LedgerError;

use super::events::{EventBus, LedgerEvent};

/// A per-measurement or per-category problem found during a run
#[derive(Debug, Clone, Serialize)]
pub struct RunError {
    pub category: Category,
    /// None when the whole category unit failed
    pub measurement_id: Option<String>,
    pub reason: String,
}

/// What one category unit did
#[derive(Debug, Clone, Serialize)]
pub struct CategoryRun {
    pub category: Category,
    pub run_id: String,
    pub tokens_created: u64,
    pub measurements_consumed: usize,
    pub amount: Decimal,
    pub previous_remainder: Decimal,
    pub new_remainder: Decimal,
    pub rejected: Vec<RunError>,
}

/// Result of `run()` across all categories
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub tokens_created: u64,
    pub measurements_consumed: usize,
    pub errors: Vec<RunError>,
    pub categories: Vec<CategoryRun>,
}

impl RunReport {
    fn absorb(&mut self, unit: CategoryRun) {
        self.tokens_created += unit.tokens_created;
        self.measurements_consumed += unit.measurements_consumed;
        self.errors.extend(unit.rejected.iter().cloned());
        self.categories.push(unit);
    }
}

/// Origin lists for the tokens of one unit, plus the ids left in the remainder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub token_origins: Vec<Vec<String>>,
    pub carried: Vec<String>,
}

/// Walk measurements oldest first, closing an origin list every time the
/// running total reaches `rate`.
///
/// `carried` (ids already sitting in `remainder`) opens the first list. A
/// measurement that alone covers several tokens is listed on the first of
/// them; the tokens after it get empty lists. No id is ever listed twice.
pub fn allocate_origins(
    carried: &[String],
    remainder: Decimal,
    measurements: &[(String, Decimal)],
    rate: Decimal,
) -> Result<Allocation, LedgerError> {
    if rate <= Decimal::ZERO {
        return Err(LedgerError::Config(format!("Conversion rate must be positive, got {}", rate)));
    }

    let mut token_origins = Vec::new();
    let mut open: Vec<String> = carried.to_vec();
    let mut running = remainder;

    for (id, value) in measurements {
        open.push(id.clone());
        running = running
            .checked_add(*value)
            .ok_or_else(|| LedgerError::Invariant("Decimal overflow while attributing origins".into()))?;

        while running >= rate {
            token_origins.push(std::mem::take(&mut open));
            running -= rate;
        }
    }

    Ok(Allocation {
        token_origins,
        carried: open,
    })
}

/// Accrual Engine
pub struct AccrualEngine {
    db: Arc<LedgerDb>,
    rates: RateConfig,
    events: Arc<EventBus>,
}

impl AccrualEngine {
    pub fn new(db: Arc<LedgerDb>, rates: RateConfig, events: Arc<EventBus>) -> Self {
        Self { db, rates, events }
    }

    pub fn rate(&self, category: Category) -> Decimal {
        self.rates.rate(category)
    }

    /// Run every category. A failed category is reported and rolled back;
    /// the others still commit.
    pub fn run(&self) -> RunReport {
        let mut report = RunReport::default();

        for category in Category::ALL {
            match self.run_category(category) {
                Ok(unit) => report.absorb(unit),
                Err(e) => {
                    error!(category = %category, error = %e, "Accrual unit failed, rolled back");
                    self.events.emit(LedgerEvent::AccrualFailed {
                        category,
                        error: e.to_string(),
                    });
                    report.errors.push(RunError {
                        category,
                        measurement_id: None,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            tokens_created = report.tokens_created,
            measurements_consumed = report.measurements_consumed,
            errors = report.errors.len(),
            "Accrual run finished"
        );
        report
    }

    /// Run one category as a single atomic unit
    pub fn run_category(&self, category: Category) -> Result<CategoryRun, LedgerError> {
        let rate = self.rates.rate(category);
        let run_id = Uuid::new_v4().to_string();

        let unit = self.db.with_tx(|tx| {
            let claimed = measurements::claim_pending(tx, category)?;

            let mut valid = Vec::with_capacity(claimed.len());
            let mut rejected = Vec::new();
            for m in claimed {
                match m.value() {
                    Ok(value) => valid.push((m.id, value)),
                    Err(reason) => {
                        warn!(id = %m.id, category = %category, reason = %reason, "Skipping malformed measurement");
                        rejected.push(RunError {
                            category,
                            measurement_id: Some(m.id),
                            reason,
                        });
                    }
                }
            }

            let balance = balances::get_balance(tx, category)?;
            if valid.is_empty() {
                // Nothing to do; leave every row untouched
                return Ok(CategoryRun {
                    category,
                    run_id: run_id.clone(),
                    tokens_created: 0,
                    measurements_consumed: 0,
                    amount: Decimal::ZERO,
                    previous_remainder: balance.remainder,
                    new_remainder: balance.remainder,
                    rejected,
                });
            }

            let amount = valid.iter().try_fold(Decimal::ZERO, |acc, (_, v)| {
                acc.checked_add(*v)
                    .ok_or_else(|| LedgerError::Invariant("Decimal overflow while summing".into()))
            })?;

            let acc = balances::accumulate_in(tx, category, amount, rate)?;
            let allocation =
                allocate_origins(&balance.carried_origin_ids, balance.remainder, &valid, rate)?;

            if allocation.token_origins.len() as u64 != acc.whole_units {
                return Err(LedgerError::Invariant(format!(
                    "Origin walk produced {} tokens for {}, balance produced {}",
                    allocation.token_origins.len(),
                    category,
                    acc.whole_units
                )));
            }

            tokens::insert_tokens(tx, category, &allocation.token_origins, &run_id)?;
            balances::set_carried_origins(tx, category, &allocation.carried)?;

            let ids: Vec<String> = valid.into_iter().map(|(id, _)| id).collect();
            let consumed = measurements::mark_consumed(tx, &ids, &run_id)?;

            Ok(CategoryRun {
                category,
                run_id: run_id.clone(),
                tokens_created: acc.whole_units,
                measurements_consumed: consumed,
                amount,
                previous_remainder: acc.previous_remainder,
                new_remainder: acc.new_remainder,
                rejected,
            })
        })?;

        for rejected in &unit.rejected {
            if let Some(id) = &rejected.measurement_id {
                self.events.emit(LedgerEvent::MeasurementRejected {
                    id: id.clone(),
                    category,
                    reason: rejected.reason.clone(),
                });
            }
        }

        if unit.measurements_consumed > 0 {
            info!(
                category = %category,
                run_id = %unit.run_id,
                tokens = unit.tokens_created,
                measurements = unit.measurements_consumed,
                remainder = %unit.new_remainder,
                "Accrual unit committed"
            );
            self.events.emit(LedgerEvent::TokensMinted {
                run_id: unit.run_id.clone(),
                category,
                count: unit.tokens_created,
                measurements_consumed: unit.measurements_consumed,
                remainder: unit.new_remainder,
            });
        }

        Ok(unit)
    }
}
