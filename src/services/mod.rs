//! Service layer for impact-ledger
//!
//! Services encapsulate business logic between HTTP/CLI handlers and
//! repositories. Each service owns its transaction boundaries and emits a
//! [`LedgerEvent`] for every state change.
//!
//! ## Architecture
//!
//! ```text
//! HTTP Handlers / CLI (thin)
//!     ↓
//! Service Layer (accrual, issuance, intake, stock)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod accrual;
pub mod events;
pub mod intake;
pub mod issuer;
pub mod response;
pub mod stock;

pub use accrual::{AccrualEngine, RunReport};
pub use events::{EventBus, EventListener, LedgerEvent};
pub use intake::IntakeService;
pub use issuer::{CertificateIssuer, IssueOutcome, StockShortfall};
pub use stock::{StockReport, StockService};

use std::sync::Arc;

use crate::config::Config;
use crate::db::LedgerDb;
use crate::error::LedgerError;

/// Service container for dependency injection
pub struct Services {
    pub intake: Arc<IntakeService>,
    pub accrual: Arc<AccrualEngine>,
    pub issuer: Arc<CertificateIssuer>,
    pub stock: Arc<StockService>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Create all services over a shared database. Fails on invalid config.
    pub fn new(db: Arc<LedgerDb>, config: &Config) -> Result<Self, LedgerError> {
        config.validate()?;
        let ratio = config.bundle.ratio()?;
        let events = Arc::new(EventBus::new());

        Ok(Self {
            intake: Arc::new(IntakeService::new(db.clone(), events.clone())),
            accrual: Arc::new(AccrualEngine::new(
                db.clone(),
                config.rates.clone(),
                events.clone(),
            )),
            issuer: Arc::new(CertificateIssuer::new(
                db.clone(),
                ratio.clone(),
                config.certificate_prefix.clone(),
                config.issue_attempts,
                events.clone(),
            )),
            stock: Arc::new(StockService::new(db, config.rates.clone(), ratio)),
            events,
        })
    }
}
