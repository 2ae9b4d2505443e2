//! Impact Ledger - accrual and issuance of UIB tokens and CDV certificates
//!
//! Verified environmental actions arrive as raw impact measurements (kilograms
//! recycled, hours of education, conscious purchases). The ledger turns them
//! into whole tokens without losing or double counting any value, and
//! exchanges fixed bundles of tokens for certificates assigned to investor
//! quotas.
//!
//! ## Flow
//!
//! ```text
//! impact_measurements --(AccrualEngine)--> tokens --(CertificateIssuer)--> certificates
//!         |                    |                                                |
//!   producers append    partial_balances keep                            quotas fulfilled
//!                       the fractional rest
//! ```
//!
//! ## Guarantees
//!
//! | Concern | How |
//! |---------|-----|
//! | No lost value | fixed-point `Decimal`, truncation, remainder carried per category |
//! | No double counting | claim + consume flag in one IMMEDIATE transaction |
//! | No double spend | all-or-nothing set reservation, bounded retry |
//! | Exact bundles | `CertificateBundle` only exists when it matches the ratio |
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/impact-ledger/
//! ├── ledger.db        # SQLite (WAL)
//! └── config.toml      # Configuration
//! ```

pub mod bundle;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod services;

// Re-exports
pub use bundle::{BundleRatio, CertificateBundle};
pub use config::Config;
pub use db::{Category, Certificate, ImpactMeasurement, LedgerDb, Quota, QuotaStatus, Token, TokenStatus};
pub use error::LedgerError;
pub use http::HttpServer;
pub use services::{
    AccrualEngine, CertificateIssuer, EventBus, IssueOutcome, LedgerEvent, RunReport, Services,
    StockReport, StockShortfall,
};
