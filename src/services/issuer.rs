//! Certificate Issuer - exchanges a fixed bundle of tokens for a certificate
//!
//! Selection runs as a plain read. The write transaction then reserves the
//! whole bundle (all-or-nothing), writes the certificate, consumes the tokens
//! and fulfils the quota. If another issuer consumed part of the selection in
//! between, the reservation reports a conflict, nothing is written, and the
//! selection is retried from fresh counts up to `issue_attempts` times.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bundle::{BundleRatio, CertificateBundle};
use crate::db::tokens::ReserveOutcome;
use crate::db::{certificates, quotas, tokens, Category, Certificate, LedgerDb, Quota, QuotaStatus, TokenStatus};
use crate::error::LedgerError;

use super::events::{EventBus, LedgerEvent};

/// The first category that could not cover its share of the bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockShortfall {
    pub category: Category,
    pub required: u32,
    pub available: u64,
    /// Stock looked sufficient but every attempt lost the race
    pub contended: bool,
}

/// Result of `issue`. Precondition failures are outcomes, not errors.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IssueOutcome {
    Issued(Certificate),
    InsufficientStock(StockShortfall),
    AlreadyFulfilled {
        quota_id: String,
        certificate_id: Option<String>,
    },
}

enum Plan {
    Ready { bundle: CertificateBundle },
    Short(StockShortfall),
    Contended,
    Fulfilled(Quota),
}

enum Attempt {
    Issued(Certificate),
    Conflict,
    Fulfilled(Quota),
}

/// Certificate Issuer
pub struct CertificateIssuer {
    db: Arc<LedgerDb>,
    ratio: BundleRatio,
    prefix: String,
    attempts: u32,
    events: Arc<EventBus>,
}

impl CertificateIssuer {
    pub fn new(
        db: Arc<LedgerDb>,
        ratio: BundleRatio,
        prefix: impl Into<String>,
        attempts: u32,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            db,
            ratio,
            prefix: prefix.into(),
            attempts: attempts.max(1),
            events,
        }
    }

    pub fn ratio(&self) -> &BundleRatio {
        &self.ratio
    }

    // =========================================================================
    // Issuance
    // =========================================================================

    /// Issue a certificate for an awaiting quota
    pub fn issue(&self, quota_id: &str) -> Result<IssueOutcome, LedgerError> {
        for attempt in 1..=self.attempts {
            let bundle = match self.plan(quota_id)? {
                Plan::Ready { bundle } => bundle,
                Plan::Short(shortfall) => return Ok(self.reject_short(quota_id, shortfall)),
                Plan::Fulfilled(quota) => return Ok(self.reject_fulfilled(quota)),
                Plan::Contended => {
                    debug!(quota_id = %quota_id, attempt, "Stock moved during selection");
                    continue;
                }
            };

            match self.commit(quota_id, &bundle) {
                Ok(Attempt::Issued(certificate)) => {
                    info!(
                        certificate_id = %certificate.id,
                        number = %certificate.number,
                        quota_id = %quota_id,
                        tokens = certificate.total_tokens,
                        attempt,
                        "Certificate issued"
                    );
                    self.events.emit(LedgerEvent::CertificateIssued {
                        id: certificate.id.clone(),
                        number: certificate.number.clone(),
                        quota_id: certificate.quota_id.clone(),
                        total_tokens: certificate.total_tokens,
                    });
                    return Ok(IssueOutcome::Issued(certificate));
                }
                Ok(Attempt::Fulfilled(quota)) => return Ok(self.reject_fulfilled(quota)),
                Ok(Attempt::Conflict) => {
                    debug!(quota_id = %quota_id, attempt, "Bundle reservation lost a race");
                }
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    warn!(quota_id = %quota_id, attempt, error = %e, "Retrying issue");
                }
                Err(e) => return Err(e),
            }
        }

        // Every attempt conflicted; report what the stock looks like now
        let shortfall = self.db.with_conn(|conn| self.shortfall(conn))?;
        let shortfall = match shortfall {
            Some(short) => short,
            None => {
                let (category, required) = self
                    .ratio
                    .iter()
                    .next()
                    .ok_or_else(|| LedgerError::Internal("Empty bundle ratio".into()))?;
                let available = self
                    .db
                    .with_conn(|conn| tokens::count(conn, category, TokenStatus::Available))?;
                StockShortfall {
                    category,
                    required,
                    available,
                    contended: true,
                }
            }
        };
        Ok(self.reject_short(quota_id, shortfall))
    }

    /// Steps 1-3: quota check, counts, FIFO selection.
    ///
    /// All reads share one snapshot so the counts and the selection agree.
    fn plan(&self, quota_id: &str) -> Result<Plan, LedgerError> {
        self.db.with_conn(|conn| {
            let snapshot = conn.unchecked_transaction()?;

            let quota = quotas::get_quota(&snapshot, quota_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("quota {}", quota_id)))?;
            if quota.status != QuotaStatus::AwaitingCertificate {
                return Ok(Plan::Fulfilled(quota));
            }

            if let Some(short) = self.shortfall(&snapshot)? {
                return Ok(Plan::Short(short));
            }

            match self.select_bundle(&snapshot)? {
                Some(bundle) => Ok(Plan::Ready { bundle }),
                None => Ok(Plan::Contended),
            }
        })
    }

    /// FIFO selection for the whole ratio. `None` when some category came
    /// back short, meaning stock moved after it was counted.
    fn select_bundle(&self, conn: &rusqlite::Connection) -> Result<Option<CertificateBundle>, LedgerError> {
        let mut selection = BTreeMap::new();
        for (category, required) in self.ratio.iter() {
            let ids = tokens::select_available(conn, category, required)?;
            if ids.len() < required as usize {
                return Ok(None);
            }
            selection.insert(category, ids);
        }

        // A selection that does not match the ratio never reaches a write
        self.ratio.assemble(selection).map(Some)
    }

    /// Steps 4-5: reserve, certify, consume, fulfil; one transaction
    fn commit(&self, quota_id: &str, bundle: &CertificateBundle) -> Result<Attempt, LedgerError> {
        let ids = bundle.token_ids();

        self.db.with_tx(|tx| {
            let quota = quotas::get_quota(tx, quota_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("quota {}", quota_id)))?;
            if quota.status != QuotaStatus::AwaitingCertificate {
                return Ok(Attempt::Fulfilled(quota));
            }

            match tokens::reserve(tx, &ids)? {
                ReserveOutcome::Reserved(_) => {}
                ReserveOutcome::Conflict { .. } => return Ok(Attempt::Conflict),
            }

            let certificate = certificates::insert_certificate(
                tx,
                &self.prefix,
                quota_id,
                &quota.project_id,
                bundle.by_category().clone(),
            )?;
            tokens::consume(tx, &ids, Some(&certificate.id), Some(&quota.project_id))?;
            quotas::fulfill(tx, quota_id, &certificate.id)?;

            Ok(Attempt::Issued(certificate))
        })
    }

    fn shortfall(&self, conn: &rusqlite::Connection) -> Result<Option<StockShortfall>, LedgerError> {
        for (category, required) in self.ratio.iter() {
            let available = tokens::count(conn, category, TokenStatus::Available)?;
            if available < required as u64 {
                return Ok(Some(StockShortfall {
                    category,
                    required,
                    available,
                    contended: false,
                }));
            }
        }
        Ok(None)
    }

    fn reject_short(&self, quota_id: &str, shortfall: StockShortfall) -> IssueOutcome {
        info!(
            quota_id = %quota_id,
            category = %shortfall.category,
            required = shortfall.required,
            available = shortfall.available,
            "Insufficient stock for certificate"
        );
        self.events.emit(LedgerEvent::IssueRejected {
            quota_id: quota_id.to_string(),
            reason: "insufficient_stock".into(),
        });
        IssueOutcome::InsufficientStock(shortfall)
    }

    fn reject_fulfilled(&self, quota: Quota) -> IssueOutcome {
        self.events.emit(LedgerEvent::IssueRejected {
            quota_id: quota.id.clone(),
            reason: "already_fulfilled".into(),
        });
        IssueOutcome::AlreadyFulfilled {
            quota_id: quota.id,
            certificate_id: quota.certificate_id,
        }
    }

    // =========================================================================
    // Quotas and certificate lookups
    // =========================================================================

    pub fn register_quota(&self, project_id: &str, investor_ref: Option<&str>) -> Result<Quota, LedgerError> {
        let quota = self
            .db
            .with_tx(|tx| quotas::register_quota(tx, project_id, investor_ref))?;
        self.events.emit(LedgerEvent::QuotaRegistered {
            id: quota.id.clone(),
            project_id: quota.project_id.clone(),
        });
        Ok(quota)
    }

    pub fn get_quota(&self, id: &str) -> Result<Option<Quota>, LedgerError> {
        self.db.with_conn(|conn| quotas::get_quota(conn, id))
    }

    pub fn list_quotas(&self, status: Option<QuotaStatus>) -> Result<Vec<Quota>, LedgerError> {
        self.db.with_conn(|conn| quotas::list_quotas(conn, status))
    }

    pub fn get_certificate(&self, id: &str) -> Result<Option<Certificate>, LedgerError> {
        self.db.with_conn(|conn| certificates::get_certificate(conn, id))
    }

    pub fn certificate_for_quota(&self, quota_id: &str) -> Result<Option<Certificate>, LedgerError> {
        self.db.with_conn(|conn| certificates::certificate_for_quota(conn, quota_id))
    }

    /// Public verification by validation hash
    pub fn verify(&self, hash: &str) -> Result<Option<Certificate>, LedgerError> {
        self.db.with_conn(|conn| certificates::find_by_validation_hash(conn, hash))
    }

    pub fn list_certificates(&self, limit: i64) -> Result<Vec<Certificate>, LedgerError> {
        self.db.with_conn(|conn| certificates::list_certificates(conn, limit))
    }
}
