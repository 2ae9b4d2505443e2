//! HTTP API for the ledger
//!
//! ## Intake
//! - `POST /measurements` - record one measurement
//! - `POST /measurements/bulk` - record many in one transaction
//!
//! ## Accrual
//! - `POST /accrual/run` - run every category, or `{"category": "..."}` for one
//!
//! ## Issuance
//! - `POST /quotas`, `GET /quotas[?status=...]`
//! - `POST /certificates` with `{"quota_id": "..."}`
//! - `GET /certificates/{id}`, `GET /certificates/verify/{hash}`
//!
//! ## Reporting
//! - `GET /stock`, `GET /health`
//!
//! ```bash
//! curl -X POST http://localhost:8095/measurements \
//!      -d '{"category": "residue", "raw_value": "12.5", "source_kind": "delivery", "source_ref": "d-981"}'
//! curl -X POST http://localhost:8095/certificates -d '{"quota_id": "..."}'
//! ```
//!
//! Every handler moves its database work onto the blocking pool.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::db::measurements::{RecordMeasurementInput, RecordOutcome};
use crate::db::{Category, QuotaStatus};
use crate::error::LedgerError;
use crate::services::response::{self, bad_request, created, error_response, from_issue, from_option, from_result, ok};
use crate::services::Services;

type HttpResponse = Response<Full<Bytes>>;

#[derive(Debug, Deserialize)]
struct RunRequest {
    #[serde(default)]
    category: Option<Category>,
}

#[derive(Debug, Deserialize)]
struct QuotaRequest {
    project_id: String,
    #[serde(default)]
    investor_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IssueRequest {
    quota_id: String,
}

/// HTTP server state
pub struct HttpServer {
    services: Arc<Services>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(services: Arc<Services>, bind_addr: SocketAddr) -> Self {
        Self { services, bind_addr }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), LedgerError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route requests to handlers
    async fn handle_request(&self, req: Request<Incoming>) -> Result<HttpResponse, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(method = %method, path = %path, "Incoming request");

        let response = match (method, path.as_str()) {
            (Method::GET, "/health") => self.handle_health().await,

            (Method::POST, "/measurements") => self.handle_record(req).await,
            (Method::POST, "/measurements/bulk") => self.handle_bulk_record(req).await,

            (Method::POST, "/accrual/run") => self.handle_accrual_run(req).await,

            (Method::POST, "/quotas") => self.handle_register_quota(req).await,
            (Method::GET, "/quotas") => {
                let status = req.uri().query().and_then(|q| query_param(q, "status"));
                self.handle_list_quotas(status).await
            }

            (Method::POST, "/certificates") => self.handle_issue(req).await,
            (Method::GET, p) if p.starts_with("/certificates/verify/") => {
                let hash = p.strip_prefix("/certificates/verify/").unwrap_or("").to_string();
                let issuer = self.services.issuer.clone();
                from_option(
                    blocking(move || issuer.verify(&hash)).await,
                    "No certificate with that validation hash",
                )
            }
            (Method::GET, p) if p.starts_with("/certificates/") => {
                let id = p.strip_prefix("/certificates/").unwrap_or("").to_string();
                let issuer = self.services.issuer.clone();
                from_option(blocking(move || issuer.get_certificate(&id)).await, "Certificate not found")
            }

            (Method::GET, "/stock") => {
                let stock = self.services.stock.clone();
                from_result(blocking(move || stock.stock_report()).await)
            }

            (_, "/measurements")
            | (_, "/measurements/bulk")
            | (_, "/accrual/run")
            | (_, "/quotas")
            | (_, "/certificates")
            | (_, "/stock") => response::method_not_allowed(),

            _ => response::not_found("Not Found"),
        };

        Ok(response)
    }

    async fn handle_health(&self) -> HttpResponse {
        let stock = self.services.stock.clone();
        match blocking(move || stock.stats()).await {
            Ok(stats) => ok(&serde_json::json!({
                "status": "ok",
                "measurements": stats.measurement_count,
                "pending_measurements": stats.pending_measurements,
                "tokens": stats.token_count,
                "certificates": stats.certificate_count,
                "quotas": stats.quota_count,
            })),
            Err(e) => error_response(e),
        }
    }

    /// POST /measurements
    async fn handle_record(&self, req: Request<Incoming>) -> HttpResponse {
        let input: RecordMeasurementInput = match read_json(req).await {
            Ok(input) => input,
            Err(resp) => return resp,
        };
        let intake = self.services.intake.clone();
        match blocking(move || intake.record(input)).await {
            Ok(RecordOutcome::Inserted(m)) => created(&m),
            Ok(RecordOutcome::Duplicate(m)) => ok(&m),
            Err(e) => error_response(e),
        }
    }

    /// POST /measurements/bulk
    async fn handle_bulk_record(&self, req: Request<Incoming>) -> HttpResponse {
        let inputs: Vec<RecordMeasurementInput> = match read_json(req).await {
            Ok(inputs) => inputs,
            Err(resp) => return resp,
        };
        let intake = self.services.intake.clone();
        from_result(blocking(move || intake.bulk_record(inputs)).await)
    }

    /// POST /accrual/run
    async fn handle_accrual_run(&self, req: Request<Incoming>) -> HttpResponse {
        let body = match read_body(req).await {
            Ok(body) => body,
            Err(e) => return error_response(e),
        };
        let run: RunRequest = if body.is_empty() {
            RunRequest { category: None }
        } else {
            match serde_json::from_slice(&body) {
                Ok(run) => run,
                Err(e) => return bad_request(&format!("Invalid JSON: {}", e)),
            }
        };

        let accrual = self.services.accrual.clone();
        match run.category {
            Some(category) => from_result(blocking(move || accrual.run_category(category)).await),
            None => from_result(blocking(move || Ok(accrual.run())).await),
        }
    }

    /// POST /quotas
    async fn handle_register_quota(&self, req: Request<Incoming>) -> HttpResponse {
        let input: QuotaRequest = match read_json(req).await {
            Ok(input) => input,
            Err(resp) => return resp,
        };
        let issuer = self.services.issuer.clone();
        match blocking(move || issuer.register_quota(&input.project_id, input.investor_ref.as_deref())).await {
            Ok(quota) => created(&quota),
            Err(e) => error_response(e),
        }
    }

    /// GET /quotas
    async fn handle_list_quotas(&self, status: Option<String>) -> HttpResponse {
        let status = match status.as_deref().map(str::parse::<QuotaStatus>).transpose() {
            Ok(status) => status,
            Err(e) => return error_response(e),
        };
        let issuer = self.services.issuer.clone();
        from_result(blocking(move || issuer.list_quotas(status)).await)
    }

    /// POST /certificates
    async fn handle_issue(&self, req: Request<Incoming>) -> HttpResponse {
        let input: IssueRequest = match read_json(req).await {
            Ok(input) => input,
            Err(resp) => return resp,
        };
        let issuer = self.services.issuer.clone();
        from_issue(blocking(move || issuer.issue(&input.quota_id)).await)
    }
}

/// Run a ledger call on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T, LedgerError>
where
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LedgerError::Internal(format!("Blocking task failed: {}", e)))?
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, LedgerError> {
    let body = req
        .collect()
        .await
        .map_err(|e| LedgerError::Internal(format!("Failed to read body: {}", e)))?;
    Ok(body.to_bytes())
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, HttpResponse> {
    let body = read_body(req).await.map_err(error_response)?;
    serde_json::from_slice(&body).map_err(|e| bad_request(&format!("Invalid JSON: {}", e)))
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}
