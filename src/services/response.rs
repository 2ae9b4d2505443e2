//! HTTP response building helpers

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{self, HeaderValue};
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::error::LedgerError;

use super::issuer::IssueOutcome;

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// 200 OK
pub fn ok<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, body)
}

/// 201 Created
pub fn created<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::CREATED, body)
}

pub fn not_found(message: &str) -> Response<Full<Bytes>> {
    json_response(StatusCode::NOT_FOUND, &serde_json::json!({ "error": message }))
}

pub fn bad_request(message: &str) -> Response<Full<Bytes>> {
    json_response(StatusCode::BAD_REQUEST, &serde_json::json!({ "error": message }))
}

pub fn method_not_allowed() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &serde_json::json!({ "error": "Method not allowed" }),
    )
}

/// 409 with a machine-readable reason
pub fn conflict<T: Serialize>(reason: &str, detail: &T) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::CONFLICT,
        &serde_json::json!({ "error": reason, "reason": reason, "detail": detail }),
    )
}

/// Convert a LedgerError to an appropriate HTTP response
pub fn error_response(error: LedgerError) -> Response<Full<Bytes>> {
    let status = match &error {
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::InvalidInput(_) | LedgerError::Json(_) => StatusCode::BAD_REQUEST,
        LedgerError::InvalidTransition { .. } | LedgerError::Conflict(_) => StatusCode::CONFLICT,
        e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    json_response(status, &serde_json::json!({ "error": error.to_string() }))
}

/// Wrap a service result into an HTTP response
pub fn from_result<T: Serialize>(result: Result<T, LedgerError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => ok(&value),
        Err(e) => error_response(e),
    }
}

/// Wrap an optional service result; None becomes 404
pub fn from_option<T: Serialize>(
    result: Result<Option<T>, LedgerError>,
    not_found_msg: &str,
) -> Response<Full<Bytes>> {
    match result {
        Ok(Some(value)) => ok(&value),
        Ok(None) => not_found(not_found_msg),
        Err(e) => error_response(e),
    }
}

/// Issue outcomes: 201 for a certificate, 409 for either precondition failure
pub fn from_issue(result: Result<IssueOutcome, LedgerError>) -> Response<Full<Bytes>> {
    match result {
        Ok(outcome @ IssueOutcome::Issued(_)) => created(&outcome),
        Ok(outcome @ IssueOutcome::InsufficientStock(_)) => conflict("insufficient_stock", &outcome),
        Ok(outcome @ IssueOutcome::AlreadyFulfilled { .. }) => conflict("already_fulfilled", &outcome),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Category;
    use crate::services::issuer::StockShortfall;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_response(LedgerError::NotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_response(LedgerError::InvalidInput("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_response(LedgerError::Internal("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_issue_outcomes_map_to_conflict() {
        let short = from_issue(Ok(IssueOutcome::InsufficientStock(StockShortfall {
            category: Category::Residue,
            required: 250,
            available: 249,
            contended: false,
        })));
        assert_eq!(short.status(), StatusCode::CONFLICT);

        let done = from_issue(Ok(IssueOutcome::AlreadyFulfilled {
            quota_id: "q".into(),
            certificate_id: None,
        }));
        assert_eq!(done.status(), StatusCode::CONFLICT);
        assert_eq!(
            done.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
