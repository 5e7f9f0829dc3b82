//! HTTP response building helpers
//!
//! Every handler answers with JSON. Engine errors map to a status code by
//! kind; refusals carry a machine-readable `reason` tag.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{header, Response, StatusCode};
use serde::Serialize;

use crate::error::{EngineError, Ineligible};

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(json)))
        .unwrap()
}

/// Build a JSON response with 200 OK status
pub fn ok<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, body)
}

/// Build a JSON response with 201 Created status
pub fn created<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::CREATED, body)
}

/// 200 when the write already existed, 201 otherwise
pub fn created_or_ok<T: Serialize>(already_existed: bool, body: &T) -> Response<Full<Bytes>> {
    if already_existed {
        ok(body)
    } else {
        created(body)
    }
}

/// Build a 404 Not Found response with message
pub fn not_found(message: &str) -> Response<Full<Bytes>> {
    json_response(StatusCode::NOT_FOUND, &serde_json::json!({ "error": message }))
}

/// Status for a refusal. Timing refusals are conflicts with current state;
/// the rest cannot succeed for this entity without outside change.
fn ineligible_status(reason: &Ineligible) -> StatusCode {
    match reason {
        Ineligible::NotDue { .. }
        | Ineligible::FirstCycleIncomplete
        | Ineligible::PoolCycleOpen { .. }
        | Ineligible::PurchaseNotActive { .. }
        | Ineligible::CycleCapReached { .. } => StatusCode::CONFLICT,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

/// Convert an EngineError to an appropriate HTTP response
pub fn error_response(error: EngineError) -> Response<Full<Bytes>> {
    match &error {
        EngineError::NotEligible(reason) => json_response(
            ineligible_status(reason),
            &serde_json::json!({ "error": error.to_string(), "reason": reason.tag() }),
        ),
        _ => {
            let status = match &error {
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::InvalidInput(_) | EngineError::Json(_) => StatusCode::BAD_REQUEST,
                EngineError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            json_response(status, &serde_json::json!({ "error": error.to_string() }))
        }
    }
}

/// Result type alias for handlers
pub type HandlerResult = Result<Response<Full<Bytes>>, EngineError>;

/// Wrap a service result into an HTTP response
pub fn from_result<T: Serialize>(result: Result<T, EngineError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => ok(&value),
        Err(e) => error_response(e),
    }
}

/// Wrap an optional service result into an HTTP response
/// Returns 404 if None
pub fn from_option<T: Serialize>(
    result: Result<Option<T>, EngineError>,
    not_found_msg: &str,
) -> Response<Full<Bytes>> {
    match result {
        Ok(Some(value)) => ok(&value),
        Ok(None) => not_found(not_found_msg),
        Err(e) => error_response(e),
    }
}
