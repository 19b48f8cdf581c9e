//! Single response writer used by every request path.
//!
//! Each response carries an explicit `Content-Length` and `Connection: close`.
//! The body is handed to the server as one complete buffer; if the peer has
//! already hung up, the write failure stays inside the connection task and is
//! dropped there, it never reaches the pipeline or the listener.

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use serde::Serialize;

use crate::pipeline::PipelineResult;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_HTML: &str = "text/html; charset=utf-8";

/// Build a response with consistent header discipline.
pub fn write_response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Vec<u8>>,
) -> Response {
    let body = body.into();
    let content_length = body.len();

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

/// JSON acknowledgement body, fields kept in this order on the wire.
#[derive(Debug, Serialize)]
struct StatusBody<'a> {
    status: &'a str,
    message: &'a str,
}

fn status_body(status: &str, message: &str) -> String {
    serde_json::to_string(&StatusBody { status, message }).unwrap_or_default()
}

pub fn success_response() -> Response {
    write_response(
        StatusCode::OK,
        CONTENT_TYPE_JSON,
        status_body("success", "Webhook processed"),
    )
}

pub fn error_response(status: StatusCode, message: &str) -> Response {
    write_response(status, CONTENT_TYPE_JSON, status_body("error", message))
}

/// Any completed pipeline is acknowledged with 200; only internal errors are 500.
pub fn webhook_response(result: &PipelineResult) -> Response {
    match result {
        PipelineResult::InternalError { message } => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
        _ => success_response(),
    }
}
