//! API module for all HTTP handlers
//!
//! Every method and path lands in one dispatcher so that all responses go
//! through the same writer.

pub mod handlers;
pub mod response;
pub mod webhook;

use axum::{
    Router,
    body::Bytes,
    extract::{
        DefaultBodyLimit, Query, State as AxumState,
        rejection::{BytesRejection, QueryRejection},
    },
    http::{HeaderMap, Method},
    response::Response,
};
use std::collections::HashMap;

use crate::SharedState;

// Re-export handlers
pub use handlers::{head_response, status_page, unsupported_method};
pub use response::write_response;
pub use webhook::{handle_webhook, process_delivery};

pub fn router(state: SharedState) -> Router {
    let body_limit = state.config.max_body_bytes;
    Router::new()
        .fallback(dispatch)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn dispatch(
    AxumState(state): AxumState<SharedState>,
    method: Method,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    match method {
        Method::GET => {
            // An unparsable query string still gets the HTML page.
            let params = query.map(|Query(params)| params).unwrap_or_default();
            let as_json = params.get("format").map(String::as_str) == Some("json");
            status_page(&state, as_json).await
        }
        Method::HEAD => head_response(),
        Method::POST => handle_webhook(state, &headers, body).await,
        other => unsupported_method(&other),
    }
}
