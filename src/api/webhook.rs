//! Webhook handler for GitHub push events

use axum::{body::Bytes, extract::rejection::BytesRejection, http::HeaderMap, response::Response};
use tracing::{error, info};

use crate::SharedState;
use crate::api::response::webhook_response;
use crate::delivery::Delivery;
use crate::error::DeployError;
use crate::pipeline::PipelineResult;
use crate::webhook::{EVENT_HEADER, WebhookEvent};

/// Handles the GitHub webhook POST request.
pub async fn handle_webhook(
    state: SharedState,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let result = match body {
        Ok(body) => {
            let event_header = headers.get(EVENT_HEADER).and_then(|v| v.to_str().ok());
            info!(
                "POST received: event {:?}, {} bytes",
                event_header,
                body.len()
            );
            let event = WebhookEvent::from_delivery(event_header, &body);
            process_delivery(state, event).await
        }
        Err(rejection) => {
            let err = DeployError::RequestBody(rejection.body_text());
            error!("{}", err);
            PipelineResult::InternalError {
                message: err.to_string(),
            }
        }
    };

    webhook_response(&result)
}

/// Run the pipeline for one delivery to completion and return its terminal state.
///
/// The work happens on its own task so a client that disconnects early cannot
/// cancel a half-finished deploy; a panic inside the pipeline becomes an
/// internal error instead of a dropped connection.
pub async fn process_delivery(state: SharedState, event: WebhookEvent) -> PipelineResult {
    let delivery = Delivery::from_event(&event);
    let delivery_id = delivery.id.clone();
    info!(
        "Delivery {} - '{}' event for '{}'",
        delivery_id, event.event_kind, event.repository_full_name
    );
    state.deliveries.lock().await.record(delivery);

    let task_state = state.clone();
    let task_id = delivery_id.clone();
    let task = tokio::spawn(async move {
        // Only one pipeline runs at a time.
        let _guard = task_state.pipeline_lock.lock().await;
        task_state
            .deliveries
            .lock()
            .await
            .update(&task_id, |d| d.mark_running());

        let result = task_state.pipeline.process(&event).await;

        task_state
            .deliveries
            .lock()
            .await
            .update(&task_id, |d| d.finish(&result));
        result
    });

    match task.await {
        Ok(result) => {
            info!("Delivery {} finished: {}", delivery_id, result.label());
            result
        }
        Err(e) => {
            let err = DeployError::PipelineAborted(e.to_string());
            error!("Delivery {} failed: {}", delivery_id, err);
            let result = PipelineResult::InternalError {
                message: err.to_string(),
            };
            state
                .deliveries
                .lock()
                .await
                .update(&delivery_id, |d| d.finish(&result));
            result
        }
    }
}
