//! Status page and the non-webhook methods

use axum::{
    http::{Method, StatusCode},
    response::Response,
};
use chrono::Local;
use serde_json::json;
use tracing::warn;

use crate::SharedState;
use crate::api::response::{CONTENT_TYPE_HTML, CONTENT_TYPE_JSON, error_response, write_response};
use crate::delivery::Delivery;

const RECENT_DELIVERIES: usize = 10;

/// GET - HTML status page, or JSON with `?format=json`
pub async fn status_page(state: &SharedState, as_json: bool) -> Response {
    let deliveries = state.deliveries.lock().await.recent(RECENT_DELIVERIES);

    if as_json {
        let body = json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "status": "active",
            "port": state.config.port,
            "started_at": state.started_at,
            "uptime_seconds": state.start_time.elapsed().as_secs(),
            "deliveries": deliveries,
        });
        return write_response(StatusCode::OK, CONTENT_TYPE_JSON, body.to_string());
    }

    let html = render_status_html(state, &deliveries);
    write_response(StatusCode::OK, CONTENT_TYPE_HTML, html)
}

/// HEAD - headers only
pub fn head_response() -> Response {
    write_response(StatusCode::OK, CONTENT_TYPE_HTML, Vec::new())
}

pub fn unsupported_method(method: &Method) -> Response {
    warn!("Unsupported method {}", method);
    error_response(
        StatusCode::NOT_IMPLEMENTED,
        &format!("Unsupported method ({})", method),
    )
}

fn render_status_html(state: &SharedState, deliveries: &[Delivery]) -> String {
    let config = &state.config;

    let history = if deliveries.is_empty() {
        String::new()
    } else {
        let rows: String = deliveries
            .iter()
            .map(|d| {
                format!(
                    "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                    d.received_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    escape_html(&d.event),
                    escape_html(&d.repository),
                    escape_html(&d.branch),
                    d.status.as_str(),
                )
            })
            .collect();
        format!(
            "<h2>Recent deliveries</h2>\n<table>\n\
             <tr><th>Received</th><th>Event</th><th>Repository</th><th>Branch</th><th>Status</th></tr>\n\
             {rows}</table>\n"
        )
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Push Deploy Webhook</title></head>
<body>
<h1>Push Deploy Webhook Server</h1>
<p><b>Status:</b> Active</p>
<p><b>Port:</b> {port}</p>
<p><b>Time:</b> {time}</p>
<p><b>Uptime:</b> {uptime}s</p>
<p><b>App directory:</b> {app_dir}</p>
<p><b>Deploy script:</b> {script}</p>
<p>Send POST with GitHub payload to trigger deployment.</p>
{history}</body>
</html>
"#,
        port = config.port,
        time = Local::now().format("%Y-%m-%d %H:%M:%S"),
        uptime = state.start_time.elapsed().as_secs(),
        app_dir = escape_html(&config.app_dir.display().to_string()),
        script = escape_html(&config.deploy_script.display().to_string()),
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::Delivery;
    use crate::runner::ProcessRunner;
    use crate::webhook::WebhookEvent;
    use crate::{AppState, DeployConfig};
    use axum::body::to_bytes;
    use std::sync::Arc;

    fn state() -> SharedState {
        let mut config = DeployConfig::new("/srv/app", "/srv/app/deploy.sh");
        config.port = 8123;
        Arc::new(AppState::new(config, Arc::new(ProcessRunner)))
    }

    async fn body_of(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn html_page_shows_port_and_escaped_history() {
        let state = state();
        let event = WebhookEvent::from_delivery(
            Some("push"),
            br#"{"repository":{"full_name":"<evil>/repo"}}"#,
        );
        state
            .deliveries
            .lock()
            .await
            .record(Delivery::from_event(&event));

        let response = status_page(&state, false).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_of(response).await;

        assert!(body.contains("<p><b>Port:</b> 8123</p>"));
        assert!(body.contains("Send POST with GitHub payload to trigger deployment."));
        assert!(body.contains("<h2>Recent deliveries</h2>"));
        assert!(body.contains("&lt;evil&gt;/repo"));
        assert!(!body.contains("<evil>"));
        assert!(body.ends_with("</body>\n</html>\n"));
    }

    #[tokio::test]
    async fn html_page_without_history_has_no_table() {
        let body = body_of(status_page(&state(), false).await).await;

        assert!(body.starts_with("<!DOCTYPE html>"));
        assert!(body.contains("<p><b>Deploy script:</b> /srv/app/deploy.sh</p>"));
        assert!(!body.contains("<table>"));
    }

    #[tokio::test]
    async fn json_status_lists_deliveries() {
        let state = state();
        let event = WebhookEvent::from_delivery(Some("ping"), b"{}");
        state
            .deliveries
            .lock()
            .await
            .record(Delivery::from_event(&event));

        let body = body_of(status_page(&state, true).await).await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();

        assert_eq!(json["port"], 8123);
        assert_eq!(json["deliveries"][0]["event"], "ping");
        assert_eq!(json["deliveries"][0]["status"], "queued");
    }

    #[tokio::test]
    async fn head_has_no_body() {
        let response = head_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_of(response).await.is_empty());
    }

    #[tokio::test]
    async fn other_methods_are_not_implemented() {
        let response = unsupported_method(&Method::PUT);
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        assert!(body_of(response).await.contains("\"status\":\"error\""));
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_html("a<b>&\"'"), "a&lt;b&gt;&amp;&quot;&#39;");
    }
}
