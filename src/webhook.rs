//! Webhook related structures

use serde_json::Value;

/// Header carrying the GitHub event name.
pub const EVENT_HEADER: &str = "X-GitHub-Event";

/// The only event kind that starts the pipeline.
pub const PUSH_EVENT: &str = "push";

const BRANCH_PREFIX: &str = "refs/heads/";
const UNKNOWN: &str = "unknown";

/// Data extracted from one webhook delivery.
///
/// Construction never fails: a missing header or a malformed body yields
/// default fields so the delivery can still be acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub event_kind: String,
    pub repository_full_name: String,
    pub branch: String,
    pub commit_count: usize,
    pub clone_url: String,
    pub head_sha: Option<String>,
}

impl WebhookEvent {
    /// Build an event from the `X-GitHub-Event` header value and the raw body.
    pub fn from_delivery(event_header: Option<&str>, body: &[u8]) -> Self {
        let payload: Value = serde_json::from_slice(body).unwrap_or(Value::Null);

        let branch = payload
            .get("ref")
            .and_then(|r| r.as_str())
            .map(|r| r.strip_prefix(BRANCH_PREFIX).unwrap_or(r).to_string())
            .unwrap_or_default();
        let repository = payload.get("repository");

        Self {
            event_kind: event_header.unwrap_or(UNKNOWN).to_string(),
            repository_full_name: repository
                .and_then(|r| r.get("full_name"))
                .and_then(|n| n.as_str())
                .unwrap_or(UNKNOWN)
                .to_string(),
            branch,
            commit_count: payload
                .get("commits")
                .and_then(|c| c.as_array())
                .map_or(0, Vec::len),
            clone_url: repository
                .and_then(|r| r.get("clone_url"))
                .and_then(|u| u.as_str())
                .unwrap_or_default()
                .to_string(),
            head_sha: payload
                .get("after")
                .and_then(|v| v.as_str())
                .map(String::from),
        }
    }

    /// Case-sensitive exact match on the event header.
    pub fn is_push(&self) -> bool {
        self.event_kind == PUSH_EVENT
    }
}
