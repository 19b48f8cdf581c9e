use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::pipeline::PipelineResult;
use crate::webhook::WebhookEvent;

/// Represents the status of a webhook delivery
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Running,
    Deployed,
    Ignored,
    TestsFailed,
    DeployFailed,
    Error,
}

impl From<&PipelineResult> for DeliveryStatus {
    fn from(result: &PipelineResult) -> Self {
        match result {
            PipelineResult::Deployed => DeliveryStatus::Deployed,
            PipelineResult::EventIgnored { .. } => DeliveryStatus::Ignored,
            PipelineResult::TestsFailed { .. } => DeliveryStatus::TestsFailed,
            PipelineResult::DeployFailed { .. } => DeliveryStatus::DeployFailed,
            PipelineResult::InternalError { .. } => DeliveryStatus::Error,
        }
    }
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::Running => "running",
            DeliveryStatus::Deployed => "deployed",
            DeliveryStatus::Ignored => "ignored",
            DeliveryStatus::TestsFailed => "tests_failed",
            DeliveryStatus::DeployFailed => "deploy_failed",
            DeliveryStatus::Error => "error",
        }
    }
}

/// One received webhook delivery and what became of it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub event: String,
    pub repository: String,
    pub branch: String,
    pub commit_count: usize,
    pub head_sha: Option<String>,
    pub status: DeliveryStatus,
    pub received_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl Delivery {
    /// Create a new delivery in Queued status
    pub fn from_event(event: &WebhookEvent) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            event: event.event_kind.clone(),
            repository: event.repository_full_name.clone(),
            branch: event.branch.clone(),
            commit_count: event.commit_count,
            head_sha: event.head_sha.clone(),
            status: DeliveryStatus::Queued,
            received_at: Utc::now(),
            completed_at: None,
            message: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = DeliveryStatus::Running;
    }

    /// Record the terminal pipeline state
    pub fn finish(&mut self, result: &PipelineResult) {
        self.status = DeliveryStatus::from(result);
        self.completed_at = Some(Utc::now());
        self.message = result.message();
    }
}

/// Bounded in-memory history of deliveries, oldest evicted first.
pub struct DeliveryLog {
    entries: VecDeque<Delivery>,
    max_entries: usize,
}

impl DeliveryLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries),
            max_entries,
        }
    }

    pub fn record(&mut self, delivery: Delivery) {
        if self.max_entries == 0 {
            return;
        }
        while self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(delivery);
    }

    /// Apply `f` to the delivery with `id`; returns false if it was evicted.
    pub fn update<F>(&mut self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Delivery),
    {
        match self.entries.iter_mut().find(|d| d.id == id) {
            Some(delivery) => {
                f(delivery);
                true
            }
            None => false,
        }
    }

    /// Most recent first
    pub fn recent(&self, limit: usize) -> Vec<Delivery> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(kind: &str) -> Delivery {
        Delivery::from_event(&WebhookEvent::from_delivery(Some(kind), b"{}"))
    }

    #[test]
    fn lifecycle_follows_pipeline_result() {
        let mut d = delivery("push");
        assert_eq!(d.status, DeliveryStatus::Queued);
        d.mark_running();
        assert_eq!(d.status, DeliveryStatus::Running);

        d.finish(&PipelineResult::TestsFailed {
            summary: "Unit tests (exit code 1)".to_string(),
        });
        assert_eq!(d.status, DeliveryStatus::TestsFailed);
        assert!(d.completed_at.is_some());
        assert_eq!(d.message.as_deref(), Some("Unit tests (exit code 1)"));
    }

    #[test]
    fn history_is_bounded_and_newest_first() {
        let mut log = DeliveryLog::new(2);
        let first = delivery("a");
        let first_id = first.id.clone();
        log.record(first);
        log.record(delivery("b"));
        log.record(delivery("c"));

        assert!(!log.update(&first_id, |d| d.mark_running()));
        let events: Vec<String> = log.recent(10).into_iter().map(|d| d.event).collect();
        assert_eq!(events, vec!["c", "b"]);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut log = DeliveryLog::new(0);
        log.record(delivery("push"));
        assert!(log.recent(10).is_empty());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&DeliveryStatus::DeployFailed).unwrap();
        assert_eq!(json, "\"deploy_failed\"");
        assert_eq!(DeliveryStatus::DeployFailed.as_str(), "deploy_failed");
    }
}
