//! Push-event orchestration: filter, test, then deploy.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::DeployConfig;
use crate::runner::CommandRunner;
use crate::stages::{DeployPlan, TestPlan, run_deploy, run_tests};
use crate::webhook::WebhookEvent;

/// Terminal state of one webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineResult {
    Deployed,
    EventIgnored { event: String },
    TestsFailed { summary: String },
    DeployFailed { reason: String },
    InternalError { message: String },
}

impl PipelineResult {
    pub fn label(&self) -> &'static str {
        match self {
            PipelineResult::Deployed => "deployed",
            PipelineResult::EventIgnored { .. } => "ignored",
            PipelineResult::TestsFailed { .. } => "tests_failed",
            PipelineResult::DeployFailed { .. } => "deploy_failed",
            PipelineResult::InternalError { .. } => "error",
        }
    }

    pub fn message(&self) -> Option<String> {
        match self {
            PipelineResult::Deployed => None,
            PipelineResult::EventIgnored { event } => Some(format!("ignored event '{}'", event)),
            PipelineResult::TestsFailed { summary } => Some(summary.clone()),
            PipelineResult::DeployFailed { reason } => Some(reason.clone()),
            PipelineResult::InternalError { message } => Some(message.clone()),
        }
    }

    pub fn is_internal_error(&self) -> bool {
        matches!(self, PipelineResult::InternalError { .. })
    }
}

/// Runs the test stage and, only when it passes, the deploy stage.
pub struct Pipeline {
    config: Arc<DeployConfig>,
    runner: Arc<dyn CommandRunner>,
}

impl Pipeline {
    pub fn new(config: Arc<DeployConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub async fn process(&self, event: &WebhookEvent) -> PipelineResult {
        if !event.is_push() {
            info!("Ignoring '{}' event", event.event_kind);
            return PipelineResult::EventIgnored {
                event: event.event_kind.clone(),
            };
        }

        info!(
            "Push to '{}' branch '{}' ({} commits, head {}), clone url '{}'",
            event.repository_full_name,
            event.branch,
            event.commit_count,
            event.head_sha.as_deref().unwrap_or("-"),
            event.clone_url
        );

        let plan = TestPlan::from_config(&self.config);
        let tests = run_tests(self.runner.as_ref(), &plan).await;
        if !tests.passed {
            let summary = tests.failure_summary();
            warn!("Tests failed, deployment cancelled: {}", summary);
            return PipelineResult::TestsFailed { summary };
        }
        if !tests.skipped.is_empty() {
            warn!("Skipped missing test files: {}", tests.skipped.join(", "));
        }

        let deploy = run_deploy(self.runner.as_ref(), &DeployPlan::from_config(&self.config)).await;
        if deploy.passed {
            info!("Deployment of '{}' completed", event.repository_full_name);
            PipelineResult::Deployed
        } else {
            let reason = deploy.failure_summary();
            error!("Deployment failed: {}", reason);
            PipelineResult::DeployFailed { reason }
        }
    }
}
