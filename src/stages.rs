//! Test and deploy stages built on top of a [`CommandRunner`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::runner::{CommandOutcome, CommandResult, CommandRunner, CommandSpec};
use crate::{DeployConfig, TestFile};

/// Module search path handed to the test interpreter.
pub const MODULE_PATH_VAR: &str = "PYTHONPATH";
pub const BASE_URL_VAR: &str = "BASE_URL";

/// One command executed as part of a stage.
#[derive(Debug, Clone)]
pub struct StageItem {
    pub label: String,
    pub command: String,
    pub result: CommandResult,
}

/// Pass/fail verdict of a stage with the results that produced it.
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    pub passed: bool,
    pub items: Vec<StageItem>,
    /// Labels of configured items that were not found on disk.
    pub skipped: Vec<String>,
    /// Set when the stage failed before running anything.
    pub detail: Option<String>,
}

impl StageOutcome {
    pub fn failures(&self) -> impl Iterator<Item = &StageItem> {
        self.items.iter().filter(|item| !item.result.success())
    }

    /// Short description of why the stage did not pass.
    pub fn failure_summary(&self) -> String {
        if let Some(detail) = &self.detail {
            return detail.clone();
        }
        let labels: Vec<String> = self
            .failures()
            .map(|item| match item.result.outcome {
                CommandOutcome::Completed => {
                    format!("{} (exit code {})", item.label, item.result.exit_code)
                }
                CommandOutcome::TimedOut => format!("{} (timed out)", item.label),
                CommandOutcome::LaunchFailed => format!("{} (could not start)", item.label),
            })
            .collect();
        labels.join(", ")
    }
}

/// Everything the test stage needs, resolved from configuration.
#[derive(Debug, Clone)]
pub struct TestPlan {
    pub app_dir: PathBuf,
    pub test_dir: PathBuf,
    pub files: Vec<TestFile>,
    pub interpreter: PathBuf,
    pub runner_module: String,
    pub flags: Vec<String>,
    pub base_url: String,
    pub timeout: Duration,
}

impl TestPlan {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            app_dir: config.app_dir.clone(),
            test_dir: config.test_dir(),
            files: config.test_files.clone(),
            interpreter: resolve_interpreter(config),
            runner_module: config.test_runner_module.clone(),
            flags: config.test_flags.clone(),
            base_url: config.base_url.clone(),
            timeout: Duration::from_secs(config.test_timeout_secs),
        }
    }

    fn command_for(&self, test_path: &Path, env: &[(String, OsString)]) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.interpreter, self.timeout)
            .arg("-m")
            .arg(&self.runner_module)
            .arg(test_path)
            .current_dir(&self.app_dir);
        for flag in &self.flags {
            spec = spec.arg(flag);
        }
        for (key, value) in env {
            spec = spec.env(key.clone(), value.clone());
        }
        spec
    }
}

/// Prefer the project-local interpreter, fall back to the configured default.
pub fn resolve_interpreter(config: &DeployConfig) -> PathBuf {
    let local = config.local_interpreter();
    if local.exists() {
        local
    } else {
        config.fallback_interpreter.clone()
    }
}

/// Environment overrides for test runs. `lookup` reads the inherited environment.
pub fn test_environment(
    plan: &TestPlan,
    lookup: impl Fn(&str) -> Option<OsString>,
) -> Vec<(String, OsString)> {
    let search_path = std::env::join_paths([&plan.app_dir, &plan.test_dir]).unwrap_or_else(|_| {
        OsString::from(format!(
            "{}:{}",
            plan.app_dir.display(),
            plan.test_dir.display()
        ))
    });

    let mut env = vec![(MODULE_PATH_VAR.to_string(), search_path)];
    if lookup(BASE_URL_VAR).is_none() {
        env.push((BASE_URL_VAR.to_string(), OsString::from(&plan.base_url)));
    }
    env
}

/// Run every configured test file in order. A failing file never stops the
/// remaining ones; missing files are skipped without affecting the verdict.
pub async fn run_tests(runner: &dyn CommandRunner, plan: &TestPlan) -> StageOutcome {
    info!("Running tests from {}", plan.test_dir.display());
    let env = test_environment(plan, |key| std::env::var_os(key));

    let mut outcome = StageOutcome {
        passed: true,
        ..StageOutcome::default()
    };

    for test in &plan.files {
        let path = plan.test_dir.join(&test.file);
        if !path.exists() {
            warn!("{}: test file not found - {}", test.label, path.display());
            outcome.skipped.push(test.label.clone());
            continue;
        }

        let spec = plan.command_for(&path, &env);
        info!("Running {}: {}", test.label, spec.display());
        let result = runner.run(&spec).await;

        match result.outcome {
            CommandOutcome::Completed if result.exit_code == 0 => {
                info!("{}: passed ({:.1?})", test.label, result.duration);
            }
            CommandOutcome::Completed => {
                error!("{}: failed with exit code {}", test.label, result.exit_code);
                error!("{}", result.diagnostic_tail());
            }
            CommandOutcome::TimedOut => {
                error!("{}: timed out after {:?}", test.label, spec.timeout);
            }
            CommandOutcome::LaunchFailed => {
                error!("{}: could not start - {}", test.label, result.stderr_tail());
            }
        }

        if !result.success() {
            outcome.passed = false;
        }
        outcome.items.push(StageItem {
            label: test.label.clone(),
            command: spec.display(),
            result,
        });
    }

    if outcome.items.is_empty() {
        warn!("No test files found; nothing was executed");
    }
    outcome
}

/// Deploy script invocation settings.
#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub script: PathBuf,
    pub shell: PathBuf,
    pub timeout: Duration,
}

impl DeployPlan {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            script: config.deploy_script.clone(),
            shell: config.deploy_shell.clone(),
            timeout: Duration::from_secs(config.deploy_timeout_secs),
        }
    }
}

/// Run the deploy script once. A missing script fails without spawning anything.
pub async fn run_deploy(runner: &dyn CommandRunner, plan: &DeployPlan) -> StageOutcome {
    if !plan.script.exists() {
        let detail = format!("deploy script not found: {}", plan.script.display());
        error!("{}", detail);
        return StageOutcome {
            passed: false,
            detail: Some(detail),
            ..StageOutcome::default()
        };
    }

    let spec = CommandSpec::new(&plan.shell, plan.timeout).arg(&plan.script);
    info!("Running deploy: {}", spec.display());
    let result = runner.run(&spec).await;

    match result.outcome {
        CommandOutcome::Completed if result.exit_code == 0 => {
            info!("Deploy finished successfully ({:.1?})", result.duration);
            info!("Deploy output:\n{}", result.stdout);
        }
        CommandOutcome::Completed => {
            error!("Deploy failed with exit code {}", result.exit_code);
            error!("Deploy stderr:\n{}", result.stderr);
        }
        CommandOutcome::TimedOut => {
            error!("Deploy timed out after {:?}", spec.timeout);
            error!("Deploy output before timeout:\n{}", result.stdout);
        }
        CommandOutcome::LaunchFailed => {
            error!("Deploy could not start: {}", result.stderr);
        }
    }

    StageOutcome {
        passed: result.success(),
        items: vec![StageItem {
            label: "deploy".to_string(),
            command: spec.display(),
            result,
        }],
        ..StageOutcome::default()
    }
}
