pub mod api;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod runner;
pub mod stages;
pub mod webhook;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::delivery::DeliveryLog;
use crate::error::DeployError;
use crate::pipeline::Pipeline;
use crate::runner::CommandRunner;

/// A test file to run, with the label used in logs.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TestFile {
    pub label: String,
    pub file: String,
}

impl TestFile {
    pub fn new(label: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            file: file.into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeployConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub app_dir: PathBuf,
    /// Defaults to `<app_dir>/tests`.
    pub test_dir: Option<PathBuf>,
    pub deploy_script: PathBuf,
    /// Project-local interpreter, defaults to `<app_dir>/venv/bin/python`.
    pub interpreter: Option<PathBuf>,
    #[serde(default = "default_fallback_interpreter")]
    pub fallback_interpreter: PathBuf,
    #[serde(default = "default_test_runner_module")]
    pub test_runner_module: String,
    #[serde(default = "default_test_flags")]
    pub test_flags: Vec<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,
    #[serde(default = "default_deploy_timeout_secs")]
    pub deploy_timeout_secs: u64,
    #[serde(default = "default_deploy_shell")]
    pub deploy_shell: PathBuf,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_test_files", rename = "test_file")]
    pub test_files: Vec<TestFile>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_fallback_interpreter() -> PathBuf {
    PathBuf::from("python3")
}

fn default_test_runner_module() -> String {
    "pytest".to_string()
}

fn default_test_flags() -> Vec<String> {
    vec!["-v".to_string()]
}

fn default_base_url() -> String {
    "http://127.0.0.1:8181".to_string()
}

fn default_test_timeout_secs() -> u64 {
    300
}

fn default_deploy_timeout_secs() -> u64 {
    600
}

fn default_deploy_shell() -> PathBuf {
    PathBuf::from("/bin/bash")
}

// GitHub caps webhook payloads at 25 MB.
fn default_max_body_bytes() -> usize {
    25 * 1024 * 1024
}

fn default_history_size() -> usize {
    20
}

fn default_test_files() -> Vec<TestFile> {
    vec![
        TestFile::new("Unit tests", "test_unit.py"),
        TestFile::new("API tests", "test_api.py"),
    ]
}

impl DeployConfig {
    /// Configuration with every optional setting at its default.
    pub fn new(app_dir: impl Into<PathBuf>, deploy_script: impl Into<PathBuf>) -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            app_dir: app_dir.into(),
            test_dir: None,
            deploy_script: deploy_script.into(),
            interpreter: None,
            fallback_interpreter: default_fallback_interpreter(),
            test_runner_module: default_test_runner_module(),
            test_flags: default_test_flags(),
            base_url: default_base_url(),
            test_timeout_secs: default_test_timeout_secs(),
            deploy_timeout_secs: default_deploy_timeout_secs(),
            deploy_shell: default_deploy_shell(),
            max_body_bytes: default_max_body_bytes(),
            history_size: default_history_size(),
            log_dir: None,
            test_files: default_test_files(),
        }
    }

    pub fn test_dir(&self) -> PathBuf {
        self.test_dir
            .clone()
            .unwrap_or_else(|| self.app_dir.join("tests"))
    }

    pub fn local_interpreter(&self) -> PathBuf {
        self.interpreter
            .clone()
            .unwrap_or_else(|| self.app_dir.join("venv").join("bin").join("python"))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Apply environment overrides. `lookup` reads a variable by name.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT").and_then(|p| p.parse::<u16>().ok()) {
            self.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), DeployError> {
        if self.port == 0 {
            return Err(DeployError::ConfigError("port must be non-zero".to_string()));
        }
        if self.test_timeout_secs == 0 || self.deploy_timeout_secs == 0 {
            return Err(DeployError::ConfigError(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse configuration from TOML text
pub fn parse_config(config_str: &str) -> Result<DeployConfig, DeployError> {
    let config: DeployConfig = toml::from_str(config_str)?;
    config.validate()?;
    Ok(config)
}

/// Load and parse the configuration file, then apply environment overrides
pub fn load_config(path: impl AsRef<Path>) -> Result<DeployConfig, DeployError> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path).map_err(|e| {
        DeployError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    let mut config: DeployConfig = toml::from_str(&config_str).map_err(|e| {
        DeployError::ConfigError(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })?;
    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}

pub struct AppState {
    pub config: Arc<DeployConfig>,
    pub pipeline: Pipeline,
    /// Held for the whole pipeline of one delivery.
    pub pipeline_lock: Mutex<()>,
    pub deliveries: Mutex<DeliveryLog>,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: DeployConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let config = Arc::new(config);
        Self {
            pipeline: Pipeline::new(Arc::clone(&config), runner),
            pipeline_lock: Mutex::new(()),
            deliveries: Mutex::new(DeliveryLog::new(config.history_size)),
            config,
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<AppState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config(
            r#"
            app_dir = "/srv/app"
            deploy_script = "/srv/app/deploy.sh"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.test_dir(), PathBuf::from("/srv/app/tests"));
        assert_eq!(
            config.local_interpreter(),
            PathBuf::from("/srv/app/venv/bin/python")
        );
        assert_eq!(config.test_timeout_secs, 300);
        assert_eq!(config.deploy_timeout_secs, 600);
        assert_eq!(config.base_url, "http://127.0.0.1:8181");
        assert_eq!(config.test_files, default_test_files());
    }

    #[test]
    fn test_file_tables_replace_defaults() {
        let config = parse_config(
            r#"
            port = 9000
            app_dir = "/srv/app"
            test_dir = "/srv/checks"
            deploy_script = "/srv/app/deploy.sh"

            [[test_file]]
            label = "Smoke"
            file = "test_smoke.py"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.test_dir(), PathBuf::from("/srv/checks"));
        assert_eq!(config.test_files, vec![TestFile::new("Smoke", "test_smoke.py")]);
    }

    #[test]
    fn missing_required_field_is_parse_error() {
        let err = parse_config(r#"app_dir = "/srv/app""#).unwrap_err();
        assert!(matches!(err, DeployError::TomlParseError(_)));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = parse_config(
            r#"
            app_dir = "/srv/app"
            deploy_script = "/srv/app/deploy.sh"
            deploy_timeout_secs = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, DeployError::ConfigError(_)));
    }

    #[test]
    fn port_override_from_environment() {
        let mut config = DeployConfig::new("/srv/app", "/srv/app/deploy.sh");
        config.apply_env_overrides(|key| (key == "PORT").then(|| "9191".to_string()));
        assert_eq!(config.port, 9191);

        config.apply_env_overrides(|_| Some("not-a-port".to_string()));
        assert_eq!(config.port, 9191);
    }

    #[test]
    fn load_config_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }
}
