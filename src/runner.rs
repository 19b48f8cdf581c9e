//! Subprocess supervision: launch, capture, deadline, reap.

use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Number of trailing characters shown when output is logged or displayed.
pub const OUTPUT_TAIL_CHARS: usize = 4000;

/// How long captured pipes may stay open after the child itself has exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// How a subprocess invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed,
    TimedOut,
    LaunchFailed,
}

/// A fully described command invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    /// Applied on top of the inherited environment.
    pub env: Vec<(String, OsString)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Looks up an override by name (last one wins, like `Command::env`).
    pub fn env_value(&self, key: &str) -> Option<&OsString> {
        self.env.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Human readable command line, used in logs.
    pub fn display(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

/// Outcome of one subprocess invocation. Never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    /// Real exit code, or -1 when the process never exited with one.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub outcome: CommandOutcome,
    pub duration: Duration,
}

impl CommandResult {
    pub fn completed(exit_code: i32, stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            outcome: CommandOutcome::Completed,
            duration,
        }
    }

    pub fn timed_out(stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            exit_code: -1,
            stdout,
            stderr,
            outcome: CommandOutcome::TimedOut,
            duration,
        }
    }

    pub fn launch_failed(error: String, duration: Duration) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: error,
            outcome: CommandOutcome::LaunchFailed,
            duration,
        }
    }

    /// Completed with exit code 0.
    pub fn success(&self) -> bool {
        self.outcome == CommandOutcome::Completed && self.exit_code == 0
    }

    pub fn stdout_tail(&self) -> &str {
        tail_chars(&self.stdout, OUTPUT_TAIL_CHARS)
    }

    pub fn stderr_tail(&self) -> &str {
        tail_chars(&self.stderr, OUTPUT_TAIL_CHARS)
    }

    /// Tail of stderr, or of stdout when stderr is empty.
    pub fn diagnostic_tail(&self) -> &str {
        if self.stderr.is_empty() {
            self.stdout_tail()
        } else {
            self.stderr_tail()
        }
    }
}

/// Returns the last `max` characters of `text`, respecting char boundaries.
pub fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

pub type RunFuture<'a> = Pin<Box<dyn Future<Output = CommandResult> + Send + 'a>>;

/// Seam between the stages and the OS process table.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunFuture<'a>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunFuture<'a> {
        Box::pin(run_command(spec))
    }
}

/// Launch `spec`, wait up to its timeout and collect the result.
pub async fn run_command(spec: &CommandSpec) -> CommandResult {
    let started = Instant::now();

    let mut std_command = std::process::Command::new(&spec.program);
    std_command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_os_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &spec.working_dir {
        std_command.current_dir(dir);
    }
    own_process_group(&mut std_command);

    let mut command = Command::from(std_command);
    command.kill_on_drop(true);

    debug!("Spawning {}", spec.display());
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("Failed to start '{}': {}", spec.display(), e);
            return CommandResult::launch_failed(
                format!("failed to start {}: {}", spec.program.display(), e),
                started.elapsed(),
            );
        }
    };

    let (stdout_buf, stdout_task) = capture(child.stdout.take());
    let (stderr_buf, stderr_task) = capture(child.stderr.take());

    let waited = tokio::time::timeout(spec.timeout, child.wait()).await;
    let (outcome, exit_code) = match waited {
        Ok(Ok(status)) => (CommandOutcome::Completed, status.code().unwrap_or(-1)),
        Ok(Err(e)) => {
            warn!("Failed to wait for '{}': {}", spec.display(), e);
            terminate(&mut child).await;
            drain(stdout_task).await;
            drain(stderr_task).await;
            let mut stderr = take(&stderr_buf);
            stderr.push_str(&format!("failed to wait for process: {}", e));
            return CommandResult {
                exit_code: -1,
                stdout: take(&stdout_buf),
                stderr,
                outcome: CommandOutcome::LaunchFailed,
                duration: started.elapsed(),
            };
        }
        Err(_) => {
            warn!(
                "'{}' exceeded its {:?} deadline, terminating",
                spec.display(),
                spec.timeout
            );
            terminate(&mut child).await;
            (CommandOutcome::TimedOut, -1)
        }
    };

    drain(stdout_task).await;
    drain(stderr_task).await;

    CommandResult {
        exit_code,
        stdout: take(&stdout_buf),
        stderr: take(&stderr_buf),
        outcome,
        duration: started.elapsed(),
    }
}

type SharedBuf = Arc<Mutex<Vec<u8>>>;

/// Read a child pipe into a shared buffer so partial output survives an abort.
fn capture<R>(stream: Option<R>) -> (SharedBuf, Option<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf: SharedBuf = Arc::new(Mutex::new(Vec::new()));
    let task = stream.map(|mut stream| {
        let buf = Arc::clone(&buf);
        tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut guard) = buf.lock() {
                            guard.extend_from_slice(&chunk[..n]);
                        }
                    }
                }
            }
        })
    });
    (buf, task)
}

async fn drain(task: Option<JoinHandle<()>>) {
    if let Some(mut task) = task {
        if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut task)
            .await
            .is_err()
        {
            debug!("Output pipe still open after grace period, detaching reader");
            task.abort();
        }
    }
}

fn take(buf: &SharedBuf) -> String {
    match buf.lock() {
        Ok(mut guard) => String::from_utf8_lossy(&std::mem::take(&mut *guard)).into_owned(),
        Err(_) => String::new(),
    }
}

/// Kill the child's whole process group, then kill and reap the child itself.
async fn terminate(child: &mut Child) {
    kill_process_group(child);
    if let Err(e) = child.kill().await {
        debug!("Child already gone while terminating: {}", e);
    }
}

/// Make the child lead a new process group so a timeout can kill its descendants.
#[cfg(unix)]
fn own_process_group(command: &mut std::process::Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_command: &mut std::process::Command) {}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    // The child leads its own group, so its pid is the group id.
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!("Process group {} already gone: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}


#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> CommandSpec {
        CommandSpec::new("/bin/sh", timeout).arg("-c").arg(script)
    }

    #[tokio::test]
    async fn captures_exit_code_and_streams_separately() {
        let spec = sh("echo out; echo err >&2; exit 3", Duration::from_secs(10));
        let result = run_command(&spec).await;

        assert_eq!(result.outcome, CommandOutcome::Completed);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert!(!result.success());
    }

    #[tokio::test]
    async fn zero_exit_is_success() {
        let result = run_command(&sh("true", Duration::from_secs(10))).await;
        assert!(result.success());
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn deadline_kills_process() {
        let started = Instant::now();
        let result = run_command(&sh("echo begun; sleep 30", Duration::from_millis(300))).await;

        assert_eq!(result.outcome, CommandOutcome::TimedOut);
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.stdout.trim(), "begun");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn deadline_kills_background_children_too() {
        let started = Instant::now();
        let result = run_command(&sh("sleep 30 & sleep 30", Duration::from_millis(300))).await;

        assert_eq!(result.outcome, CommandOutcome::TimedOut);
        // The grandchild holds the pipes; it must die with the group.
        assert!(started.elapsed() < OUTPUT_DRAIN_GRACE);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_signals_the_whole_process_group() {
        let spec = sh("sleep 30 & echo $!; wait", Duration::from_millis(300));
        let result = run_command(&spec).await;
        assert_eq!(result.outcome, CommandOutcome::TimedOut);

        let grandchild: u32 = result.stdout.trim().parse().unwrap();
        let stat = format!("/proc/{}/stat", grandchild);
        let mut gone = false;
        for _ in 0..50 {
            // Dead means reaped, or a zombie nobody has reaped yet.
            gone = match std::fs::read_to_string(&stat) {
                Err(_) => true,
                Ok(text) => text
                    .rsplit(')')
                    .next()
                    .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            };
            if gone {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "background sleep {} survived the timeout", grandchild);
    }

    #[tokio::test]
    async fn missing_program_is_launch_failure() {
        let spec = CommandSpec::new("/definitely/not/here", Duration::from_secs(5));
        let result = run_command(&spec).await;

        assert_eq!(result.outcome, CommandOutcome::LaunchFailed);
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("/definitely/not/here"));
    }

    #[tokio::test]
    async fn env_overrides_merge_with_inherited_environment() {
        let spec = sh(
            "printf '%s|' \"$PUSH_DEPLOY_MARKER\"; test -n \"$PATH\" && printf inherited",
            Duration::from_secs(10),
        )
        .env("PUSH_DEPLOY_MARKER", "value");
        let result = run_command(&spec).await;

        assert!(result.success(), "{}", result.stderr);
        assert_eq!(result.stdout, "value|inherited");
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("pwd -P", Duration::from_secs(10)).current_dir(dir.path());
        let result = run_command(&spec).await;

        assert!(result.success());
        assert_eq!(
            PathBuf::from(result.stdout.trim()),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn tail_keeps_last_characters_on_char_boundaries() {
        assert_eq!(tail_chars("short", 10), "short");
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ééééé", 2), "éé");
    }

    #[test]
    fn diagnostic_tail_prefers_stderr() {
        let both = CommandResult::completed(1, "out".into(), "err".into(), Duration::ZERO);
        assert_eq!(both.diagnostic_tail(), "err");
        let only_out = CommandResult::completed(1, "out".into(), String::new(), Duration::ZERO);
        assert_eq!(only_out.diagnostic_tail(), "out");
    }

    #[test]
    fn display_joins_program_and_args() {
        let spec = CommandSpec::new("/bin/bash", Duration::from_secs(1)).arg("deploy.sh");
        assert_eq!(spec.display(), "/bin/bash deploy.sh");
    }
}
