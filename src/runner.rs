//! Stages submitted code and runs it through a [`Sandbox`].

use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::execution::{Execution, ExecutionResult, Outcome};
use crate::sandbox::{ProcessSandbox, RunConfig, Sandbox, SandboxOutcome};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Runs untrusted scripts and reports a structured result.
///
/// Every call stages its script in a fresh directory that is removed when the
/// call ends, so concurrent calls never share a working file.
#[derive(Clone)]
pub struct Runner {
    config: RunnerConfig,
    sandbox: Arc<dyn Sandbox>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("sandbox", &self.sandbox.name())
            .finish()
    }
}

/// A per-call working directory holding the staged script.
struct Staged {
    dir: TempDir,
    script: PathBuf,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self::with_sandbox(config, Arc::new(ProcessSandbox::new()))
    }

    pub fn with_sandbox(config: RunnerConfig, sandbox: Arc<dyn Sandbox>) -> Self {
        Self { config, sandbox }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Executes `code` and returns its result. Never fails.
    pub async fn run(&self, code: &str) -> ExecutionResult {
        self.execute(code, &CancellationToken::new()).await.result
    }

    /// Like [`run`](Self::run), but the child is killed as soon as `cancel` fires.
    pub async fn run_with_cancel(&self, code: &str, cancel: &CancellationToken) -> ExecutionResult {
        self.execute(code, cancel).await.result
    }

    /// Runs `code` and reports which terminal state the run ended in.
    pub async fn execute(&self, code: &str, cancel: &CancellationToken) -> Execution {
        let request_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("run", %request_id, code_len = code.len());
        self.execute_inner(code, cancel, request_id)
            .instrument(span)
            .await
    }

    /// Blocking form of [`run`](Self::run) for hosts without an async runtime.
    ///
    /// Must not be called from within a Tokio runtime; doing so yields a
    /// system error result instead of panicking.
    pub fn run_blocking(&self, code: &str) -> ExecutionResult {
        if tokio::runtime::Handle::try_current().is_ok() {
            return ExecutionResult::system_error(
                "run_blocking called from inside an async runtime; use run instead",
            );
        }
        match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt.block_on(self.run(code)),
            Err(e) => ExecutionResult::system_error(format!("could not start runtime: {}", e)),
        }
    }

    async fn execute_inner(
        &self,
        code: &str,
        cancel: &CancellationToken,
        request_id: uuid::Uuid,
    ) -> Execution {
        debug!("Writing working file");
        let staged = match self.stage(code, request_id) {
            Ok(staged) => staged,
            Err(e) => return launch_failed(e),
        };
        debug!(script = ?staged.script, "Working file written");

        let mut command: Vec<OsString> =
            Vec::with_capacity(self.config.interpreter_args.len() + 2);
        command.push(self.config.interpreter.clone().into());
        command.extend(self.config.interpreter_args.iter().map(OsString::from));
        command.push(staged.script.clone().into_os_string());

        let run_config = RunConfig {
            run_id: request_id.to_string(),
            command,
            cwd: staged.dir.path().to_path_buf(),
            limits: self.config.limits.clone(),
        };

        let outcome = self.sandbox.execute(&run_config, cancel).await;
        let execution = match outcome {
            Ok(SandboxOutcome::Exited(result)) => {
                info!(exit_code = ?result.exit_code, signal = ?result.signal, "Completed");
                Execution {
                    outcome: Outcome::Completed,
                    result: ExecutionResult {
                        success: result.success(),
                        output: result.stdout,
                        error: result.stderr,
                    },
                }
            }
            Ok(SandboxOutcome::TimedOut) => {
                warn!(timeout = %self.config.limits.describe_timeout(), "Timed out");
                Execution {
                    outcome: Outcome::TimedOut,
                    result: ExecutionResult::failure(format!(
                        "Error: The execution timed out (took longer than {}).",
                        self.config.limits.describe_timeout()
                    )),
                }
            }
            Ok(SandboxOutcome::Cancelled) => {
                info!("Cancelled");
                Execution {
                    outcome: Outcome::Cancelled,
                    result: ExecutionResult::failure("Error: The execution was cancelled."),
                }
            }
            Err(e) => launch_failed(e),
        };

        cleanup(staged);
        execution
    }

    fn stage(&self, code: &str, request_id: uuid::Uuid) -> Result<Staged, RunnerError> {
        let root = self.config.work_root();
        let dir = tempfile::Builder::new()
            .prefix(&format!("qa-run-{}-", request_id))
            .tempdir_in(&root)
            .map_err(|source| RunnerError::CreateWorkingDir { path: root, source })?;
        let script = dir.path().join(&self.config.script_name);
        write_script(&script, code)?;
        Ok(Staged { dir, script })
    }
}

fn write_script(path: &Path, code: &str) -> Result<(), RunnerError> {
    std::fs::write(path, code).map_err(|source| RunnerError::WriteWorkingFile {
        path: path.to_path_buf(),
        source,
    })
}

fn launch_failed(e: RunnerError) -> Execution {
    warn!(error = %e, "Launch failed");
    Execution {
        outcome: Outcome::LaunchFailed,
        result: ExecutionResult::system_error(e),
    }
}

fn cleanup(staged: Staged) {
    let path = staged.dir.path().to_path_buf();
    if let Err(e) = staged.dir.close() {
        warn!(dir = ?path, error = %e, "Failed to remove working directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use async_trait::async_trait;
    use std::time::Duration;

    fn sh_runner(root: &Path, timeout: Duration) -> Runner {
        Runner::new(RunnerConfig {
            interpreter: "sh".to_string(),
            interpreter_args: Vec::new(),
            work_root: Some(root.to_path_buf()),
            script_name: "script.sh".to_string(),
            limits: Limits::with_timeout(timeout),
        })
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_success_maps_streams() {
        let root = tempfile::tempdir().unwrap();
        let runner = sh_runner(root.path(), Duration::from_secs(10));
        let result = runner.run("echo hello; echo warn >&2").await;
        assert_eq!(
            result,
            ExecutionResult {
                success: true,
                output: "hello\n".to_string(),
                error: "warn\n".to_string(),
            }
        );
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_timeout_discards_partial_output() {
        let root = tempfile::tempdir().unwrap();
        let runner = sh_runner(root.path(), Duration::from_millis(300));
        let execution = runner
            .execute("echo partial; sleep 30", &CancellationToken::new())
            .await;
        assert_eq!(execution.outcome, Outcome::TimedOut);
        assert!(!execution.result.success);
        assert_eq!(execution.result.output, "");
        assert!(execution.result.error.contains("timed out"));
        assert!(execution.result.error.contains("300 ms"));
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_system_error() {
        let root = tempfile::tempdir().unwrap();
        let runner = Runner::new(RunnerConfig {
            interpreter: "/nonexistent/python-for-qa-runner".to_string(),
            work_root: Some(root.path().to_path_buf()),
            ..Default::default()
        });
        let execution = runner.execute("print(1)", &CancellationToken::new()).await;
        assert_eq!(execution.outcome, Outcome::LaunchFailed);
        assert!(execution.result.error.starts_with("System Error: "));
        assert_eq!(execution.result.output, "");
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_unwritable_work_root_is_system_error() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("does-not-exist");
        let runner = sh_runner(&missing, Duration::from_secs(10));
        let result = runner.run("echo never").await;
        assert!(!result.success);
        assert!(result.error.starts_with("System Error: "));
        assert!(result.error.contains("working directory"));
    }

    #[tokio::test]
    async fn test_cancel_token() {
        let root = tempfile::tempdir().unwrap();
        let runner = sh_runner(root.path(), Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = runner.run_with_cancel("sleep 30", &cancel).await;
        assert!(!result.success);
        assert_eq!(result.error, "Error: The execution was cancelled.");
    }

    #[test]
    fn test_run_blocking_outside_runtime() {
        let root = tempfile::tempdir().unwrap();
        let runner = sh_runner(root.path(), Duration::from_secs(10));
        let result = runner.run_blocking("printf direct");
        assert!(result.success);
        assert_eq!(result.output, "direct");
    }

    #[tokio::test]
    async fn test_run_blocking_inside_runtime_does_not_panic() {
        let root = tempfile::tempdir().unwrap();
        let runner = sh_runner(root.path(), Duration::from_secs(10));
        let result = runner.run_blocking("printf direct");
        assert!(!result.success);
        assert!(result.error.starts_with("System Error: "));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_non_utf8_work_root_is_passed_through() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join(OsStr::from_bytes(b"root-\xff"));
        std::fs::create_dir(&root).unwrap();
        let runner = sh_runner(&root, Duration::from_secs(10));
        let result = runner.run("echo ok").await;
        assert!(result.success, "{}", result.error);
        assert_eq!(result.output, "ok\n");
        assert_eq!(entries(&root), 0);
    }

    struct FailingSandbox;

    #[async_trait]
    impl Sandbox for FailingSandbox {
        fn name(&self) -> &str {
            "failing"
        }

        async fn execute(
            &self,
            config: &RunConfig,
            _cancel: &CancellationToken,
        ) -> Result<SandboxOutcome, RunnerError> {
            assert!(Path::new(config.command.last().unwrap()).exists());
            Err(RunnerError::Internal("backend unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_sandbox_error_is_normalized() {
        let root = tempfile::tempdir().unwrap();
        let runner = Runner::with_sandbox(
            RunnerConfig {
                work_root: Some(root.path().to_path_buf()),
                ..Default::default()
            },
            Arc::new(FailingSandbox),
        );
        let result = runner.run("print('x')").await;
        assert_eq!(result, ExecutionResult::system_error("backend unavailable"));
        assert_eq!(entries(root.path()), 0);
    }
}
