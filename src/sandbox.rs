//! Isolation backends that run a staged script as a child process.

use crate::config::Limits;
use crate::error::RunnerError;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Environment variable that tags every process started for one run.
///
/// Descendants inherit it even after leaving the child's process group, so
/// they can still be found and killed.
pub const RUN_ID_ENV: &str = "QA_RUNNER_RUN_ID";

/// How long output pipes may stay open once the child has exited and its
/// descendants have been killed.
const PIPE_GRACE: Duration = Duration::from_secs(1);

/// Configuration for running one command in a sandbox.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Unique per run; exported to the child as [`RUN_ID_ENV`].
    pub run_id: String,
    /// Program followed by its arguments.
    pub command: Vec<OsString>,
    pub cwd: PathBuf,
    pub limits: Limits,
}

/// Result of a command that exited on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// How a sandboxed command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxOutcome {
    Exited(RunResult),
    TimedOut,
    Cancelled,
}

/// An isolation backend.
///
/// Implementations must kill everything they started before returning,
/// whatever the outcome.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Backend name, used in logs.
    fn name(&self) -> &str;

    async fn execute(
        &self,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutcome, RunnerError>;
}

/// Plain OS process isolation.
///
/// The child gets its own process group and carries the run's tag in its
/// environment, so the whole tree it spawns can be killed at once, including
/// processes that moved to a new session. Optional rlimits are set between
/// fork and exec.
#[derive(Debug, Default, Clone)]
pub struct ProcessSandbox;

impl ProcessSandbox {
    pub fn new() -> Self {
        Self
    }
}

enum Waited {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(
        &self,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutcome, RunnerError> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| RunnerError::Internal("empty command".to_string()))?;

        info!(command = ?config.command, cwd = ?config.cwd, run_id = %config.run_id, "Running command");
        info!(timeout_ms = config.limits.timeout.as_millis() as u64,
              mem_kb = ?config.limits.mem_kb, fsize_kb = ?config.limits.fsize_kb,
              nofile = ?config.limits.nofile, nproc = ?config.limits.nproc, "Limits");

        let deadline = Instant::now() + config.limits.timeout;

        let mut std_cmd = std::process::Command::new(program);
        std_cmd
            .args(args)
            .current_dir(&config.cwd)
            .env(RUN_ID_ENV, &config.run_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate(&mut std_cmd, &config.limits);
        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: program.to_string_lossy().into_owned(),
            source,
        })?;
        let pid = child.id();
        let mut reaper = Reaper::new(pid, &config.run_id);
        info!(pid = ?pid, "Child spawned");

        let stdout = child.stdout.take().ok_or(RunnerError::Capture {
            stream: "stdout",
            reason: "pipe not available".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or(RunnerError::Capture {
            stream: "stderr",
            reason: "pipe not available".to_string(),
        })?;
        let mut stdout = Capture::start(stdout, "stdout");
        let mut stderr = Capture::start(stderr, "stderr");

        let waited = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Waited::Exited(status),
                Err(e) => {
                    reaper.reap();
                    stdout.abort();
                    stderr.abort();
                    return Err(RunnerError::Wait(e));
                }
            },
            _ = tokio::time::sleep_until(deadline) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        let status = match waited {
            Waited::Exited(status) => status,
            Waited::TimedOut => {
                warn!(pid = ?pid, "Deadline reached, killing process tree");
                terminate(&mut child, &mut reaper).await;
                stdout.abort();
                stderr.abort();
                return Ok(SandboxOutcome::TimedOut);
            }
            Waited::Cancelled => {
                info!(pid = ?pid, "Cancelled, killing process tree");
                terminate(&mut child, &mut reaper).await;
                stdout.abort();
                stderr.abort();
                return Ok(SandboxOutcome::Cancelled);
            }
        };
        info!(status = ?status, "Child exited");

        // Descendants may still hold the pipes open.
        let killed = reaper.reap();
        if killed > 0 {
            info!(pid = ?pid, killed, "Killed leftover descendants");
        }

        // The run is complete once the child has exited. Pipes still open
        // after the grace period only cost the output written after that.
        let closed = tokio::time::timeout(PIPE_GRACE, async {
            stdout.finish().await?;
            stderr.finish().await
        })
        .await;
        match closed {
            Ok(closed) => closed?,
            Err(_) => {
                warn!(pid = ?pid, "Output pipes still open after exit, keeping partial output");
                stdout.abort();
                stderr.abort();
            }
        }
        let stdout = stdout.take();
        let stderr = stderr.take();
        info!(stdout_len = stdout.len(), stderr_len = stderr.len(), "Output captured");

        Ok(SandboxOutcome::Exited(RunResult {
            stdout,
            stderr,
            exit_code: status.code(),
            signal: exit_signal(&status),
        }))
    }
}

/// Kills every process belonging to one run: the child's process group and
/// anything else carrying the run's tag.
///
/// Also runs on drop, e.g. when an HTTP client disconnects mid-run.
struct Reaper {
    pid: Option<u32>,
    run_id: String,
    armed: bool,
}

impl Reaper {
    fn new(pid: Option<u32>, run_id: &str) -> Self {
        Self {
            pid,
            run_id: run_id.to_string(),
            armed: true,
        }
    }

    /// Returns how many kill signals found a live target.
    fn reap(&mut self) -> usize {
        self.armed = false;
        let group = usize::from(kill_process_group(self.pid));
        group + kill_tagged(&self.run_id)
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if self.armed {
            self.reap();
        }
    }
}

/// Reads one output pipe into a buffer that stays readable if the reader
/// has to be abandoned.
struct Capture {
    stream: &'static str,
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl Capture {
    fn start<R>(reader: R, stream: &'static str) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(drain(reader, Arc::clone(&buf)));
        Self { stream, buf, task }
    }

    /// Waits for EOF.
    async fn finish(&mut self) -> Result<(), RunnerError> {
        let stream = self.stream;
        (&mut self.task)
            .await
            .map_err(|e| RunnerError::Capture {
                stream,
                reason: e.to_string(),
            })?
            .map_err(|e| RunnerError::Capture {
                stream,
                reason: e.to_string(),
            })
    }

    fn abort(&self) {
        self.task.abort();
    }

    fn take(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }
}

async fn drain<R: AsyncRead + Unpin>(
    mut reader: R,
    buf: Arc<Mutex<Vec<u8>>>,
) -> std::io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(&chunk[..n]);
    }
}

async fn terminate(child: &mut tokio::process::Child, reaper: &mut Reaper) {
    reaper.reap();
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "start_kill after group kill");
    }
    match child.wait().await {
        Ok(status) => debug!(status = ?status, "Child reaped"),
        Err(e) => warn!(error = %e, "Failed to reap child"),
    }
}

fn kb_to_bytes(kb: u64) -> u64 {
    kb.saturating_mul(1024)
}

#[cfg(unix)]
fn isolate(cmd: &mut std::process::Command, limits: &Limits) {
    use nix::sys::resource::{setrlimit, Resource};
    use std::os::unix::process::CommandExt;

    cmd.process_group(0);

    let mut rlimits: Vec<(Resource, u64)> = Vec::new();
    if let Some(kb) = limits.mem_kb {
        rlimits.push((Resource::RLIMIT_AS, kb_to_bytes(kb)));
    }
    if let Some(kb) = limits.fsize_kb {
        rlimits.push((Resource::RLIMIT_FSIZE, kb_to_bytes(kb)));
    }
    if let Some(n) = limits.nofile {
        rlimits.push((Resource::RLIMIT_NOFILE, n));
    }
    if let Some(n) = limits.nproc {
        rlimits.push((Resource::RLIMIT_NPROC, n));
    }
    if rlimits.is_empty() {
        return;
    }

    // SAFETY: the closure only issues setrlimit syscalls and does not allocate.
    unsafe {
        cmd.pre_exec(move || {
            for (resource, value) in &rlimits {
                let value = *value as nix::libc::rlim_t;
                setrlimit(*resource, value, value).map_err(std::io::Error::from)?;
            }
            Ok(())
        });
    }
}

/// Sends SIGKILL to the child's process group. Returns true if anything was
/// still alive to receive it.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return false;
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid = pid, error = %e, "killpg failed");
            false
        }
    }
}

/// Sweeps `/proc` for processes whose environment carries this run's tag and
/// SIGKILLs them. Repeats while a sweep still finds matches, since a tagged
/// process may fork between the scan and the kill.
#[cfg(target_os = "linux")]
fn kill_tagged(run_id: &str) -> usize {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    const SWEEPS: usize = 4;

    let marker = format!("{}={}", RUN_ID_ENV, run_id).into_bytes();
    let mut killed = 0;
    for _ in 0..SWEEPS {
        let found = tagged_pids(&marker);
        if found.is_empty() {
            break;
        }
        for pid in found {
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) => {
                    debug!(pid, "Killed tagged process");
                    killed += 1;
                }
                Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid, error = %e, "kill failed"),
            }
        }
    }
    killed
}

#[cfg(all(unix, not(target_os = "linux")))]
fn kill_tagged(_run_id: &str) -> usize {
    0
}

/// Live processes whose initial environment contains `marker` as an entry.
/// Zombies expose an empty environment and never match.
#[cfg(target_os = "linux")]
fn tagged_pids(marker: &[u8]) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let own = std::process::id() as i32;
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|&pid| pid != own)
        .filter(|pid| {
            std::fs::read(format!("/proc/{}/environ", pid))
                .map(|environ| environ.split(|&b| b == 0).any(|var| var == marker))
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}
