//! Local restricted executor: the degraded fallback backend.
//!
//! Runs the submission with the host interpreter in a child process: fresh
//! temporary working directory, empty environment, no stdin, the runner
//! harness in restricted mode, and kernel resource limits applied between
//! fork and exec. The child is killed when the timeout elapses or when the
//! call is dropped. Results from this backend are always flagged as degraded.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::harness::{self, HarnessMode};
use super::{BackendKind, OutputBuffer, RawOutcome, Sandbox, SandboxBackend};
use crate::config::{LimitsConfig, LocalConfig};
use crate::errors::ExecutorError;
use crate::submission::ResourceLimits;

const MIB: u64 = 1024 * 1024;
const READ_CHUNK: usize = 8 * 1024;
/// Placeholder for the temporary working directory in captured stderr.
pub const SANDBOX_DIR_PLACEHOLDER: &str = "<sandbox>";

/// Kernel limits applied to the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    pub address_space_bytes: u64,
    pub cpu_secs: u64,
    pub max_open_files: u64,
    pub max_file_size_bytes: u64,
}

pub struct LocalRestrictedExecutor {
    config: LocalConfig,
    allowed_modules: Vec<String>,
    max_output_bytes: usize,
    grace_period: Duration,
}

impl LocalRestrictedExecutor {
    pub fn new(config: LocalConfig, limits: &LimitsConfig, allowed_modules: Vec<String>) -> Self {
        Self {
            config,
            allowed_modules,
            max_output_bytes: limits.max_output_bytes,
            grace_period: Duration::from_secs(limits.grace_period_secs),
        }
    }

    fn interpreter(&self) -> Result<PathBuf, ExecutorError> {
        which::which(&self.config.interpreter).map_err(|e| {
            ExecutorError::InterpreterNotFound(format!("{}: {}", self.config.interpreter, e))
        })
    }

    pub fn process_limits(&self, limits: &ResourceLimits) -> ProcessLimits {
        ProcessLimits {
            address_space_bytes: (limits.memory_mb + self.config.address_space_headroom_mb) * MIB,
            // Whole seconds, rounded up, plus one so the wall-clock watchdog
            // normally fires first.
            cpu_secs: limits.timeout.as_secs() + u64::from(limits.timeout.subsec_nanos() > 0) + 1,
            max_open_files: self.config.max_open_files,
            max_file_size_bytes: self.config.max_file_size_mb * MIB,
        }
    }
}

#[cfg(unix)]
fn apply_process_limits(limits: ProcessLimits) -> std::io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    let set = |resource: Resource, value: u64| {
        setrlimit(resource, value, value).map_err(std::io::Error::from)
    };
    set(Resource::RLIMIT_AS, limits.address_space_bytes)?;
    set(Resource::RLIMIT_CPU, limits.cpu_secs)?;
    set(Resource::RLIMIT_NOFILE, limits.max_open_files)?;
    set(Resource::RLIMIT_FSIZE, limits.max_file_size_bytes)?;
    set(Resource::RLIMIT_CORE, 0)?;
    Ok(())
}

/// Exit status as a number; death by signal maps to 128 + signal, the
/// convention container runtimes report as well.
fn exit_code_of(status: ExitStatus) -> Option<i64> {
    if let Some(code) = status.code() {
        return Some(i64::from(code));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(128 + i64::from(signal));
        }
    }
    None
}

fn spawn_reader<R>(mut reader: R, limit: usize) -> JoinHandle<OutputBuffer>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = OutputBuffer::new(limit);
        let mut chunk = vec![0u8; READ_CHUNK];
        // Keep reading past the cap so the child never blocks on a full pipe.
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buffer.push(&chunk[..n]),
                Err(e) => {
                    log::debug!("pipe read ended: {}", e);
                    break;
                }
            }
        }
        buffer
    })
}

async fn finish_reader(
    mut task: JoinHandle<OutputBuffer>,
    grace: Duration,
    limit: usize,
    stream: &str,
) -> OutputBuffer {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(buffer)) => buffer,
        Ok(Err(e)) => {
            log::warn!("{} reader failed: {}", stream, e);
            OutputBuffer::new(limit)
        }
        Err(_) => {
            log::warn!("{} still open after grace period, discarding", stream);
            task.abort();
            OutputBuffer::new(limit)
        }
    }
}

#[async_trait]
impl SandboxBackend for LocalRestrictedExecutor {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalRestricted
    }

    async fn is_available(&self) -> bool {
        self.interpreter().is_ok()
    }

    async fn run(&self, sandbox: &Sandbox, source: &str) -> Result<RawOutcome, ExecutorError> {
        let interpreter = self.interpreter()?;

        // Removed on drop, including when the call is cancelled.
        let mut builder = tempfile::Builder::new();
        builder.prefix("nexus-sbx-");
        let workdir = match &self.config.work_dir {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        tokio::fs::write(workdir.path().join(harness::RUNNER_FILE), harness::RUNNER_SOURCE).await?;
        tokio::fs::write(workdir.path().join(harness::SUBMISSION_FILE), source).await?;

        let mut cmd = Command::new(&interpreter);
        cmd.arg("-I")
            .arg(harness::RUNNER_FILE)
            .arg(harness::SUBMISSION_FILE)
            .current_dir(workdir.path())
            .env_clear()
            .envs(harness::harness_env(HarnessMode::Restricted, &self.allowed_modules))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            let limits = self.process_limits(sandbox.limits());
            // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
            unsafe {
                cmd.pre_exec(move || apply_process_limits(limits));
            }
        }

        let started = Instant::now();
        let mut child = cmd.spawn()?;
        log::debug!(
            "sandbox {} running as local process {:?}",
            sandbox.id(),
            child.id()
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::RuntimeError("child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutorError::RuntimeError("child stderr not captured".to_string()))?;
        let stdout_task = spawn_reader(stdout, self.max_output_bytes);
        let stderr_task = spawn_reader(stderr, self.max_output_bytes);

        let (exit_code, timed_out) =
            match tokio::time::timeout(sandbox.limits().timeout, child.wait()).await {
                Ok(status) => (exit_code_of(status?), false),
                Err(_) => {
                    log::warn!("Execution timed out for sandbox {}", sandbox.id());
                    if let Err(e) = child.kill().await {
                        log::warn!("sandbox {}: kill after timeout failed: {}", sandbox.id(), e);
                    }
                    (None, true)
                }
            };
        let wall_time = started.elapsed();

        let stdout = finish_reader(stdout_task, self.grace_period, self.max_output_bytes, "stdout").await;
        let stderr = finish_reader(stderr_task, self.grace_period, self.max_output_bytes, "stderr").await;

        let workdir_path = workdir.path().to_string_lossy().into_owned();
        let output_truncated = stdout.is_truncated() || stderr.is_truncated();
        let stderr = stderr
            .into_string()
            .replace(&workdir_path, SANDBOX_DIR_PLACEHOLDER);

        if let Err(e) = workdir.close() {
            log::error!("sandbox {}: failed to remove working directory: {}", sandbox.id(), e);
            return Err(ExecutorError::IoError(e));
        }

        Ok(RawOutcome {
            exit_code,
            stdout: stdout.into_string(),
            stderr,
            wall_time,
            timed_out,
            output_truncated,
        })
    }
}
