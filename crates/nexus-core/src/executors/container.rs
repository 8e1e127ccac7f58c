//! Container orchestrator: the primary, authoritative isolation backend.
//!
//! Each call builds a single-use image on top of a cached base image, runs
//! it as one unit with no network, a read-only root filesystem, a non-root
//! user and capped memory/CPU, and removes both the unit and the image before
//! returning. Teardown runs on every exit path: explicitly after the run, and
//! from `Drop` if the calling future is cancelled midway.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

use super::harness::{self, HarnessMode};
use super::runtime::{IsolationRuntime, LogChunk, UnitSpec};
use super::{BackendKind, OutputBuffer, RawOutcome, Sandbox, SandboxBackend};
use crate::config::{ContainerConfig, LimitsConfig};
use crate::errors::ExecutorError;

pub const SANDBOX_LABEL: &str = "io.nexus.sandbox";

pub struct ContainerOrchestrator {
    runtime: Arc<dyn IsolationRuntime>,
    config: ContainerConfig,
    allowed_modules: Vec<String>,
    max_output_bytes: usize,
    grace_period: Duration,
    base_image: Mutex<Option<String>>,
}

impl ContainerOrchestrator {
    pub fn new(
        runtime: Arc<dyn IsolationRuntime>,
        config: ContainerConfig,
        limits: &LimitsConfig,
        allowed_modules: Vec<String>,
    ) -> Self {
        Self {
            runtime,
            config,
            allowed_modules,
            max_output_bytes: limits.max_output_bytes,
            grace_period: Duration::from_secs(limits.grace_period_secs),
            base_image: Mutex::new(None),
        }
    }

    /// Tag of the harness base image, building it when it is missing.
    /// Concurrent callers wait on the same build. A cached tag is checked
    /// against the runtime before reuse, so an image pruned behind our back
    /// is rebuilt; a failed build is retried by the next call.
    pub async fn ensure_base_image(&self) -> Result<String, ExecutorError> {
        let mut cached = self.base_image.lock().await;
        let tag = match cached.as_deref() {
            Some(tag) => tag.to_string(),
            None => harness::base_image_tag(&self.config.image_prefix, &self.config.base_image),
        };

        if self.runtime.image_exists(&tag).await? {
            if cached.is_none() {
                log::debug!("Reusing sandbox base image {}", tag);
            }
        } else {
            if cached.take().is_some() {
                log::warn!("Sandbox base image {} disappeared, rebuilding", tag);
            }
            log::info!(
                "Building sandbox base image {} from {}",
                tag,
                self.config.base_image
            );
            let context = harness::base_context(&self.config.base_image)?;
            self.runtime.build_image(&tag, context).await?;
        }

        *cached = Some(tag.clone());
        Ok(tag)
    }

    /// Forget the cached base image so the next call checks the runtime again.
    async fn forget_base_image(&self) {
        self.base_image.lock().await.take();
    }

    pub fn unit_spec(&self, sandbox: &Sandbox, image: &str) -> UnitSpec {
        let mut scratch_mounts = HashMap::new();
        scratch_mounts.insert(
            harness::CONTAINER_SCRATCH_PATH.to_string(),
            format!("rw,noexec,nosuid,nodev,size={}m", self.config.scratch_size_mb),
        );

        let mut labels = HashMap::new();
        labels.insert(SANDBOX_LABEL.to_string(), sandbox.id().to_string());

        UnitSpec {
            name: format!("{}-{}", self.config.image_prefix, sandbox.id()),
            image: image.to_string(),
            memory_bytes: sandbox.limits().memory_bytes() as i64,
            nano_cpus: (self.config.cpu_limit * 1_000_000_000.0) as i64,
            pids_limit: self.config.pids_limit,
            user: self.config.run_as_user.clone(),
            network_disabled: true,
            read_only_rootfs: true,
            scratch_mounts,
            env: harness::harness_env(HarnessMode::Container, &self.allowed_modules)
                .into_iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
            labels,
        }
    }

    async fn execute_unit(
        &self,
        sandbox: &Sandbox,
        source: &str,
        base_tag: &str,
        resources: &mut CallResources,
    ) -> Result<RawOutcome, ExecutorError> {
        let image_tag = harness::run_image_tag(&self.config.image_prefix, sandbox.id());
        let context = harness::run_context(base_tag, sandbox.id(), source)?;

        // Registered before the build so a half-built image is removed too.
        resources.image = Some(image_tag.clone());
        self.runtime.build_image(&image_tag, context).await?;

        let spec = self.unit_spec(sandbox, &image_tag);
        let unit_id = self.runtime.create_unit(&spec).await?;
        resources.unit_id = Some(unit_id.clone());

        self.runtime.start_unit(&unit_id).await?;
        let started = Instant::now();
        log::debug!("sandbox {} running as unit {}", sandbox.id(), unit_id);

        let (tx, mut rx) = mpsc::unbounded_channel::<LogChunk>();
        let log_runtime = Arc::clone(&self.runtime);
        let log_unit = unit_id.clone();
        let mut pump = tokio::spawn(async move { log_runtime.stream_logs(&log_unit, tx).await });

        let limit = self.max_output_bytes;
        let collector = tokio::spawn(async move {
            let mut stdout = OutputBuffer::new(limit);
            let mut stderr = OutputBuffer::new(limit);
            while let Some(chunk) = rx.recv().await {
                match chunk {
                    LogChunk::Stdout(bytes) => stdout.push(&bytes),
                    LogChunk::Stderr(bytes) => stderr.push(&bytes),
                }
            }
            (stdout, stderr)
        });

        let wait = tokio::time::timeout(sandbox.limits().timeout, self.runtime.wait_unit(&unit_id)).await;
        let (exit_code, timed_out) = match wait {
            Ok(Ok(code)) => (Some(code), false),
            Ok(Err(e)) => {
                pump.abort();
                return Err(e);
            }
            Err(_) => {
                log::warn!("Execution timed out for sandbox {}", sandbox.id());
                if let Err(e) = self.runtime.kill_unit(&unit_id).await {
                    pump.abort();
                    return Err(e);
                }
                (None, true)
            }
        };
        let wall_time = started.elapsed();

        // The log stream ends on its own once the unit has stopped.
        match tokio::time::timeout(self.grace_period, &mut pump).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => log::warn!("log stream for sandbox {} failed: {}", sandbox.id(), e),
            Ok(Err(e)) => log::warn!("log task for sandbox {} panicked: {}", sandbox.id(), e),
            Err(_) => {
                log::warn!(
                    "log stream for sandbox {} still open after grace period",
                    sandbox.id()
                );
                pump.abort();
            }
        }

        let (stdout, stderr) = collector
            .await
            .map_err(|e| ExecutorError::RuntimeError(format!("log collector failed: {}", e)))?;

        Ok(RawOutcome {
            exit_code,
            output_truncated: stdout.is_truncated() || stderr.is_truncated(),
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            wall_time,
            timed_out,
        })
    }
}

#[async_trait]
impl SandboxBackend for ContainerOrchestrator {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn is_available(&self) -> bool {
        self.runtime.ping().await.is_ok()
    }

    async fn run(&self, sandbox: &Sandbox, source: &str) -> Result<RawOutcome, ExecutorError> {
        let base_tag = self.ensure_base_image().await?;

        let mut resources = CallResources::new(Arc::clone(&self.runtime), sandbox.id());
        let outcome = self
            .execute_unit(sandbox, source, &base_tag, &mut resources)
            .await;
        let teardown = resources.release().await;

        if let Err(ExecutorError::ImageBuildFailed(_)) = &outcome {
            self.forget_base_image().await;
        }

        match (outcome, teardown) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => {
                log::error!("sandbox {} teardown failed: {}", sandbox.id(), e);
                Err(ExecutorError::TeardownFailed(e.to_string()))
            }
            (Err(e), teardown) => {
                if let Err(te) = teardown {
                    log::error!("sandbox {} teardown failed after error: {}", sandbox.id(), te);
                }
                Err(e)
            }
        }
    }
}

/// Ephemeral resources created for one call. Released explicitly with
/// `release`; if dropped while still armed (the call was cancelled), cleanup
/// is handed to the tokio runtime.
struct CallResources {
    runtime: Arc<dyn IsolationRuntime>,
    sandbox_id: String,
    unit_id: Option<String>,
    image: Option<String>,
    armed: bool,
}

impl CallResources {
    fn new(runtime: Arc<dyn IsolationRuntime>, sandbox_id: &str) -> Self {
        Self {
            runtime,
            sandbox_id: sandbox_id.to_string(),
            unit_id: None,
            image: None,
            armed: true,
        }
    }

    async fn release(mut self) -> Result<(), ExecutorError> {
        self.armed = false;
        teardown(
            self.runtime.as_ref(),
            &self.sandbox_id,
            self.unit_id.take(),
            self.image.take(),
        )
        .await
    }
}

impl Drop for CallResources {
    fn drop(&mut self) {
        if !self.armed || (self.unit_id.is_none() && self.image.is_none()) {
            return;
        }
        let runtime = Arc::clone(&self.runtime);
        let sandbox_id = self.sandbox_id.clone();
        let unit_id = self.unit_id.take();
        let image = self.image.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!("sandbox {} abandoned mid-run, cleaning up in background", sandbox_id);
                handle.spawn(async move {
                    let _ = teardown(runtime.as_ref(), &sandbox_id, unit_id, image).await;
                });
            }
            Err(_) => log::error!(
                "sandbox {} dropped outside a tokio runtime; unit {:?} and image {:?} may remain",
                sandbox_id,
                unit_id,
                image
            ),
        }
    }
}

/// Remove the unit, then the image it ran from. Both removals are attempted
/// even if the first fails; the first error is returned.
async fn teardown(
    runtime: &dyn IsolationRuntime,
    sandbox_id: &str,
    unit_id: Option<String>,
    image: Option<String>,
) -> Result<(), ExecutorError> {
    let mut first_error = None;

    if let Some(unit_id) = unit_id {
        if let Err(e) = runtime.remove_unit(&unit_id).await {
            log::error!("sandbox {}: failed to remove unit {}: {}", sandbox_id, unit_id, e);
            first_error.get_or_insert(e);
        }
    }
    if let Some(image) = image {
        if let Err(e) = runtime.remove_image(&image).await {
            log::error!("sandbox {}: failed to remove image {}: {}", sandbox_id, image, e);
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            log::debug!("sandbox {} torn down", sandbox_id);
            Ok(())
        }
    }
}
