//! The execution engine: validator, selector, backend and aggregator wired
//! into one call path.
//!
//! `execute_dynamic_code` never fails. Every path, including rejection, an
//! unreachable runtime and an orchestration fault, ends in an
//! `ExecutionResult`.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::errors::{EngineError, ExecutorError};
use crate::executors::{
    BackendKind, BackendSelector, ContainerOrchestrator, DockerRuntime, LocalRestrictedExecutor,
    RawOutcome, Sandbox, SandboxBackend, SandboxState,
};
use crate::result::{CallContext, ExecutionResult, ResultAggregator};
use crate::submission::CodeSubmission;
use crate::validator::{SecurityValidator, SecurityVerdict};

/// A submission cleared for execution on a chosen backend. Cannot be built
/// from an unsafe verdict.
#[derive(Debug)]
pub struct ExecutionRequest {
    submission: CodeSubmission,
    verdict: SecurityVerdict,
    backend: BackendKind,
}

impl ExecutionRequest {
    /// Hands the verdict back when it is not safe.
    pub fn new(
        submission: CodeSubmission,
        verdict: SecurityVerdict,
        backend: BackendKind,
    ) -> Result<Self, SecurityVerdict> {
        if !verdict.is_safe() {
            return Err(verdict);
        }
        Ok(Self {
            submission,
            verdict,
            backend,
        })
    }

    pub fn submission(&self) -> &CodeSubmission {
        &self.submission
    }

    pub fn verdict(&self) -> &SecurityVerdict {
        &self.verdict
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }
}

pub struct ExecutionEngine {
    config: EngineConfig,
    validator: SecurityValidator,
    selector: BackendSelector,
    aggregator: ResultAggregator,
}

impl ExecutionEngine {
    /// Build an engine with the Docker-backed container orchestrator and the
    /// local restricted executor, each only if enabled in `config`.
    pub fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let validator = Self::build_validator(&config)?;
        let allowed_modules = validator.allowed_modules();

        let primary: Option<Arc<dyn SandboxBackend>> = if config.container.enabled {
            match DockerRuntime::connect() {
                Ok(runtime) => Some(Arc::new(ContainerOrchestrator::new(
                    Arc::new(runtime),
                    config.container.clone(),
                    &config.limits,
                    allowed_modules.clone(),
                ))),
                Err(e) => {
                    log::warn!("Docker client could not be configured: {}", e);
                    None
                }
            }
        } else {
            log::info!("Container backend disabled by configuration");
            None
        };

        let fallback: Option<Arc<dyn SandboxBackend>> = if config.local.enabled {
            Some(Arc::new(LocalRestrictedExecutor::new(
                config.local.clone(),
                &config.limits,
                allowed_modules,
            )))
        } else {
            log::info!("Local restricted backend disabled by configuration");
            None
        };

        Self::assemble(config, validator, primary, fallback)
    }

    /// Build an engine around caller-supplied backends.
    pub fn with_backends(
        config: EngineConfig,
        primary: Option<Arc<dyn SandboxBackend>>,
        fallback: Option<Arc<dyn SandboxBackend>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let validator = Self::build_validator(&config)?;
        Self::assemble(config, validator, primary, fallback)
    }

    fn build_validator(config: &EngineConfig) -> Result<SecurityValidator, EngineError> {
        SecurityValidator::new(
            &config.validator.extra_allowed_modules,
            config.limits.max_source_bytes,
        )
    }

    fn assemble(
        config: EngineConfig,
        validator: SecurityValidator,
        primary: Option<Arc<dyn SandboxBackend>>,
        fallback: Option<Arc<dyn SandboxBackend>>,
    ) -> Result<Self, EngineError> {
        let selector = BackendSelector::new(primary, fallback, &config.selector);
        let aggregator = ResultAggregator::new()?;

        Ok(Self {
            config,
            validator,
            selector,
            aggregator,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn validator(&self) -> &SecurityValidator {
        &self.validator
    }

    pub fn selector(&self) -> &BackendSelector {
        &self.selector
    }

    /// Static check only; nothing runs.
    pub fn validate(&self, source: &str) -> SecurityVerdict {
        self.validator.validate(source)
    }

    /// Run `source` in a fresh sandbox. Missing bounds take the configured
    /// defaults; all bounds are clamped into the supported ranges.
    pub async fn execute_dynamic_code(
        &self,
        source: &str,
        timeout_seconds: Option<i64>,
        memory_limit_mb: Option<i64>,
    ) -> ExecutionResult {
        let submission = CodeSubmission::new(
            source,
            timeout_seconds.unwrap_or(self.config.limits.default_timeout_secs as i64),
            memory_limit_mb.unwrap_or(self.config.limits.default_memory_mb as i64),
        );
        self.execute(submission).await
    }

    pub async fn execute(&self, submission: CodeSubmission) -> ExecutionResult {
        let mut ctx = CallContext::new(submission.timeout_secs(), submission.memory_mb());

        let verdict = self.validator.validate(submission.source());
        if !verdict.is_safe() {
            log::warn!("Submission rejected: {}", verdict.summary());
            return self.aggregator.security_rejected(&verdict, &ctx);
        }

        let selection = match self.selector.select().await {
            Ok(selection) => selection,
            Err(e) => {
                log::error!("{}", e);
                return self.aggregator.backend_unavailable(&e, &ctx);
            }
        };
        let backend = selection.backend.kind();

        let request = match ExecutionRequest::new(submission, verdict, backend) {
            Ok(request) => request,
            Err(verdict) => return self.aggregator.security_rejected(&verdict, &ctx),
        };

        let mut sandbox = Sandbox::new(backend, request.submission().limits());
        ctx.sandbox_id = Some(sandbox.id().to_string());
        log::info!(
            "sandbox {} starting on {} backend (timeout {}s, memory {}MB{})",
            sandbox.id(),
            backend,
            ctx.timeout_seconds,
            ctx.memory_limit_mb,
            if selection.degraded { ", degraded isolation" } else { "" }
        );

        sandbox.transition(SandboxState::Running);
        let outcome = selection
            .backend
            .run(&sandbox, request.submission().source())
            .await;
        settle(&mut sandbox, &outcome);

        match outcome {
            Ok(raw) => {
                let result = self.aggregator.normalize(raw, backend, &ctx);
                log::info!(
                    "sandbox {} finished: status={} exit_code={:?} time={:.3}s",
                    sandbox.id(),
                    result.status,
                    result.exit_code,
                    result.execution_time_seconds
                );
                result
            }
            Err(e) => {
                log::error!("sandbox {} infrastructure error: {}", sandbox.id(), e);
                if backend == BackendKind::Container && e.invalidates_availability() {
                    self.selector.invalidate();
                }
                self.aggregator.infrastructure_error(&e, Some(backend), &ctx)
            }
        }
    }
}

/// Move a sandbox past `Running` once its backend returned. Backends release
/// everything they created before `run` returns, unless they report that
/// teardown itself failed; such a sandbox stays `Finished`.
fn settle(sandbox: &mut Sandbox, outcome: &Result<RawOutcome, ExecutorError>) {
    sandbox.transition(SandboxState::Finished);
    match outcome {
        Err(e) if e.leaves_resources() => log::error!(
            "sandbox {} left in state {:?}: {}",
            sandbox.id(),
            sandbox.state(),
            e
        ),
        _ => sandbox.transition(SandboxState::TornDown),
    }
}
