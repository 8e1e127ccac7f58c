//! Sandboxed execution backends.
//!
//! Two backends run validated source: the container orchestrator, which drives
//! an external isolation runtime (Docker), and the local restricted executor, a
//! degraded fallback that runs the host interpreter under resource limits. The
//! selector decides between them per call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::errors::ExecutorError;
use crate::submission::ResourceLimits;

pub mod container;
pub mod docker;
pub mod harness;
pub mod local;
pub mod runtime;
pub mod selector;

pub use container::ContainerOrchestrator;
pub use docker::DockerRuntime;
pub use local::LocalRestrictedExecutor;
pub use runtime::{IsolationRuntime, LogChunk, UnitSpec};
pub use selector::{BackendReport, BackendSelector, Selection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Container,
    LocalRestricted,
}

impl BackendKind {
    /// Whether results from this backend carry full isolation guarantees.
    pub fn is_degraded(&self) -> bool {
        matches!(self, BackendKind::LocalRestricted)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Container => f.write_str("container"),
            BackendKind::LocalRestricted => f.write_str("local_restricted"),
        }
    }
}

/// What a backend observed, before normalization.
#[derive(Debug, Clone, Default)]
pub struct RawOutcome {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub wall_time: Duration,
    pub timed_out: bool,
    pub output_truncated: bool,
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Cheap reachability check used by the selector.
    async fn is_available(&self) -> bool;

    /// Run validated source inside the given sandbox. Implementations must
    /// release every resource they created before returning, whatever the
    /// outcome.
    async fn run(&self, sandbox: &Sandbox, source: &str) -> Result<RawOutcome, ExecutorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Created,
    Running,
    Finished,
    TornDown,
}

/// Identity of one ephemeral execution context. Owned by the call that
/// created it and never shared.
#[derive(Debug)]
pub struct Sandbox {
    id: String,
    backend: BackendKind,
    limits: ResourceLimits,
    state: SandboxState,
}

impl Sandbox {
    pub fn new(backend: BackendKind, limits: ResourceLimits) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        log::debug!("sandbox {} created for {} backend", id, backend);
        Self {
            id,
            backend,
            limits,
            state: SandboxState::Created,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Advance the lifecycle. States only move forward; a backward request is
    /// ignored and logged.
    pub fn transition(&mut self, next: SandboxState) {
        if (next as u8) < (self.state as u8) {
            log::warn!(
                "sandbox {} ignoring transition {:?} -> {:?}",
                self.id,
                self.state,
                next
            );
            return;
        }
        log::debug!("sandbox {} {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }
}

/// Accumulates one output stream up to a byte cap.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}
