//! Capability set the container orchestrator needs from an isolation runtime.
//!
//! Nothing here is specific to one vendor; `DockerRuntime` is one
//! implementation and tests substitute an in-memory one.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::errors::ExecutorError;

/// Everything needed to start one single-use unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSpec {
    pub name: String,
    pub image: String,
    pub memory_bytes: i64,
    /// CPU quota in billionths of a core.
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub user: String,
    /// Always true for units created by the orchestrator.
    pub network_disabled: bool,
    pub read_only_rootfs: bool,
    /// Writable mounts on top of the read-only rootfs: path -> mount options.
    pub scratch_mounts: HashMap<String, String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// One chunk of captured output, tagged with its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

#[async_trait]
pub trait IsolationRuntime: Send + Sync {
    /// Whether the runtime answers at all.
    async fn ping(&self) -> Result<(), ExecutorError>;

    async fn image_exists(&self, tag: &str) -> Result<bool, ExecutorError>;

    /// Build `tag` from an uncompressed tar build context holding a `Dockerfile`.
    async fn build_image(&self, tag: &str, context: Vec<u8>) -> Result<(), ExecutorError>;

    /// Create a unit without starting it, returning its runtime id.
    async fn create_unit(&self, spec: &UnitSpec) -> Result<String, ExecutorError>;

    async fn start_unit(&self, unit_id: &str) -> Result<(), ExecutorError>;

    /// Follow the unit's output until it exits, forwarding each chunk.
    async fn stream_logs(
        &self,
        unit_id: &str,
        sink: mpsc::UnboundedSender<LogChunk>,
    ) -> Result<(), ExecutorError>;

    /// Block until the unit exits and return its exit status.
    async fn wait_unit(&self, unit_id: &str) -> Result<i64, ExecutorError>;

    async fn kill_unit(&self, unit_id: &str) -> Result<(), ExecutorError>;

    /// Remove a unit, stopping it first if needed. Removing a unit that no
    /// longer exists is not an error.
    async fn remove_unit(&self, unit_id: &str) -> Result<(), ExecutorError>;

    /// Remove an image. Removing an image that no longer exists is not an error.
    async fn remove_image(&self, tag: &str) -> Result<(), ExecutorError>;
}
