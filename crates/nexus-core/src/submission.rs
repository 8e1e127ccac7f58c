//! Code submissions and the resource bounds derived from them

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MIN_TIMEOUT_SECS: u64 = 10;
pub const MAX_TIMEOUT_SECS: u64 = 300;
pub const MIN_MEMORY_MB: u64 = 32;
pub const MAX_MEMORY_MB: u64 = 512;

/// Source text plus the requested bounds, already clamped into range.
///
/// Out-of-range requests are never rejected: a timeout of 5 becomes 10 and a
/// memory ceiling of 1000 becomes 512.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSubmission {
    source: String,
    timeout_secs: u64,
    memory_mb: u64,
}

impl CodeSubmission {
    pub fn new(source: impl Into<String>, timeout_secs: i64, memory_mb: i64) -> Self {
        let timeout_secs = clamp_timeout(timeout_secs);
        let memory_mb = clamp_memory(memory_mb);
        Self {
            source: source.into(),
            timeout_secs,
            memory_mb,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            memory_mb: self.memory_mb,
        }
    }
}

pub fn clamp_timeout(requested: i64) -> u64 {
    requested.clamp(MIN_TIMEOUT_SECS as i64, MAX_TIMEOUT_SECS as i64) as u64
}

pub fn clamp_memory(requested: i64) -> u64 {
    requested.clamp(MIN_MEMORY_MB as i64, MAX_MEMORY_MB as i64) as u64
}

/// Bounds applied to one sandbox.
///
/// Backends receive these directly, so callers inside the crate can hand a
/// backend a sub-second timeout; only `CodeSubmission` enforces the public
/// clamping ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub timeout: Duration,
    pub memory_mb: u64,
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb * 1024 * 1024
    }
}
