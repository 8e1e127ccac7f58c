//! Result aggregation: every outcome, from any backend or any early exit,
//! becomes one `ExecutionResult` envelope.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, ExecutorError};
use crate::executors::{BackendKind, RawOutcome};
use crate::validator::{SecurityVerdict, Violation};

/// Longest sanitized error message handed back to callers.
pub const MAX_ERROR_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    CompletedWithError,
    Timeout,
    SecurityRejected,
    BackendUnavailable,
    InfrastructureError,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::CompletedWithError => "completed_with_error",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::SecurityRejected => "security_rejected",
            ExecutionStatus::BackendUnavailable => "backend_unavailable",
            ExecutionStatus::InfrastructureError => "infrastructure_error",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The envelope returned for every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_seconds: f64,
    /// `None` when nothing ran.
    pub backend_used: Option<BackendKind>,
    pub degraded_isolation: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub sandbox_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub timeout_seconds: u64,
    pub memory_limit_mb: u64,
    pub output_truncated: bool,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Call-level facts that go into every envelope.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub sandbox_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub timeout_seconds: u64,
    pub memory_limit_mb: u64,
}

impl CallContext {
    pub fn new(timeout_seconds: u64, memory_limit_mb: u64) -> Self {
        Self {
            sandbox_id: None,
            started_at: Utc::now(),
            timeout_seconds,
            memory_limit_mb,
        }
    }

    fn envelope(&self, status: ExecutionStatus) -> ExecutionResult {
        ExecutionResult {
            status,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            execution_time_seconds: 0.0,
            backend_used: None,
            degraded_isolation: false,
            violations: Vec::new(),
            error: None,
            sandbox_id: self.sandbox_id.clone(),
            started_at: self.started_at,
            timeout_seconds: self.timeout_seconds,
            memory_limit_mb: self.memory_limit_mb,
            output_truncated: false,
        }
    }
}

fn round_seconds(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

/// Builds envelopes and scrubs host detail out of internal error messages.
pub struct ResultAggregator {
    credential_re: Regex,
    bearer_re: Regex,
    unix_path_re: Regex,
    windows_path_re: Regex,
}

impl ResultAggregator {
    pub fn new() -> Result<Self, EngineError> {
        Ok(Self {
            credential_re: compile(
                r"(?i)\b(password|passwd|secret|token|api[_-]?key|access[_-]?key|auth)(\s*[=:]\s*)[^\s,;]+",
            )?,
            bearer_re: compile(r"(?i)\bbearer\s+[^\s,;]+")?,
            unix_path_re: compile(r"(?:/[\w.@+-]+){2,}/?")?,
            windows_path_re: compile(r"\b[A-Za-z]:\\[^\s'\x22]+")?,
        })
    }

    /// Map what a backend observed to an envelope. A timeout wins over any
    /// exit status; otherwise only exit code 0 counts as success.
    pub fn normalize(&self, raw: RawOutcome, backend: BackendKind, ctx: &CallContext) -> ExecutionResult {
        let status = if raw.timed_out {
            ExecutionStatus::Timeout
        } else if raw.exit_code == Some(0) {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::CompletedWithError
        };

        let error = match status {
            ExecutionStatus::Timeout => Some(format!(
                "Execution timed out after {} seconds",
                ctx.timeout_seconds
            )),
            _ => None,
        };

        ExecutionResult {
            exit_code: if raw.timed_out { None } else { raw.exit_code },
            stdout: raw.stdout,
            stderr: raw.stderr,
            execution_time_seconds: round_seconds(raw.wall_time.as_secs_f64()),
            backend_used: Some(backend),
            degraded_isolation: backend.is_degraded(),
            error,
            output_truncated: raw.output_truncated,
            ..ctx.envelope(status)
        }
    }

    pub fn security_rejected(&self, verdict: &SecurityVerdict, ctx: &CallContext) -> ExecutionResult {
        ExecutionResult {
            violations: verdict.violations().to_vec(),
            error: Some(format!(
                "Code rejected by security validator: {}",
                verdict.summary()
            )),
            ..ctx.envelope(ExecutionStatus::SecurityRejected)
        }
    }

    pub fn backend_unavailable(&self, err: &EngineError, ctx: &CallContext) -> ExecutionResult {
        ExecutionResult {
            error: Some(self.sanitize_error(&err.to_string())),
            ..ctx.envelope(ExecutionStatus::BackendUnavailable)
        }
    }

    pub fn infrastructure_error(
        &self,
        err: &ExecutorError,
        backend: Option<BackendKind>,
        ctx: &CallContext,
    ) -> ExecutionResult {
        ExecutionResult {
            backend_used: backend,
            degraded_isolation: backend.map(|b| b.is_degraded()).unwrap_or(false),
            error: Some(self.sanitize_error(&err.to_string())),
            ..ctx.envelope(ExecutionStatus::InfrastructureError)
        }
    }

    /// Keep only the first line, replace filesystem paths and credential
    /// values, and cap the length.
    pub fn sanitize_error(&self, message: &str) -> String {
        let first_line = message.lines().next().unwrap_or("").trim();

        let cleaned = self.credential_re.replace_all(first_line, "$1$2<redacted>");
        let cleaned = self.bearer_re.replace_all(&cleaned, "Bearer <redacted>");
        let cleaned = self.windows_path_re.replace_all(&cleaned, "<path>");
        let cleaned = self.unix_path_re.replace_all(&cleaned, "<path>");

        if cleaned.chars().count() > MAX_ERROR_CHARS {
            let mut truncated: String = cleaned.chars().take(MAX_ERROR_CHARS).collect();
            truncated.push_str("...");
            truncated
        } else {
            cleaned.into_owned()
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, EngineError> {
    Regex::new(pattern)
        .map_err(|e| EngineError::InfrastructureError(format!("Invalid sanitizer pattern: {}", e)))
}
