//! Secure dynamic code execution engine.
//!
//! Accepts Python source from an untrusted caller, rejects it statically if
//! it reaches for process, filesystem, network or interpreter internals, and
//! otherwise runs it in a single-use sandbox under hard limits.
//!
//! # Architecture Overview
//!
//! - **Static security validator**: pattern scan gating execution
//! - **Backend selector**: cached isolation-runtime availability with fallback
//! - **Container orchestrator**: per-call image and unit with guaranteed teardown
//! - **Local restricted executor**: degraded host-interpreter fallback
//! - **Result aggregator**: one envelope for every outcome
//! - **Tools**: name-keyed dispatch table over the engine

pub mod config;
pub mod engine;
pub mod errors;
pub mod executors;
pub mod result;
pub mod submission;
pub mod syntax;
pub mod tools;
pub mod validator;

pub use config::*;
pub use engine::{ExecutionEngine, ExecutionRequest};
pub use errors::{EngineError, ExecutorError};
pub use executors::{BackendKind, SandboxBackend};
pub use result::{ExecutionResult, ExecutionStatus};
pub use submission::CodeSubmission;
pub use validator::{SecurityValidator, SecurityVerdict};
