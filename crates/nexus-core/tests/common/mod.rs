#![allow(dead_code)]

use async_trait::async_trait;
use nexus_core::errors::ExecutorError;
use nexus_core::executors::{
    BackendKind, IsolationRuntime, LogChunk, RawOutcome, Sandbox, SandboxBackend, UnitSpec,
};
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// What a fake sandbox does with a submission. Understands a handful of
/// line shapes: `print("x")`, `while True:`, `raise SystemExit(n)` and any
/// other `raise ...`.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub hangs: bool,
}

pub fn interpret(source: &str) -> Program {
    let mut program = Program::default();
    for line in source.lines().map(str::trim) {
        if program.hangs {
            break;
        }
        if let Some(inner) = line.strip_prefix("print(").and_then(|l| l.strip_suffix(')')) {
            let text = inner.trim_matches(|c| c == '"' || c == '\'');
            program.stdout.push_str(text);
            program.stdout.push('\n');
        } else if line.starts_with("while True") {
            program.hangs = true;
        } else if let Some(code) = line
            .strip_prefix("raise SystemExit(")
            .and_then(|l| l.strip_suffix(')'))
        {
            program.exit_code = code.parse().unwrap_or(1);
            break;
        } else if let Some(rest) = line.strip_prefix("raise ") {
            program.stderr = format!("Traceback (most recent call last):\n{}\n", rest);
            program.exit_code = 1;
            break;
        }
    }
    program
}

struct FakeUnit {
    program: Program,
    stopped: watch::Sender<bool>,
}

#[derive(Default)]
struct FakeState {
    images: HashMap<String, Option<Program>>,
    units: HashMap<String, FakeUnit>,
    specs: Vec<UnitSpec>,
    killed: Vec<String>,
    next_unit: usize,
}

/// In-memory isolation runtime. Images and units live in a map; a unit
/// "runs" the submission found in its image's build context.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    pub reachable: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_run_build: AtomicBool,
    pub fail_remove_image: AtomicBool,
    pub pings: AtomicUsize,
    pub base_builds: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn live_units(&self) -> usize {
        self.state.lock().unwrap().units.len()
    }

    /// Images built for a single call that still exist.
    pub fn run_images(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .images
            .keys()
            .filter(|tag| tag.contains("-run:"))
            .cloned()
            .collect()
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().unwrap().images.len()
    }

    /// Remove every image, as `docker image prune -a` would.
    pub fn prune_images(&self) {
        self.state.lock().unwrap().images.clear();
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().unwrap().killed.clone()
    }

    pub fn specs(&self) -> Vec<UnitSpec> {
        self.state.lock().unwrap().specs.clone()
    }

    fn unit_program(&self, unit_id: &str) -> Result<(Program, watch::Receiver<bool>), ExecutorError> {
        let state = self.state.lock().unwrap();
        let unit = state
            .units
            .get(unit_id)
            .ok_or_else(|| ExecutorError::RuntimeError(format!("no such unit {}", unit_id)))?;
        Ok((unit.program.clone(), unit.stopped.subscribe()))
    }
}

fn context_file(context: &[u8], name: &str) -> Option<String> {
    let mut archive = tar::Archive::new(context);
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        let matches = entry.path().ok()?.to_string_lossy() == name;
        if matches {
            let mut contents = String::new();
            entry.read_to_string(&mut contents).ok()?;
            return Some(contents);
        }
    }
    None
}

fn parent_image(dockerfile: &str) -> Option<&str> {
    dockerfile
        .lines()
        .find_map(|line| line.strip_prefix("FROM "))
        .map(str::trim)
}

async fn wait_stopped(mut stopped: watch::Receiver<bool>) {
    // A dropped sender means the unit was removed, which also stops it.
    let _ = stopped.wait_for(|stopped| *stopped).await;
}

#[async_trait]
impl IsolationRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), ExecutorError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ExecutorError::RuntimeError("connection refused".to_string()))
        }
    }

    async fn image_exists(&self, tag: &str) -> Result<bool, ExecutorError> {
        Ok(self.state.lock().unwrap().images.contains_key(tag))
    }

    async fn build_image(&self, tag: &str, context: Vec<u8>) -> Result<(), ExecutorError> {
        if tag.contains("-base:") {
            self.base_builds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
        } else if self.fail_run_build.load(Ordering::SeqCst) {
            return Err(ExecutorError::ImageBuildFailed(
                "COPY failed: no space left on device".to_string(),
            ));
        }
        let dockerfile = context_file(&context, "Dockerfile").unwrap_or_default();
        if let Some(parent) = parent_image(&dockerfile).filter(|p| p.contains("-base:")) {
            if !self.state.lock().unwrap().images.contains_key(parent) {
                return Err(ExecutorError::ImageBuildFailed(format!(
                    "pull access denied for {}",
                    parent
                )));
            }
        }
        let program = context_file(&context, "submission.py").map(|source| interpret(&source));
        self.state.lock().unwrap().images.insert(tag.to_string(), program);
        Ok(())
    }

    async fn create_unit(&self, spec: &UnitSpec) -> Result<String, ExecutorError> {
        let mut state = self.state.lock().unwrap();
        let program = state
            .images
            .get(&spec.image)
            .cloned()
            .flatten()
            .ok_or_else(|| ExecutorError::LaunchFailed(format!("no such image {}", spec.image)))?;
        state.next_unit += 1;
        let unit_id = format!("unit-{}", state.next_unit);
        let (stopped, _) = watch::channel(false);
        state.units.insert(unit_id.clone(), FakeUnit { program, stopped });
        state.specs.push(spec.clone());
        Ok(unit_id)
    }

    async fn start_unit(&self, unit_id: &str) -> Result<(), ExecutorError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ExecutorError::LaunchFailed(format!(
                "runtime went away while starting {}",
                unit_id
            )));
        }
        Ok(())
    }

    async fn stream_logs(
        &self,
        unit_id: &str,
        sink: mpsc::UnboundedSender<LogChunk>,
    ) -> Result<(), ExecutorError> {
        let (program, stopped) = self.unit_program(unit_id)?;
        if !program.stdout.is_empty() {
            let _ = sink.send(LogChunk::Stdout(program.stdout.into_bytes()));
        }
        if !program.stderr.is_empty() {
            let _ = sink.send(LogChunk::Stderr(program.stderr.into_bytes()));
        }
        if program.hangs {
            wait_stopped(stopped).await;
        }
        Ok(())
    }

    async fn wait_unit(&self, unit_id: &str) -> Result<i64, ExecutorError> {
        let (program, stopped) = self.unit_program(unit_id)?;
        if program.hangs {
            wait_stopped(stopped).await;
            return Ok(137);
        }
        Ok(program.exit_code)
    }

    async fn kill_unit(&self, unit_id: &str) -> Result<(), ExecutorError> {
        let mut state = self.state.lock().unwrap();
        if let Some(unit) = state.units.get(unit_id) {
            unit.stopped.send_replace(true);
        }
        state.killed.push(unit_id.to_string());
        Ok(())
    }

    async fn remove_unit(&self, unit_id: &str) -> Result<(), ExecutorError> {
        if let Some(unit) = self.state.lock().unwrap().units.remove(unit_id) {
            unit.stopped.send_replace(true);
        }
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<(), ExecutorError> {
        if self.fail_remove_image.load(Ordering::SeqCst) {
            return Err(ExecutorError::RuntimeError(format!(
                "conflict: unable to remove {}",
                tag
            )));
        }
        self.state.lock().unwrap().images.remove(tag);
        Ok(())
    }
}

/// Stand-in for the local restricted executor.
pub struct FakeLocalBackend {
    pub available: AtomicBool,
    pub runs: AtomicUsize,
}

impl FakeLocalBackend {
    pub fn new(available: bool) -> Self {
        Self {
            available: AtomicBool::new(available),
            runs: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SandboxBackend for FakeLocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalRestricted
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn run(&self, sandbox: &Sandbox, source: &str) -> Result<RawOutcome, ExecutorError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let program = interpret(source);
        if program.hangs {
            tokio::time::sleep(sandbox.limits().timeout).await;
            return Ok(RawOutcome {
                stdout: program.stdout,
                wall_time: sandbox.limits().timeout,
                timed_out: true,
                ..RawOutcome::default()
            });
        }
        Ok(RawOutcome {
            exit_code: Some(program.exit_code),
            stdout: program.stdout,
            stderr: program.stderr,
            wall_time: Duration::from_millis(5),
            timed_out: false,
            output_truncated: false,
        })
    }
}
