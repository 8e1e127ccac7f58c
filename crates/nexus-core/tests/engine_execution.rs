mod common;

use common::{FakeLocalBackend, FakeRuntime};
use nexus_core::config::EngineConfig;
use nexus_core::executors::{BackendKind, ContainerOrchestrator, SandboxBackend};
use nexus_core::validator::ViolationRule;
use nexus_core::{ExecutionEngine, ExecutionStatus};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

struct Harness {
    engine: Arc<ExecutionEngine>,
    runtime: Arc<FakeRuntime>,
    local: Arc<FakeLocalBackend>,
}

fn harness(config: EngineConfig) -> Harness {
    let runtime = Arc::new(FakeRuntime::new());
    let local = Arc::new(FakeLocalBackend::new(true));
    let container: Arc<dyn SandboxBackend> = Arc::new(ContainerOrchestrator::new(
        runtime.clone(),
        config.container.clone(),
        &config.limits,
        vec!["math".to_string()],
    ));
    let fallback: Arc<dyn SandboxBackend> = local.clone();
    let engine = ExecutionEngine::with_backends(config, Some(container), Some(fallback)).unwrap();
    Harness {
        engine: Arc::new(engine),
        runtime,
        local,
    }
}

#[tokio::test]
async fn test_hello_world_succeeds_in_container() {
    let h = harness(EngineConfig::default());
    let result = h
        .engine
        .execute_dynamic_code("print(\"hello\")", Some(30), None)
        .await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.backend_used, Some(BackendKind::Container));
    assert!(!result.degraded_isolation);
    assert!(result.sandbox_id.is_some());
    assert_eq!(result.timeout_seconds, 30);
    assert_eq!(h.runtime.live_units(), 0);
    assert!(h.runtime.run_images().is_empty());
}

#[tokio::test]
async fn test_printing_four_yields_exactly_one_line() {
    let h = harness(EngineConfig::default());
    let result = h.engine.execute_dynamic_code("print(\"4\")", None, None).await;
    assert_eq!(result.stdout, "4\n");
    assert_eq!(result.exit_code, Some(0));
}

#[tokio::test]
async fn test_denied_import_never_reaches_a_backend() {
    let h = harness(EngineConfig::default());
    let result = h
        .engine
        .execute_dynamic_code("import subprocess\nsubprocess.run(['id'])", None, None)
        .await;

    assert_eq!(result.status, ExecutionStatus::SecurityRejected);
    assert!(result.violations.iter().any(|v| {
        v.rule_id == ViolationRule::BlockedImport && v.matched_fragment == "subprocess"
    }));
    assert!(result.sandbox_id.is_none());
    assert!(result.backend_used.is_none());
    assert_eq!(h.runtime.pings.load(Ordering::SeqCst), 0);
    assert_eq!(h.runtime.image_count(), 0);
    assert_eq!(h.local.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_limits_are_clamped_before_use() {
    let h = harness(EngineConfig::default());
    let result = h
        .engine
        .execute_dynamic_code("print(\"x\")", Some(5), Some(1000))
        .await;

    assert_eq!(result.timeout_seconds, 10);
    assert_eq!(result.memory_limit_mb, 512);
    assert_eq!(h.runtime.specs()[0].memory_bytes, 512 * 1024 * 1024);
}

#[tokio::test]
async fn test_user_error_is_data_not_a_fault() {
    let h = harness(EngineConfig::default());
    let result = h
        .engine
        .execute_dynamic_code("raise SystemExit(3)", None, None)
        .await;

    assert_eq!(result.status, ExecutionStatus::CompletedWithError);
    assert_eq!(result.exit_code, Some(3));
    assert!(result.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_infinite_loop_times_out() {
    let h = harness(EngineConfig::default());
    let result = h
        .engine
        .execute_dynamic_code("while True:\n    pass", Some(10), None)
        .await;

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert_eq!(result.exit_code, None);
    assert_eq!(h.runtime.killed().len(), 1);
    assert_eq!(h.runtime.live_units(), 0);
    assert!(h.runtime.run_images().is_empty());
}

#[tokio::test]
async fn test_unreachable_runtime_falls_back_with_degraded_flag() {
    let h = harness(EngineConfig::default());
    h.runtime.reachable.store(false, Ordering::SeqCst);

    let result = h.engine.execute_dynamic_code("print(\"ok\")", None, None).await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.backend_used, Some(BackendKind::LocalRestricted));
    assert!(result.degraded_isolation);
    assert_eq!(h.local.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_probe_is_rate_limited() {
    let h = harness(EngineConfig::default());
    for _ in 0..4 {
        h.engine.execute_dynamic_code("print(\"a\")", None, None).await;
    }
    assert_eq!(h.runtime.pings.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_launch_failure_is_infrastructure_error_and_invalidates_cache() {
    let h = harness(EngineConfig::default());
    h.engine.execute_dynamic_code("print(\"warm\")", None, None).await;
    assert_eq!(h.engine.selector().cached_availability(), Some(true));

    h.runtime.fail_start.store(true, Ordering::SeqCst);
    let result = h.engine.execute_dynamic_code("print(\"x\")", None, None).await;

    assert_eq!(result.status, ExecutionStatus::InfrastructureError);
    assert!(result.error.is_some());
    assert_eq!(h.engine.selector().cached_availability(), None);
    assert_eq!(h.runtime.live_units(), 0);
    assert!(h.runtime.run_images().is_empty());

    // The next call probes again instead of trusting the stale verdict.
    h.runtime.fail_start.store(false, Ordering::SeqCst);
    let result = h.engine.execute_dynamic_code("print(\"y\")", None, None).await;
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(h.runtime.pings.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_nothing_available_is_backend_unavailable() {
    let h = harness(EngineConfig::default());
    h.runtime.reachable.store(false, Ordering::SeqCst);
    h.local.available.store(false, Ordering::SeqCst);

    let result = h.engine.execute_dynamic_code("print(1)", None, None).await;
    assert_eq!(result.status, ExecutionStatus::BackendUnavailable);
    assert!(result.error.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_keep_their_own_output() {
    let h = harness(EngineConfig::default());

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move {
                let result = engine
                    .execute_dynamic_code(&format!("print(\"token-{}\")", i), None, None)
                    .await;
                (i, result)
            })
        })
        .collect();

    let mut sandbox_ids = HashSet::new();
    for handle in handles {
        let (i, result) = handle.await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout, format!("token-{}\n", i));
        sandbox_ids.insert(result.sandbox_id.unwrap());
    }
    assert_eq!(sandbox_ids.len(), 5);
    assert_eq!(h.runtime.live_units(), 0);
    assert!(h.runtime.run_images().is_empty());
}

#[tokio::test]
async fn test_identical_submissions_get_independent_sandboxes() {
    let h = harness(EngineConfig::default());
    let first = h.engine.execute_dynamic_code("print(\"same\")", None, None).await;
    let second = h.engine.execute_dynamic_code("print(\"same\")", None, None).await;

    assert_ne!(first.sandbox_id, second.sandbox_id);
    assert_eq!(first.stdout, second.stdout);
    let specs = h.runtime.specs();
    assert_ne!(specs[0].image, specs[1].image);
}

#[tokio::test]
async fn test_engine_recovers_after_base_image_prune() {
    let h = harness(EngineConfig::default());
    let first = h.engine.execute_dynamic_code("print(\"warm\")", None, None).await;
    assert_eq!(first.status, ExecutionStatus::Success);

    h.runtime.prune_images();

    let second = h.engine.execute_dynamic_code("print(\"cold\")", None, None).await;
    assert_eq!(second.status, ExecutionStatus::Success);
    assert_eq!(second.stdout, "cold\n");
    assert_eq!(second.backend_used, Some(BackendKind::Container));
    assert_eq!(h.runtime.base_builds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_teardown_failure_is_infrastructure_error() {
    let h = harness(EngineConfig::default());
    h.runtime.fail_remove_image.store(true, Ordering::SeqCst);

    let result = h.engine.execute_dynamic_code("print(\"ok\")", None, None).await;

    assert_eq!(result.status, ExecutionStatus::InfrastructureError);
    assert!(result.error.is_some());
    assert!(result.stdout.is_empty());
    assert_eq!(h.engine.selector().cached_availability(), None);
}

#[tokio::test]
#[ignore] // Requires a running Docker daemon and network access to pull the base image
async fn test_real_docker_round_trip() {
    let engine = ExecutionEngine::from_config(EngineConfig::default()).unwrap();
    let result = engine.execute_dynamic_code("print(2 + 2)", Some(30), None).await;
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.stdout, "4\n");
    assert_eq!(result.backend_used, Some(BackendKind::Container));
}
