//! End-to-end pipeline tests: enqueue through the task manager, drain with
//! a real manager loop dispatching OS-process workers (the `skypipe-worker`
//! binary), observe futures, and exercise caching across sessions.

use std::path::Path;

use skypipe_core::scheduler::SchedulerConfig;
use skypipe_core::{
    Environment, PipelineConfig, PipelineError, QueueState, Scheduler, TaskFuture, TaskManager,
    TaskState,
};

fn test_config(base_dir: &Path, max_workers: usize) -> PipelineConfig {
    PipelineConfig {
        base_dir: base_dir.to_path_buf(),
        poll_interval_ms: 100,
        max_workers,
        worker_command: Some(vec![env!("CARGO_BIN_EXE_skypipe-worker").to_string()]),
        ..PipelineConfig::default()
    }
}

async fn manager(base_dir: &Path, queue: &str, max_workers: usize) -> TaskManager {
    TaskManager::new(queue, test_config(base_dir, max_workers), Environment::default())
        .await
        .unwrap()
}

// ---- Shell apps ----

#[tokio::test]
async fn test_shell_stdout_capture() {
    let dir = tempfile::tempdir().unwrap();
    let tm = manager(dir.path(), "shell", 1).await;

    let future = tm
        .shell("echo-pi")
        .args(["echo", "-n", "pi ~ 3.1416"])
        .submit()
        .await
        .unwrap();
    tm.drain().await.unwrap();

    assert_eq!(future.out().await.unwrap(), "pi ~ 3.1416");
    // A shell task's payload is its stdout
    assert_eq!(
        future.result().await.unwrap(),
        serde_json::Value::from("pi ~ 3.1416")
    );
}

#[tokio::test]
async fn test_fan_out_drains_all() {
    let dir = tempfile::tempdir().unwrap();
    let tm = manager(dir.path(), "fanout", 3).await;

    let mut futures = Vec::new();
    for i in 0..6 {
        futures.push(
            tm.shell("echo-seed")
                .arg("echo")
                .arg("-n")
                .arg(format!("seed-{i}"))
                .submit()
                .await
                .unwrap(),
        );
    }
    tm.drain().await.unwrap();

    for (i, future) in futures.iter().enumerate() {
        assert_eq!(future.out().await.unwrap(), format!("seed-{i}"));
    }
    let counts = tm.store().counts_by_state().await.unwrap();
    assert_eq!(counts[&TaskState::Succeeded], 6);
}

// ---- Dependencies ----

#[tokio::test]
async fn test_dependency_chain_materializes_results() {
    let dir = tempfile::tempdir().unwrap();
    let tm = manager(dir.path(), "deps", 2).await;

    let producer = tm
        .shell("produce")
        .args(["echo", "-n", "hello"])
        .submit()
        .await
        .unwrap();
    // The consumer's argv embeds the producer's future; at dispatch the
    // scheduler substitutes the resolved payload ("hello")
    let consumer = tm
        .shell("relay")
        .arg("echo")
        .arg("-n")
        .arg(producer.as_arg())
        .submit()
        .await
        .unwrap();

    // Dependent records start out waiting
    let record = tm
        .store()
        .get(consumer.task_id().unwrap())
        .await
        .unwrap();
    assert_eq!(record.state, TaskState::Waiting);
    assert_eq!(record.dep_ids, vec![producer.task_id().unwrap()]);

    tm.drain().await.unwrap();
    assert_eq!(consumer.out().await.unwrap(), "hello");

    // Causality: the producer finished before the consumer started
    let produced = tm.store().get(producer.task_id().unwrap()).await.unwrap();
    let consumed = tm.store().get(consumer.task_id().unwrap()).await.unwrap();
    assert!(produced.finished_at.unwrap() <= consumed.started_at.unwrap());
}

#[tokio::test]
async fn test_foreign_future_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let tm_a = manager(dir.path(), "queue-a", 1).await;
    let tm_b = manager(dir.path(), "queue-b", 1).await;

    let foreign = tm_a
        .shell("produce")
        .args(["echo", "-n", "x"])
        .submit()
        .await
        .unwrap();

    let err = tm_b
        .shell("consume")
        .arg("echo")
        .arg(foreign.as_arg())
        .submit()
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Enqueue(_)));
}

// ---- Caching ----

#[tokio::test]
async fn test_cache_short_circuits_second_session() {
    let dir = tempfile::tempdir().unwrap();
    {
        let tm = manager(dir.path(), "session1", 1).await;
        let future = tm
            .shell("compute")
            .args(["echo", "-n", "expensive"])
            .submit()
            .await
            .unwrap();
        tm.drain().await.unwrap();
        assert_eq!(future.out().await.unwrap(), "expensive");
    }

    // New session, even a different queue under the same base dir: the
    // identical declaration short-circuits without running a worker
    let tm = manager(dir.path(), "session2", 1).await;
    let future = tm
        .shell("compute")
        .args(["echo", "-n", "expensive"])
        .submit()
        .await
        .unwrap();

    let record = tm.store().get(future.task_id().unwrap()).await.unwrap();
    assert_eq!(record.state, TaskState::Succeeded);
    assert!(record.started_at.is_none(), "no worker may run on a cache hit");
    assert_eq!(
        future.result().await.unwrap(),
        serde_json::Value::from("expensive")
    );
}

#[tokio::test]
async fn test_changed_argv_misses_cache() {
    let dir = tempfile::tempdir().unwrap();
    let tm = manager(dir.path(), "invalidate", 1).await;

    let first = tm
        .shell("compute")
        .args(["echo", "-n", "v1"])
        .submit()
        .await
        .unwrap();
    tm.drain().await.unwrap();
    first.result().await.unwrap();

    // Any change to a participating input yields a fresh record
    let second = tm
        .shell("compute")
        .args(["echo", "-n", "v2"])
        .submit()
        .await
        .unwrap();
    let record = tm.store().get(second.task_id().unwrap()).await.unwrap();
    assert_eq!(record.state, TaskState::Pending);
    assert_ne!(first.fingerprint(), second.fingerprint());
}

#[tokio::test]
async fn test_source_edit_changes_fingerprint_comment_included() {
    let dir = tempfile::tempdir().unwrap();
    let tm = manager(dir.path(), "source-edit", 1).await;

    let original = tm
        .app("fraction")
        .source("fn fraction(seed: f64) -> f64 { seed / 10.0 }")
        .kwarg("seed", 3i64)
        .skip(true)
        .submit()
        .await
        .unwrap();
    assert!(original.is_null());

    // skip() returns null futures with no fingerprint, so compare via two
    // non-skipped declarations instead
    let a = tm
        .app("fraction")
        .source("fn fraction(seed: f64) -> f64 { seed / 10.0 }")
        .kwarg("seed", 3i64)
        .submit()
        .await
        .unwrap();
    let b = tm
        .app("fraction")
        .source("fn fraction(seed: f64) -> f64 { seed / 10.0 } // comment")
        .kwarg("seed", 3i64)
        .submit()
        .await
        .unwrap();
    assert_ne!(a.fingerprint(), b.fingerprint());

    // A named declaration rebinds regardless of source text
    let c = tm
        .app("fraction")
        .source("totally different body")
        .named()
        .kwarg("seed", 3i64)
        .submit()
        .await
        .unwrap();
    let d = tm
        .app("fraction")
        .source("another body again")
        .named()
        .kwarg("seed", 3i64)
        .submit()
        .await
        .unwrap();
    assert_eq!(c.fingerprint(), d.fingerprint());
}

#[tokio::test]
async fn test_duplicate_fingerprint_single_execution() {
    let dir = tempfile::tempdir().unwrap();
    let tm = manager(dir.path(), "dedup", 1).await;

    let first = tm
        .shell("compute")
        .args(["echo", "-n", "once"])
        .submit()
        .await
        .unwrap();
    tm.drain().await.unwrap();

    let second = tm
        .shell("compute")
        .args(["echo", "-n", "once"])
        .submit()
        .await
        .unwrap();
    assert_eq!(first.fingerprint(), second.fingerprint());

    // The second enqueue resolves to the first's result without another
    // worker execution
    let record = tm.store().get(second.task_id().unwrap()).await.unwrap();
    assert_eq!(record.state, TaskState::Succeeded);
    assert!(record.jobid.is_none());
    assert_eq!(second.result().await.unwrap(), first.result().await.unwrap());
}

// ---- Failure handling ----

#[tokio::test]
async fn test_failed_task_surfaces_and_retries() {
    let dir = tempfile::tempdir().unwrap();
    let tm = manager(dir.path(), "failures", 1).await;

    let future = tm.shell("bad").args(["false"]).submit().await.unwrap();
    tm.drain().await.unwrap();

    let err = future.result().await.unwrap_err();
    assert!(matches!(err, PipelineError::TaskFailed { .. }));

    let retried = tm
        .store()
        .retry(TaskState::Failed, skypipe_core::RetryMode::Orphaned)
        .await
        .unwrap();
    assert_eq!(retried, 1);
    let record = tm.store().get(future.task_id().unwrap()).await.unwrap();
    assert_eq!(record.state, TaskState::Pending);
}

// ---- Pause ----

#[tokio::test]
async fn test_paused_scheduler_claims_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let tm = manager(dir.path(), "paused", 2).await;

    let future = tm
        .shell("idle")
        .args(["echo", "-n", "x"])
        .submit()
        .await
        .unwrap();
    tm.store().set_queue_state(QueueState::Paused).await.unwrap();

    let config = test_config(dir.path(), 2);
    let mut scheduler = Scheduler::new(
        tm.store().clone(),
        tm.cache().clone(),
        config.build_provider().unwrap(),
        Environment::default(),
        SchedulerConfig {
            max_workers: 2,
            wait_on_shutdown: true,
        },
    )
    .unwrap();

    scheduler.step(QueueState::Paused).await.unwrap();
    assert_eq!(scheduler.in_flight(), 0);
    let record = tm.store().get(future.task_id().unwrap()).await.unwrap();
    assert_eq!(record.state, TaskState::Pending);

    // Resume and drain normally
    tm.store().set_queue_state(QueueState::Active).await.unwrap();
    tm.drain().await.unwrap();
    assert_eq!(future.out().await.unwrap(), "x");
}

// ---- Skip ----

#[tokio::test]
async fn test_skip_returns_null_future() {
    let dir = tempfile::tempdir().unwrap();
    let tm = manager(dir.path(), "skipped", 1).await;

    let future = tm
        .shell("never")
        .args(["echo", "nope"])
        .skip(true)
        .submit()
        .await
        .unwrap();
    assert!(future.is_null());
    assert_eq!(future.result().await.unwrap(), serde_json::Value::Null);
    assert_eq!(future.out().await.unwrap(), "");

    // Nothing was enqueued
    let counts = tm.store().counts_by_state().await.unwrap();
    assert_eq!(counts.values().sum::<i64>(), 0);

    // And a null future embeds as a plain null argument, joining no graph
    assert_eq!(TaskFuture::null().as_arg(), skypipe_core::ArgNode::Null);
}
