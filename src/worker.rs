//! # Worker Execution
//!
//! A worker is a short-lived process that executes exactly one task: it
//! reads a spec file written by the scheduler at dispatch time, runs the
//! native or shell callable, and writes a report file next to it. The
//! scheduler, not the worker, finalizes the record — the store stays the
//! only serialized shared state.
//!
//! Native apps need the user's [`AppRegistry`], so the worker process for
//! them is the user's own binary re-entered through [`bootstrap`]. Shell
//! apps carry their whole argv in the spec and also run under the
//! standalone `skypipe-worker` binary.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::app::{AppRegistry, TaskArgs};
use crate::error::PipelineResult;
use crate::record::TaskKind;

/// Env var carrying the spec path into a worker process
pub const WORKER_SPEC_ENV: &str = "SKYPIPE_WORKER_SPEC";
/// Env var carrying the queue store path into an auto-spawned manager
pub const SPAWN_QUEUE_ENV: &str = "SKYPIPE_SPAWN_QUEUE";

/// Everything a worker needs to run one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: i64,
    pub queue: String,
    pub app_name: String,
    pub kind: TaskKind,
    /// Materialized positional arguments (futures already substituted)
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    /// Environment variables exported verbatim
    pub env: BTreeMap<String, String>,
    /// Where the worker writes its report
    pub report_path: PathBuf,
}

/// What the worker hands back to the scheduler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Zero on success
    pub errno: i32,
    /// Captured stdout (shell apps; empty for native, whose process-level
    /// stdio the provider redirects to files)
    #[serde(default)]
    pub out: String,
    #[serde(default)]
    pub err: String,
    /// Result payload, present on success
    #[serde(default)]
    pub payload: Option<Value>,
}

impl WorkerReport {
    fn failure(errno: i32, err: impl Into<String>) -> Self {
        Self {
            errno,
            err: err.into(),
            ..Self::default()
        }
    }
}

/// Execute one task spec in-process
pub fn run_spec(spec: &TaskSpec, registry: &AppRegistry) -> WorkerReport {
    debug!(
        task_id = spec.task_id,
        app = %spec.app_name,
        kind = %spec.kind,
        "worker executing task"
    );
    match spec.kind {
        TaskKind::Native => run_native(spec, registry),
        TaskKind::Shell => run_shell(spec),
    }
}

fn run_native(spec: &TaskSpec, registry: &AppRegistry) -> WorkerReport {
    let Some(app) = registry.get(&spec.app_name) else {
        return WorkerReport::failure(
            127,
            format!("app {:?} is not registered in this process", spec.app_name),
        );
    };
    let task_args = TaskArgs {
        args: spec.args.clone(),
        kwargs: spec.kwargs.clone(),
    };
    match catch_unwind(AssertUnwindSafe(|| app(&task_args))) {
        Ok(Ok(payload)) => WorkerReport {
            errno: 0,
            payload: Some(payload),
            ..WorkerReport::default()
        },
        Ok(Err(app_err)) => WorkerReport::failure(1, app_err.to_string()),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_string());
            WorkerReport::failure(1, format!("panic: {msg}"))
        }
    }
}

fn run_shell(spec: &TaskSpec) -> WorkerReport {
    let argv: Vec<String> = spec.args.iter().map(argv_piece).collect();
    let Some((program, rest)) = argv.split_first() else {
        return WorkerReport::failure(127, "shell task with empty argv");
    };

    match Command::new(program).args(rest).envs(&spec.env).output() {
        Ok(output) => {
            let out = String::from_utf8_lossy(&output.stdout).into_owned();
            let err = String::from_utf8_lossy(&output.stderr).into_owned();
            let errno = output.status.code().unwrap_or(-1);
            // A shell task's payload is its captured stdout, so dependents
            // can consume it like any other result
            let payload = (errno == 0).then(|| Value::String(out.clone()));
            WorkerReport {
                errno,
                out,
                err,
                payload,
            }
        }
        Err(e) => WorkerReport::failure(127, format!("failed to launch {program:?}: {e}")),
    }
}

/// Shell argv pieces: strings verbatim, scalars via display, anything else
/// as compact JSON
fn argv_piece(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Read a spec file, execute it, and write the report atomically
pub fn run_spec_file(path: &Path, registry: &AppRegistry) -> PipelineResult<()> {
    let spec: TaskSpec = serde_json::from_slice(&std::fs::read(path)?)?;
    for (key, value) in &spec.env {
        std::env::set_var(key, value);
    }
    let report = run_spec(&spec, registry);
    if report.errno != 0 {
        error!(
            task_id = spec.task_id,
            errno = report.errno,
            err = %report.err,
            "task execution failed"
        );
    }

    let tmp = spec.report_path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&report)?)?;
    std::fs::rename(&tmp, &spec.report_path)?;
    Ok(())
}

/// Re-entry hook for worker and auto-spawned-manager modes
///
/// Call first thing in `main`:
///
/// ```ignore
/// let mut registry = AppRegistry::new();
/// registry.register("fraction", fraction);
/// if let Some(code) = skypipe_core::bootstrap(&registry)? {
///     std::process::exit(code);
/// }
/// ```
///
/// Returns `Some(exit_code)` when this process was launched as a worker
/// (`SKYPIPE_WORKER_SPEC`) or as a detached manager (`SKYPIPE_SPAWN_QUEUE`),
/// `None` for a normal client run.
pub fn bootstrap(registry: &AppRegistry) -> PipelineResult<Option<i32>> {
    if let Ok(spec_path) = std::env::var(WORKER_SPEC_ENV) {
        run_spec_file(Path::new(&spec_path), registry)?;
        return Ok(Some(0));
    }
    if let Ok(queue_path) = std::env::var(SPAWN_QUEUE_ENV) {
        run_manager_mode(Path::new(&queue_path))?;
        return Ok(Some(0));
    }
    Ok(None)
}

fn run_manager_mode(queue_path: &Path) -> PipelineResult<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let config = crate::config::PipelineConfig::load()?;
        let store = crate::store::QueueStore::attach(queue_path).await?;
        let manager = crate::manager::Manager::from_config(store, &config).await?;
        manager.run().await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppError;

    fn spec(kind: TaskKind, app_name: &str, args: Vec<Value>) -> TaskSpec {
        TaskSpec {
            task_id: 1,
            queue: "test".to_string(),
            app_name: app_name.to_string(),
            kind,
            args,
            kwargs: BTreeMap::new(),
            env: BTreeMap::new(),
            report_path: PathBuf::from("/dev/null"),
        }
    }

    fn registry() -> AppRegistry {
        let mut registry = AppRegistry::new();
        registry.register("add", |args: &TaskArgs| {
            Ok(Value::from(args.arg_f64(0)? + args.arg_f64(1)?))
        });
        registry.register("boom", |_: &TaskArgs| -> Result<Value, AppError> {
            panic!("kaboom")
        });
        registry.register("refuse", |_: &TaskArgs| {
            Err(AppError::new("bad input shape"))
        });
        registry
    }

    // ---- Native apps ----

    #[test]
    fn test_native_success() {
        let report = run_spec(
            &spec(TaskKind::Native, "add", vec![Value::from(1.5), Value::from(2.5)]),
            &registry(),
        );
        assert_eq!(report.errno, 0);
        assert_eq!(report.payload, Some(Value::from(4.0)));
    }

    #[test]
    fn test_native_app_error() {
        let report = run_spec(&spec(TaskKind::Native, "refuse", vec![]), &registry());
        assert_eq!(report.errno, 1);
        assert_eq!(report.err, "bad input shape");
        assert!(report.payload.is_none());
    }

    #[test]
    fn test_native_panic_is_captured() {
        let report = run_spec(&spec(TaskKind::Native, "boom", vec![]), &registry());
        assert_eq!(report.errno, 1);
        assert!(report.err.contains("kaboom"));
    }

    #[test]
    fn test_native_unregistered() {
        let report = run_spec(&spec(TaskKind::Native, "ghost", vec![]), &registry());
        assert_eq!(report.errno, 127);
        assert!(report.err.contains("not registered"));
    }

    // ---- Shell apps ----

    #[test]
    fn test_shell_captures_stdout() {
        let report = run_spec(
            &spec(
                TaskKind::Shell,
                "echo",
                vec![
                    Value::from("echo"),
                    Value::from("-n"),
                    Value::from("pi ~ 3.1416"),
                ],
            ),
            &registry(),
        );
        assert_eq!(report.errno, 0);
        assert_eq!(report.out, "pi ~ 3.1416");
        assert_eq!(report.payload, Some(Value::from("pi ~ 3.1416")));
    }

    #[test]
    fn test_shell_nonzero_exit() {
        let report = run_spec(
            &spec(
                TaskKind::Shell,
                "false",
                vec![Value::from("false")],
            ),
            &registry(),
        );
        assert_ne!(report.errno, 0);
        assert!(report.payload.is_none());
    }

    #[test]
    fn test_shell_empty_argv() {
        let report = run_spec(&spec(TaskKind::Shell, "none", vec![]), &registry());
        assert_eq!(report.errno, 127);
    }

    #[test]
    fn test_shell_numeric_argv_pieces() {
        assert_eq!(argv_piece(&Value::from(42)), "42");
        assert_eq!(argv_piece(&Value::from("x")), "x");
        assert_eq!(argv_piece(&serde_json::json!([1, 2])), "[1,2]");
    }

    // ---- Spec file round trip ----

    #[test]
    fn test_run_spec_file_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let report_path = dir.path().join("task-1.report.json");
        let mut task = spec(
            TaskKind::Shell,
            "echo",
            vec![Value::from("echo"), Value::from("-n"), Value::from("hi")],
        );
        task.report_path = report_path.clone();

        let spec_path = dir.path().join("task-1.json");
        std::fs::write(&spec_path, serde_json::to_vec(&task).unwrap()).unwrap();

        run_spec_file(&spec_path, &AppRegistry::new()).unwrap();
        let report: WorkerReport =
            serde_json::from_slice(&std::fs::read(&report_path).unwrap()).unwrap();
        assert_eq!(report.errno, 0);
        assert_eq!(report.out, "hi");
    }
}
