//! # Worker Scheduler
//!
//! Maintains a pool of `max_workers` concurrent workers and feeds them
//! ready tasks. Each step reaps finished workers first (freeing slots),
//! then claims ready records FIFO while the queue is active. Claims go
//! through the store's atomic `next_pending`, so several managers on
//! different queues or crash-restarts never double-run a record.
//!
//! Dependency materialization happens here, immediately before spawn: the
//! claimed record's args are rebuilt with the *current* cached results of
//! its dependencies and handed to the worker via a per-task spec file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::cache::ResultCache;
use crate::environment::Environment;
use crate::error::{PipelineError, PipelineResult};
use crate::provider::{Provider, WorkerHandle, WorkerLaunch, WorkerPoll};
use crate::record::{
    QueueState, ResultRef, TaskRecord, TaskState, ERRNO_NO_REPORT, ERRNO_PROVIDER, STREAM_CAP,
};
use crate::store::{QueueStore, StateUpdate};
use crate::worker::{TaskSpec, WorkerReport};

/// Per-scheduler knobs; `TaskManager::clone_with` creates sibling managers
/// that share a queue but differ here
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrent worker ceiling
    pub max_workers: usize,
    /// On shutdown, wait for in-flight workers instead of killing them
    pub wait_on_shutdown: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            wait_on_shutdown: true,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    task_id: i64,
    handle: WorkerHandle,
    launch: WorkerLaunch,
    report_path: PathBuf,
}

/// In-process policy deciding which ready task runs next and how many
/// workers run concurrently
#[derive(Debug)]
pub struct Scheduler {
    store: QueueStore,
    cache: ResultCache,
    provider: Provider,
    environment: Environment,
    config: SchedulerConfig,
    specs_dir: PathBuf,
    running: Vec<InFlight>,
}

impl Scheduler {
    pub fn new(
        store: QueueStore,
        cache: ResultCache,
        provider: Provider,
        environment: Environment,
        config: SchedulerConfig,
    ) -> PipelineResult<Self> {
        let specs_dir = store.namespace_dir().join("specs");
        std::fs::create_dir_all(&specs_dir)?;
        Ok(Self {
            store,
            cache,
            provider,
            environment,
            config,
            specs_dir,
            running: Vec::new(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Task ids currently tracked by this scheduler (for the orphan sweep)
    pub fn tracked_ids(&self) -> Vec<i64> {
        self.running.iter().map(|w| w.task_id).collect()
    }

    /// One scheduling round: reap completions, then claim while slots and
    /// ready tasks remain. A paused queue reaps but claims nothing.
    pub async fn step(&mut self, queue_state: QueueState) -> PipelineResult<()> {
        self.reap().await?;
        if queue_state == QueueState::Active {
            self.claim_ready().await?;
        }
        Ok(())
    }

    async fn reap(&mut self) -> PipelineResult<()> {
        let mut finished = Vec::new();
        for (idx, worker) in self.running.iter_mut().enumerate() {
            match self.provider.poll(&mut worker.handle).await {
                Ok(WorkerPoll::Running) => {}
                Ok(WorkerPoll::Exited { code }) => finished.push((idx, code)),
                Err(e) => {
                    warn!(task_id = worker.task_id, error = %e, "worker poll failed");
                    finished.push((idx, -1));
                }
            }
        }
        // Reverse order keeps the remaining swap_remove indices valid
        for (idx, code) in finished.into_iter().rev() {
            let worker = self.running.swap_remove(idx);
            self.finalize(worker, code).await?;
        }
        Ok(())
    }

    /// Write back the outcome of one exited worker
    #[instrument(skip(self, worker), fields(task_id = worker.task_id))]
    async fn finalize(&mut self, worker: InFlight, exit_code: i32) -> PipelineResult<()> {
        let record = self.store.get(worker.task_id).await?;
        let stdout_file = read_capped(&worker.launch.stdout_path);
        let stderr_file = read_capped(&worker.launch.stderr_path);
        let report: Option<WorkerReport> = std::fs::read(&worker.report_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());

        let finished_at = Some(Utc::now());
        match report {
            Some(report) if exit_code == 0 && report.errno == 0 => {
                let payload = report.payload.unwrap_or(Value::Null);
                let path = self.cache.put(&record.fingerprint, &payload)?;
                let update = StateUpdate {
                    errno: Some(0),
                    out: Some(cap(prefer(report.out, stdout_file))),
                    err: Some(cap(prefer(report.err, stderr_file))),
                    result_ref: Some(ResultRef {
                        path,
                        fingerprint: record.fingerprint.clone(),
                    }),
                    finished_at,
                    ..StateUpdate::default()
                };
                if self
                    .store
                    .update(worker.task_id, TaskState::Running, TaskState::Succeeded, update)
                    .await?
                {
                    info!(task_id = worker.task_id, app = %record.app_name, "task succeeded");
                } else {
                    warn!(task_id = worker.task_id, "lost finalization race");
                }
            }
            Some(report) => {
                let errno = if report.errno != 0 {
                    report.errno
                } else {
                    exit_code
                };
                let update = StateUpdate {
                    errno: Some(errno),
                    out: Some(cap(prefer(report.out, stdout_file))),
                    err: Some(cap(prefer(report.err, stderr_file))),
                    finished_at,
                    ..StateUpdate::default()
                };
                self.store
                    .update(worker.task_id, TaskState::Running, TaskState::Failed, update)
                    .await?;
                warn!(
                    task_id = worker.task_id,
                    app = %record.app_name,
                    errno,
                    "task failed"
                );
            }
            None => {
                // Worker died before writing its report (crash, OOM kill,
                // batch preemption)
                let errno = if exit_code != 0 { exit_code } else { ERRNO_NO_REPORT };
                let err = if stderr_file.is_empty() {
                    format!("worker exited {exit_code} without writing a report")
                } else {
                    stderr_file
                };
                let update = StateUpdate {
                    errno: Some(errno),
                    out: Some(cap(stdout_file)),
                    err: Some(cap(err)),
                    finished_at,
                    ..StateUpdate::default()
                };
                self.store
                    .update(worker.task_id, TaskState::Running, TaskState::Failed, update)
                    .await?;
                warn!(task_id = worker.task_id, exit_code, "worker left no report");
            }
        }
        Ok(())
    }

    async fn claim_ready(&mut self) -> PipelineResult<()> {
        while self.running.len() < self.config.max_workers {
            let Some(record) = self.store.next_pending().await? else {
                break;
            };
            if let Err(e) = self.dispatch(&record).await {
                if !e.is_recoverable() {
                    return Err(e);
                }
                warn!(task_id = record.id, error = %e, "dispatch failed");
                let update = StateUpdate {
                    errno: Some(ERRNO_PROVIDER),
                    err: Some(e.to_string()),
                    finished_at: Some(Utc::now()),
                    ..StateUpdate::default()
                };
                self.store
                    .update(record.id, TaskState::Running, TaskState::Failed, update)
                    .await?;
            }
        }
        Ok(())
    }

    /// Materialize arguments and hand the task to the provider
    async fn dispatch(&mut self, record: &TaskRecord) -> PipelineResult<()> {
        let mut results = BTreeMap::new();
        for dep_id in &record.dep_ids {
            let dep = self.store.get(*dep_id).await?;
            let rref = dep.result_ref.ok_or_else(|| {
                PipelineError::provider(format!(
                    "dependency {dep_id} of task {} has no stored result",
                    record.id
                ))
            })?;
            match self.cache.get(&rref.fingerprint) {
                Ok(value) => {
                    results.insert(*dep_id, value);
                }
                Err(PipelineError::CacheCorrupt { reason, .. }) => {
                    // A corrupt entry is a miss: the dependency, not this
                    // record, must re-run. Evict the entry, send the
                    // dependency back through the queue, and release our
                    // claim so the record waits for the fresh result.
                    warn!(
                        task_id = record.id,
                        dep_id = *dep_id,
                        fingerprint = %rref.fingerprint,
                        reason = %reason,
                        "corrupt cached dependency result, re-running dependency"
                    );
                    self.cache.evict(&rref.fingerprint)?;
                    self.store.requeue(*dep_id, TaskState::Succeeded).await?;
                    if !self.store.requeue(record.id, TaskState::Running).await? {
                        warn!(task_id = record.id, "failed to release claim after cache miss");
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        let args: Vec<Value> = record
            .args
            .iter()
            .map(|node| node.materialize(&results))
            .collect::<PipelineResult<_>>()?;
        let mut kwargs = BTreeMap::new();
        for (key, node) in &record.kwargs {
            kwargs.insert(key.clone(), node.materialize(&results)?);
        }

        let stem = format!("task-{}", record.id);
        let spec = TaskSpec {
            task_id: record.id,
            queue: self.store.name().to_string(),
            app_name: record.app_name.clone(),
            kind: record.kind,
            args,
            kwargs,
            env: self.environment.vars().clone(),
            report_path: self.specs_dir.join(format!("{stem}.report.json")),
        };
        let spec_path = self.specs_dir.join(format!("{stem}.json"));
        // Stale report from a previous attempt must not be mistaken for
        // this run's outcome
        let _ = std::fs::remove_file(&spec.report_path);
        std::fs::write(&spec_path, serde_json::to_vec_pretty(&spec)?)?;

        let launch = WorkerLaunch {
            task_id: record.id,
            spec_path,
            stdout_path: self.specs_dir.join(format!("{stem}.out")),
            stderr_path: self.specs_dir.join(format!("{stem}.err")),
            env: self.environment.vars().clone(),
        };
        let handle = self.provider.spawn(&launch).await?;

        let update = StateUpdate {
            jobid: Some(handle.jobid()),
            ..StateUpdate::default()
        };
        self.store
            .update(record.id, TaskState::Running, TaskState::Running, update)
            .await?;

        debug!(
            task_id = record.id,
            app = %record.app_name,
            jobid = %handle.jobid(),
            "task dispatched"
        );
        self.running.push(InFlight {
            task_id: record.id,
            handle,
            launch,
            report_path: spec.report_path,
        });
        Ok(())
    }

    /// Drain or kill in-flight workers at manager exit
    pub async fn shutdown(&mut self) -> PipelineResult<()> {
        if self.config.wait_on_shutdown {
            while !self.running.is_empty() {
                self.reap().await?;
                if !self.running.is_empty() {
                    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                }
            }
        } else {
            let mut workers = std::mem::take(&mut self.running);
            for worker in &mut workers {
                if let Err(e) = self.provider.kill(&mut worker.handle).await {
                    warn!(task_id = worker.task_id, error = %e, "failed to kill worker");
                }
                let update = StateUpdate {
                    err: Some("killed at manager shutdown".to_string()),
                    finished_at: Some(Utc::now()),
                    ..StateUpdate::default()
                };
                self.store
                    .update(worker.task_id, TaskState::Running, TaskState::Killed, update)
                    .await?;
            }
        }
        Ok(())
    }
}

fn read_capped(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => cap(String::from_utf8_lossy(&bytes).into_owned()),
        Err(_) => String::new(),
    }
}

fn prefer(primary: String, fallback: String) -> String {
    if primary.is_empty() {
        fallback
    } else {
        primary
    }
}

fn cap(mut text: String) -> String {
    if text.len() > STREAM_CAP {
        let mut cut = STREAM_CAP;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_respects_char_boundaries() {
        let text = "é".repeat(STREAM_CAP);
        let capped = cap(text);
        assert!(capped.len() <= STREAM_CAP);
        assert!(capped.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_prefer_takes_non_empty() {
        assert_eq!(prefer(String::new(), "b".to_string()), "b");
        assert_eq!(prefer("a".to_string(), "b".to_string()), "a");
    }
}
