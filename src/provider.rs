//! # Dispatch Providers
//!
//! Abstraction over *how* a worker process is started. Two variants: a
//! local fork-exec pool and a Slurm batch submitter. Enum dispatch, no
//! trait objects. The provider knows nothing about fingerprints or the
//! queue; it launches processes and observes them.
//!
//! Contract: `spawn(launch) → handle`, `poll(handle) → running | exited`,
//! `kill(handle)`. Worker stdio is redirected to per-task files so chatty
//! workers cannot deadlock the coordinator on a pipe.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::record::ERRNO_TIMEOUT;
use crate::worker::{SPAWN_QUEUE_ENV, WORKER_SPEC_ENV};

/// What the scheduler hands a provider for one dispatch
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub task_id: i64,
    pub spec_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    /// Queue environment, exported verbatim into the worker process
    pub env: BTreeMap<String, String>,
}

/// Provider observation of a spawned worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoll {
    Running,
    Exited { code: i32 },
}

/// Batch-system knobs (Slurm vocabulary)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub nodes: u32,
    pub mpiprocs_per_worker: u32,
    pub mpithreads_per_worker: u32,
    /// `HH:MM:SS`
    pub walltime: String,
    pub submit_command: String,
    pub poll_command: String,
    pub cancel_command: String,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            nodes: 1,
            mpiprocs_per_worker: 1,
            mpithreads_per_worker: 1,
            walltime: "01:00:00".to_string(),
            submit_command: "sbatch".to_string(),
            poll_command: "squeue".to_string(),
            cancel_command: "scancel".to_string(),
        }
    }
}

/// Handle on one spawned worker
#[derive(Debug)]
pub enum WorkerHandle {
    Local { child: Child, pid: u32 },
    Batch { jobid: String },
}

impl WorkerHandle {
    /// Provider-issued identifier recorded on the task (`jobid` column)
    pub fn jobid(&self) -> String {
        match self {
            WorkerHandle::Local { pid, .. } => pid.to_string(),
            WorkerHandle::Batch { jobid } => jobid.clone(),
        }
    }
}

/// Local fork-exec backend
#[derive(Debug, Clone)]
pub struct LocalProvider {
    /// Worker executable plus leading arguments; the spec path travels in
    /// `SKYPIPE_WORKER_SPEC`
    pub worker_command: Vec<String>,
}

/// Slurm batch backend
#[derive(Debug, Clone)]
pub struct BatchProvider {
    pub worker_command: Vec<String>,
    pub settings: BatchSettings,
}

/// Pluggable dispatch backend
#[derive(Debug, Clone)]
pub enum Provider {
    Local(LocalProvider),
    Batch(BatchProvider),
}

impl Provider {
    /// Launch a worker for one task spec
    pub async fn spawn(&self, launch: &WorkerLaunch) -> PipelineResult<WorkerHandle> {
        match self {
            Provider::Local(local) => local.spawn(launch),
            Provider::Batch(batch) => batch.spawn(launch).await,
        }
    }

    /// Observe a spawned worker without blocking on it
    pub async fn poll(&self, handle: &mut WorkerHandle) -> PipelineResult<WorkerPoll> {
        match (self, handle) {
            (Provider::Local(_), WorkerHandle::Local { child, .. }) => {
                match child.try_wait().map_err(|e| {
                    PipelineError::provider(format!("failed to poll worker: {e}"))
                })? {
                    Some(status) => Ok(WorkerPoll::Exited {
                        code: status.code().unwrap_or(-1),
                    }),
                    None => Ok(WorkerPoll::Running),
                }
            }
            (Provider::Batch(batch), WorkerHandle::Batch { jobid }) => batch.poll(jobid).await,
            _ => Err(PipelineError::provider(
                "worker handle does not belong to this provider",
            )),
        }
    }

    pub async fn kill(&self, handle: &mut WorkerHandle) -> PipelineResult<()> {
        match (self, handle) {
            (Provider::Local(_), WorkerHandle::Local { child, pid }) => {
                debug!(pid = *pid, "killing local worker");
                child
                    .kill()
                    .await
                    .map_err(|e| PipelineError::provider(format!("failed to kill worker: {e}")))
            }
            (Provider::Batch(batch), WorkerHandle::Batch { jobid }) => batch.cancel(jobid).await,
            _ => Err(PipelineError::provider(
                "worker handle does not belong to this provider",
            )),
        }
    }
}

impl LocalProvider {
    fn spawn(&self, launch: &WorkerLaunch) -> PipelineResult<WorkerHandle> {
        let (program, rest) = self
            .worker_command
            .split_first()
            .ok_or_else(|| PipelineError::provider("empty worker command"))?;

        let stdout = std::fs::File::create(&launch.stdout_path)?;
        let stderr = std::fs::File::create(&launch.stderr_path)?;

        let child = Command::new(program)
            .args(rest)
            .env(WORKER_SPEC_ENV, &launch.spec_path)
            .env_remove(SPAWN_QUEUE_ENV)
            .envs(&launch.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| {
                PipelineError::provider(format!("failed to launch worker {program:?}: {e}"))
            })?;

        let pid = child.id().unwrap_or(0);
        debug!(task_id = launch.task_id, pid, "local worker spawned");
        Ok(WorkerHandle::Local { child, pid })
    }
}

impl BatchProvider {
    async fn spawn(&self, launch: &WorkerLaunch) -> PipelineResult<WorkerHandle> {
        let script_path = launch.spec_path.with_extension("sbatch");
        std::fs::write(&script_path, self.render_script(launch))?;

        let output = Command::new(&self.settings.submit_command)
            .arg("--parsable")
            .arg(&script_path)
            .output()
            .await
            .map_err(|e| {
                PipelineError::provider(format!(
                    "failed to run {:?}: {e}",
                    self.settings.submit_command
                ))
            })?;
        if !output.status.success() {
            return Err(PipelineError::provider(format!(
                "batch submission failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // `--parsable` prints `jobid[;cluster]`
        let stdout = String::from_utf8_lossy(&output.stdout);
        let jobid = stdout
            .trim()
            .split(';')
            .next()
            .unwrap_or("")
            .to_string();
        if jobid.is_empty() {
            return Err(PipelineError::provider("batch submission returned no job id"));
        }
        debug!(task_id = launch.task_id, jobid = %jobid, "batch job submitted");
        Ok(WorkerHandle::Batch { jobid })
    }

    /// Render the job script for one task
    fn render_script(&self, launch: &WorkerLaunch) -> String {
        let s = &self.settings;
        let mut script = String::new();
        script.push_str("#!/bin/bash\n");
        script.push_str(&format!("#SBATCH --job-name=skypipe-{}\n", launch.task_id));
        script.push_str(&format!("#SBATCH --nodes={}\n", s.nodes));
        script.push_str(&format!(
            "#SBATCH --ntasks-per-node={}\n",
            s.mpiprocs_per_worker
        ));
        script.push_str(&format!(
            "#SBATCH --cpus-per-task={}\n",
            s.mpithreads_per_worker
        ));
        script.push_str(&format!("#SBATCH --time={}\n", s.walltime));
        script.push_str(&format!(
            "#SBATCH --output={}\n",
            launch.stdout_path.display()
        ));
        script.push_str(&format!(
            "#SBATCH --error={}\n",
            launch.stderr_path.display()
        ));
        script.push_str(&format!(
            "export {WORKER_SPEC_ENV}={}\n",
            shell_quote(&launch.spec_path.display().to_string())
        ));
        for (key, value) in &launch.env {
            script.push_str(&format!("export {key}={}\n", shell_quote(value)));
        }
        let command = self
            .worker_command
            .iter()
            .map(|piece| shell_quote(piece))
            .collect::<Vec<_>>()
            .join(" ");
        script.push_str(&format!("exec {command}\n"));
        script
    }

    async fn poll(&self, jobid: &str) -> PipelineResult<WorkerPoll> {
        let output = Command::new(&self.settings.poll_command)
            .args(["-h", "-j", jobid, "-o", "%T"])
            .output()
            .await
            .map_err(|e| {
                PipelineError::provider(format!(
                    "failed to run {:?}: {e}",
                    self.settings.poll_command
                ))
            })?;
        let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(match state.as_str() {
            // Job has left the queue: let the report file decide the outcome
            "" | "COMPLETED" => WorkerPoll::Exited { code: 0 },
            "PENDING" | "RUNNING" | "CONFIGURING" | "COMPLETING" | "SUSPENDED" => {
                WorkerPoll::Running
            }
            "TIMEOUT" => WorkerPoll::Exited {
                code: ERRNO_TIMEOUT,
            },
            other => {
                warn!(jobid = %jobid, state = %other, "batch job ended abnormally");
                WorkerPoll::Exited { code: 1 }
            }
        })
    }

    async fn cancel(&self, jobid: &str) -> PipelineResult<()> {
        let status = Command::new(&self.settings.cancel_command)
            .arg(jobid)
            .status()
            .await
            .map_err(|e| {
                PipelineError::provider(format!(
                    "failed to run {:?}: {e}",
                    self.settings.cancel_command
                ))
            })?;
        if !status.success() {
            return Err(PipelineError::provider(format!(
                "cancel of batch job {jobid} exited {status}"
            )));
        }
        Ok(())
    }
}

fn shell_quote(text: &str) -> String {
    if text
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c))
    {
        text.to_string()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_passthrough() {
        assert_eq!(shell_quote("plain-value_1.0"), "plain-value_1.0");
    }

    #[test]
    fn test_shell_quote_spaces_and_quotes() {
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_render_script_carries_knobs() {
        let provider = BatchProvider {
            worker_command: vec!["skypipe-worker".to_string()],
            settings: BatchSettings {
                nodes: 2,
                mpiprocs_per_worker: 8,
                walltime: "02:30:00".to_string(),
                ..BatchSettings::default()
            },
        };
        let launch = WorkerLaunch {
            task_id: 7,
            spec_path: PathBuf::from("/tmp/task-7.json"),
            stdout_path: PathBuf::from("/tmp/task-7.out"),
            stderr_path: PathBuf::from("/tmp/task-7.err"),
            env: [("SURVEY_ROOT".to_string(), "/data".to_string())]
                .into_iter()
                .collect(),
        };
        let script = provider.render_script(&launch);
        assert!(script.contains("--nodes=2"));
        assert!(script.contains("--ntasks-per-node=8"));
        assert!(script.contains("--time=02:30:00"));
        assert!(script.contains("export SKYPIPE_WORKER_SPEC=/tmp/task-7.json"));
        assert!(script.contains("export SURVEY_ROOT=/data"));
        assert!(script.contains("exec skypipe-worker"));
    }
}
