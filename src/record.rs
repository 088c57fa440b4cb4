//! # Task Records
//!
//! The persistent representation of one unit of work, as stored in and read
//! back from the queue store. State names are lowercase on disk.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::args::ArgNode;
use crate::error::{PipelineError, PipelineResult};
use crate::fingerprint::Fingerprint;

/// Captured stdout/stderr are truncated at this many bytes when a record is
/// finalized.
pub const STREAM_CAP: usize = 64 * 1024;

/// errno recorded when the provider could not launch a worker.
pub const ERRNO_PROVIDER: i32 = 125;
/// errno recorded on a provider-reported walltime/timeout kill.
pub const ERRNO_TIMEOUT: i32 = 124;
/// errno recorded when a worker exited without writing its report file.
pub const ERRNO_NO_REPORT: i32 = 123;

/// Lifecycle state of a task record
///
/// Transitions form a DAG: `waiting → pending → running → {succeeded,
/// failed, killed}`, with `unknown` reachable from `running` only when a
/// worker's liveness is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
    Unknown,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Killed => "killed",
            TaskState::Unknown => "unknown",
        }
    }

    /// Terminal states never transition again except through explicit retry
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Killed
        )
    }

    /// States that keep a manager alive: work still to claim or in flight
    pub fn is_outstanding(self) -> bool {
        matches!(
            self,
            TaskState::Waiting | TaskState::Pending | TaskState::Running
        )
    }

    pub const ALL: [TaskState; 7] = [
        TaskState::Waiting,
        TaskState::Pending,
        TaskState::Running,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Killed,
        TaskState::Unknown,
    ];
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Ok(TaskState::Waiting),
            "pending" => Ok(TaskState::Pending),
            "running" => Ok(TaskState::Running),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed" => Ok(TaskState::Failed),
            "killed" => Ok(TaskState::Killed),
            "unknown" => Ok(TaskState::Unknown),
            other => Err(PipelineError::enqueue(format!(
                "invalid task state: {other}"
            ))),
        }
    }
}

/// What kind of callable the record runs
///
/// `Native` apps are registered Rust callables returning a JSON payload;
/// `Shell` apps execute an argv and capture stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Native,
    Shell,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Native => "native",
            TaskKind::Shell => "shell",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(TaskKind::Native),
            "shell" => Ok(TaskKind::Shell),
            other => Err(PipelineError::enqueue(format!("invalid task kind: {other}"))),
        }
    }
}

/// Queue-level scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Active,
    Paused,
}

impl QueueState {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueState::Active => "active",
            QueueState::Paused => "paused",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(QueueState::Active),
            "paused" => Ok(QueueState::Paused),
            other => Err(PipelineError::enqueue(format!(
                "invalid queue state: {other}"
            ))),
        }
    }
}

/// Pointer into the result cache, set if and only if the record succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRef {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
}

/// One persisted unit of work
#[derive(Debug, Clone)]
pub struct TaskRecord {
    /// Queue-unique, monotonic id
    pub id: i64,
    /// Logical name of the callable (user-overridable for cache aliasing)
    pub app_name: String,
    pub kind: TaskKind,
    /// Verbatim source of the callable plus captured environment versions
    pub code_blob: String,
    /// Positional arguments with future placeholders
    pub args: Vec<ArgNode>,
    /// Named arguments with future placeholders
    pub kwargs: BTreeMap<String, ArgNode>,
    /// Ordered ids of records this one awaits
    pub dep_ids: Vec<i64>,
    pub fingerprint: Fingerprint,
    pub state: TaskState,
    /// Zero on success; distinguished values for provider/timeout failures
    pub errno: i32,
    pub out: String,
    pub err: String,
    pub result_ref: Option<ResultRef>,
    /// Provider-issued worker identifier (PID or batch job id)
    pub jobid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Insert shape handed to `QueueStore::append`
#[derive(Debug, Clone)]
pub struct NewTask {
    pub app_name: String,
    pub kind: TaskKind,
    pub code_blob: String,
    pub args: Vec<ArgNode>,
    pub kwargs: BTreeMap<String, ArgNode>,
    pub dep_ids: Vec<i64>,
    pub fingerprint: Fingerprint,
}

/// Raw row shape as fetched from SQLite; JSON columns decoded by
/// `TryFrom<TaskRow> for TaskRecord`
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskRow {
    pub id: i64,
    pub app_name: String,
    pub kind: String,
    pub code_blob: String,
    pub args_blob: String,
    pub kwargs_blob: String,
    pub dep_ids: String,
    pub fingerprint: String,
    pub state: String,
    pub errno: i64,
    pub out: String,
    pub err: String,
    pub result_ref: Option<String>,
    pub jobid: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

fn parse_timestamp(text: &str) -> PipelineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::store_unavailable(format!("bad timestamp {text:?}: {e}")))
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = PipelineError;

    fn try_from(row: TaskRow) -> PipelineResult<Self> {
        Ok(TaskRecord {
            id: row.id,
            app_name: row.app_name,
            kind: row.kind.parse()?,
            code_blob: row.code_blob,
            args: serde_json::from_str(&row.args_blob)?,
            kwargs: serde_json::from_str(&row.kwargs_blob)?,
            dep_ids: serde_json::from_str(&row.dep_ids)?,
            fingerprint: Fingerprint::from_hex(row.fingerprint),
            state: row.state.parse()?,
            errno: row.errno as i32,
            out: row.out,
            err: row.err,
            result_ref: row
                .result_ref
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            jobid: row.jobid,
            created_at: parse_timestamp(&row.created_at)?,
            started_at: row.started_at.as_deref().map(parse_timestamp).transpose()?,
            finished_at: row
                .finished_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in TaskState::ALL {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
    }

    #[test]
    fn test_state_parse_rejects_garbage() {
        assert!("finished".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Killed.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Unknown.is_terminal());
    }

    #[test]
    fn test_outstanding_states() {
        assert!(TaskState::Waiting.is_outstanding());
        assert!(TaskState::Pending.is_outstanding());
        assert!(TaskState::Running.is_outstanding());
        assert!(!TaskState::Unknown.is_outstanding());
        assert!(!TaskState::Succeeded.is_outstanding());
    }

    #[test]
    fn test_kind_round_trip() {
        assert_eq!("native".parse::<TaskKind>().unwrap(), TaskKind::Native);
        assert_eq!("shell".parse::<TaskKind>().unwrap(), TaskKind::Shell);
        assert!("python".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_queue_state_round_trip() {
        assert_eq!("active".parse::<QueueState>().unwrap(), QueueState::Active);
        assert_eq!("paused".parse::<QueueState>().unwrap(), QueueState::Paused);
    }
}
