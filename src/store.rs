//! # Persistent Queue Store
//!
//! Durable storage of task records with concurrent multi-process access.
//! One SQLite file per logical queue at `${base_dir}/${name}.sqlite`, opened
//! in WAL mode with a busy timeout; writes are serialized by the database
//! and every state transition is a compare-and-swap, so multiple manager
//! loops and inspection CLIs can attach without coordinating further.
//!
//! A record in `running` whose worker dies without finalizing is recovered
//! by the orphan sweep (demotes to `unknown`) followed by an explicit retry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::environment::Environment;
use crate::error::{PipelineError, PipelineResult};
use crate::record::{
    NewTask, QueueState, ResultRef, TaskRecord, TaskRow, TaskState,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    app_name    TEXT NOT NULL,
    kind        TEXT NOT NULL,
    code_blob   TEXT NOT NULL,
    args_blob   TEXT NOT NULL,
    kwargs_blob TEXT NOT NULL,
    dep_ids     TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    state       TEXT NOT NULL,
    errno       INTEGER NOT NULL DEFAULT 0,
    out         TEXT NOT NULL DEFAULT '',
    err         TEXT NOT NULL DEFAULT '',
    result_ref  TEXT,
    jobid       TEXT,
    created_at  TEXT NOT NULL,
    started_at  TEXT,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
CREATE INDEX IF NOT EXISTS idx_tasks_fingerprint ON tasks(fingerprint);
CREATE TABLE IF NOT EXISTS queue_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
INSERT INTO queue_meta(key, value) VALUES ('state', 'active')
    ON CONFLICT(key) DO NOTHING;
CREATE TABLE IF NOT EXISTS manager_lock (
    id          INTEGER PRIMARY KEY CHECK (id = 0),
    token       TEXT NOT NULL,
    pid         INTEGER NOT NULL,
    hostname    TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);
"#;

/// A dependency is satisfied only by a succeeded record; this clause guards
/// both waiting→pending promotion and the pending→running claim.
const DEPS_SATISFIED: &str = "NOT EXISTS ( \
     SELECT 1 FROM json_each(tasks.dep_ids) AS je \
     JOIN tasks AS dep ON dep.id = je.value \
     WHERE dep.state != 'succeeded')";

/// Optional field updates applied together with a CAS state transition
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub errno: Option<i32>,
    pub out: Option<String>,
    pub err: Option<String>,
    pub result_ref: Option<ResultRef>,
    pub jobid: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Filter for `QueueStore::list`
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub app: Option<String>,
}

/// How `retry` treats records claimed by a possibly-live worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Requeue only records the liveness sweep demoted to `unknown`
    Orphaned,
    /// Requeue `running` records as well; never kills the worker
    Force,
}

/// Token proving ownership of a queue's singleton manager slot
#[derive(Debug, Clone)]
pub struct ManagerLock {
    pub token: Uuid,
    pub pid: u32,
    pub hostname: String,
}

/// Handle on one durable queue
#[derive(Debug, Clone)]
pub struct QueueStore {
    pool: SqlitePool,
    name: String,
    base_dir: PathBuf,
    path: PathBuf,
}

impl QueueStore {
    /// Create or attach the queue `name` under `base_dir`
    pub async fn open(name: &str, base_dir: &Path) -> PipelineResult<Self> {
        std::fs::create_dir_all(base_dir)?;
        let path = base_dir.join(format!("{name}.sqlite"));
        Self::connect(name, base_dir, &path, true).await
    }

    /// Attach an existing queue by store file path (the ctl entry point)
    pub async fn attach(path: &Path) -> PipelineResult<Self> {
        if !path.is_file() {
            return Err(PipelineError::store_unavailable(format!(
                "no queue store at {}",
                path.display()
            )));
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                PipelineError::store_unavailable(format!("bad queue path {}", path.display()))
            })?
            .to_string();
        let base_dir = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        Self::connect(&name, &base_dir, path, false).await
    }

    async fn connect(
        name: &str,
        base_dir: &Path,
        path: &Path,
        create: bool,
    ) -> PipelineResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        debug!(queue = name, path = %path.display(), "queue store attached");
        Ok(Self {
            pool,
            name: name.to_string(),
            base_dir: base_dir.to_path_buf(),
            path: path.to_path_buf(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Per-queue scratch namespace (`${base_dir}/.skypipe/${name}/`)
    pub fn namespace_dir(&self) -> PathBuf {
        self.base_dir.join(".skypipe").join(&self.name)
    }

    // =========================================================================
    // Record operations
    // =========================================================================

    /// Append a new record, assigning its id and initial state
    ///
    /// Initial state is `waiting` if any dependency is not yet succeeded,
    /// else `pending`. When `cached` is given (enqueue-time cache hit) the
    /// record is inserted already `succeeded`, pointing at the cached
    /// payload, and no worker will ever run it.
    pub async fn append(&self, task: &NewTask, cached: Option<ResultRef>) -> PipelineResult<i64> {
        let mut tx = self.pool.begin().await?;

        let mut state = TaskState::Pending;
        if !task.dep_ids.is_empty() {
            let id_list = task
                .dep_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let rows: Vec<(i64, String)> = sqlx::query_as(&format!(
                "SELECT id, state FROM tasks WHERE id IN ({id_list})"
            ))
            .fetch_all(&mut *tx)
            .await?;
            if rows.len() != task.dep_ids.len() {
                let found: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
                let missing: Vec<i64> = task
                    .dep_ids
                    .iter()
                    .copied()
                    .filter(|id| !found.contains(id))
                    .collect();
                return Err(PipelineError::enqueue(format!(
                    "unknown dependency ids {missing:?} in queue {}",
                    self.name
                )));
            }
            if rows
                .iter()
                .any(|(_, state)| state != TaskState::Succeeded.as_str())
            {
                state = TaskState::Waiting;
            }
        }

        let now = Utc::now();
        let (state, result_ref, finished_at) = match cached {
            Some(rref) => (
                TaskState::Succeeded,
                Some(serde_json::to_string(&rref)?),
                Some(now.to_rfc3339()),
            ),
            None => (state, None, None),
        };

        let res = sqlx::query(
            "INSERT INTO tasks \
             (app_name, kind, code_blob, args_blob, kwargs_blob, dep_ids, \
              fingerprint, state, result_ref, created_at, finished_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.app_name)
        .bind(task.kind.as_str())
        .bind(&task.code_blob)
        .bind(serde_json::to_string(&task.args)?)
        .bind(serde_json::to_string(&task.kwargs)?)
        .bind(serde_json::to_string(&task.dep_ids)?)
        .bind(task.fingerprint.as_str())
        .bind(state.as_str())
        .bind(result_ref)
        .bind(now.to_rfc3339())
        .bind(finished_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        let id = res.last_insert_rowid();
        debug!(
            queue = %self.name,
            task_id = id,
            app = %task.app_name,
            state = %state,
            "appended task record"
        );
        Ok(id)
    }

    /// Snapshot read of one record
    pub async fn get(&self, id: i64) -> PipelineResult<TaskRecord> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| {
            PipelineError::store_unavailable(format!("no task {id} in queue {}", self.name))
        })?
        .try_into()
    }

    /// Compare-and-swap state transition with optional field updates
    ///
    /// Returns `false` if `expected` no longer matched (another writer won).
    pub async fn update(
        &self,
        id: i64,
        expected: TaskState,
        new: TaskState,
        fields: StateUpdate,
    ) -> PipelineResult<bool> {
        let result_ref = fields
            .result_ref
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let res = sqlx::query(
            "UPDATE tasks SET state = ?, \
             errno = COALESCE(?, errno), \
             out = COALESCE(?, out), \
             err = COALESCE(?, err), \
             result_ref = COALESCE(?, result_ref), \
             jobid = COALESCE(?, jobid), \
             started_at = COALESCE(?, started_at), \
             finished_at = COALESCE(?, finished_at) \
             WHERE id = ? AND state = ?",
        )
        .bind(new.as_str())
        .bind(fields.errno)
        .bind(fields.out)
        .bind(fields.err)
        .bind(result_ref)
        .bind(fields.jobid)
        .bind(fields.started_at.map(|t| t.to_rfc3339()))
        .bind(fields.finished_at.map(|t| t.to_rfc3339()))
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// List records matching the filter, in id order
    pub async fn list(&self, filter: &TaskFilter) -> PipelineResult<Vec<TaskRecord>> {
        let mut sql = String::from("SELECT * FROM tasks WHERE 1 = 1");
        if filter.state.is_some() {
            sql.push_str(" AND state = ?");
        }
        if filter.app.is_some() {
            sql.push_str(" AND app_name = ?");
        }
        sql.push_str(" ORDER BY id");

        let mut query = sqlx::query_as::<_, TaskRow>(&sql);
        if let Some(state) = filter.state {
            query = query.bind(state.as_str());
        }
        if let Some(app) = &filter.app {
            query = query.bind(app.clone());
        }
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }

    /// Atomically claim one ready record, moving it `pending → running`
    ///
    /// Ready means every dependency is `succeeded`. Ties break by ascending
    /// id (FIFO). Returns `None` when nothing is claimable. The select and
    /// the CAS run in one transaction; a lost race retries internally.
    pub async fn next_pending(&self) -> PipelineResult<Option<TaskRecord>> {
        loop {
            let mut tx = self.pool.begin().await?;
            let candidate: Option<TaskRow> = sqlx::query_as(&format!(
                "SELECT * FROM tasks WHERE state = 'pending' AND {DEPS_SATISFIED} \
                 ORDER BY id LIMIT 1"
            ))
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = candidate else {
                return Ok(None);
            };
            let id = row.id;
            let started = Utc::now();
            let claimed = sqlx::query(
                "UPDATE tasks SET state = 'running', started_at = ? \
                 WHERE id = ? AND state = 'pending'",
            )
            .bind(started.to_rfc3339())
            .bind(id)
            .execute(&mut *tx)
            .await?;

            if claimed.rows_affected() == 1 {
                tx.commit().await?;
                let mut record: TaskRecord = row.try_into()?;
                record.state = TaskState::Running;
                record.started_at = Some(started);
                return Ok(Some(record));
            }
            // Another claimer won this id; look again
            drop(tx);
        }
    }

    /// Promote `waiting` records whose dependencies are all succeeded
    pub async fn promote_waiting(&self) -> PipelineResult<u64> {
        let res = sqlx::query(&format!(
            "UPDATE tasks SET state = 'pending' WHERE state = 'waiting' AND {DEPS_SATISFIED}"
        ))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// Cancel queued records that can never run because a dependency
    /// finished in `failed` or `killed`
    pub async fn cancel_dep_failed(&self) -> PipelineResult<u64> {
        let res = sqlx::query(
            "UPDATE tasks SET state = 'killed', err = 'dependency failed', finished_at = ? \
             WHERE state IN ('waiting', 'pending') AND EXISTS ( \
                 SELECT 1 FROM json_each(tasks.dep_ids) AS je \
                 JOIN tasks AS dep ON dep.id = je.value \
                 WHERE dep.state IN ('failed', 'killed'))",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        if res.rows_affected() > 0 {
            warn!(
                queue = %self.name,
                cancelled = res.rows_affected(),
                "cancelled waiting tasks with failed dependencies"
            );
        }
        Ok(res.rows_affected())
    }

    /// Promote records in `state` back to `pending`, clearing terminal
    /// fields and `result_ref`
    ///
    /// Retrying `running` records is gated by [`RetryMode`]: the default
    /// touches only records the orphan sweep demoted to `unknown`; `Force`
    /// requeues live `running` records too. Workers are never killed here.
    pub async fn retry(&self, state: TaskState, mode: RetryMode) -> PipelineResult<u64> {
        let target = match (state, mode) {
            (TaskState::Waiting | TaskState::Pending, _) => return Ok(0),
            (TaskState::Running, RetryMode::Orphaned) => TaskState::Unknown,
            (other, _) => other,
        };
        let res = sqlx::query(
            "UPDATE tasks SET state = 'pending', errno = 0, out = '', err = '', \
             result_ref = NULL, jobid = NULL, started_at = NULL, finished_at = NULL \
             WHERE state = ?",
        )
        .bind(target.as_str())
        .execute(&self.pool)
        .await?;
        info!(
            queue = %self.name,
            from_state = %target,
            retried = res.rows_affected(),
            "retried task records"
        );
        Ok(res.rows_affected())
    }

    /// Put a single record back in line, clearing terminal fields and
    /// `result_ref`
    ///
    /// CAS on `expected`; returns `false` when the record moved on. Used
    /// when a succeeded dependency's cache entry turns out corrupt (it must
    /// re-run) and to release the just-claimed dependent back to the queue.
    pub async fn requeue(&self, id: i64, expected: TaskState) -> PipelineResult<bool> {
        let res = sqlx::query(
            "UPDATE tasks SET state = 'pending', errno = 0, out = '', err = '', \
             result_ref = NULL, jobid = NULL, started_at = NULL, finished_at = NULL \
             WHERE id = ? AND state = ?",
        )
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Demote `running` records not tracked by the live manager to `unknown`
    ///
    /// With a singleton manager per queue, any running record outside its
    /// in-flight set belongs to a dead predecessor.
    pub async fn sweep_orphans(&self, tracked: &[i64]) -> PipelineResult<u64> {
        let sql = if tracked.is_empty() {
            "UPDATE tasks SET state = 'unknown' WHERE state = 'running'".to_string()
        } else {
            let id_list = tracked
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            format!(
                "UPDATE tasks SET state = 'unknown' \
                 WHERE state = 'running' AND id NOT IN ({id_list})"
            )
        };
        let res = sqlx::query(&sql).execute(&self.pool).await?;
        if res.rows_affected() > 0 {
            warn!(
                queue = %self.name,
                swept = res.rows_affected(),
                "demoted orphaned running tasks to unknown"
            );
        }
        Ok(res.rows_affected())
    }

    /// Count records grouped by state (all states present, zero-filled)
    pub async fn counts_by_state(&self) -> PipelineResult<BTreeMap<TaskState, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM tasks GROUP BY state")
                .fetch_all(&self.pool)
                .await?;
        let mut counts: BTreeMap<TaskState, i64> =
            TaskState::ALL.iter().map(|s| (*s, 0)).collect();
        for (state, n) in rows {
            counts.insert(state.parse()?, n);
        }
        Ok(counts)
    }

    // =========================================================================
    // Queue-level state
    // =========================================================================

    pub async fn set_queue_state(&self, state: QueueState) -> PipelineResult<()> {
        sqlx::query(
            "INSERT INTO queue_meta(key, value) VALUES ('state', ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;
        info!(queue = %self.name, state = %state, "queue state changed");
        Ok(())
    }

    pub async fn queue_state(&self) -> PipelineResult<QueueState> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM queue_meta WHERE key = 'state'")
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((value,)) => value.parse(),
            None => Ok(QueueState::Active),
        }
    }

    /// Record the environment exported into this queue's workers
    pub async fn set_environment(&self, environment: &Environment) -> PipelineResult<()> {
        sqlx::query(
            "INSERT INTO queue_meta(key, value) VALUES ('environment', ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(serde_json::to_string(environment)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn environment(&self) -> PipelineResult<Environment> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM queue_meta WHERE key = 'environment'")
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((value,)) => Ok(serde_json::from_str(&value)?),
            None => Ok(Environment::default()),
        }
    }

    /// Cooperative change notification: returns once the queue's observable
    /// state (queue state or per-state counts) differs from its state at
    /// call time. Polls at `interval`, floored at 500 ms; no spin.
    pub async fn watch(&self, interval: Duration) -> PipelineResult<()> {
        let interval = interval.max(Duration::from_millis(500));
        let baseline = self.change_token().await?;
        loop {
            tokio::time::sleep(interval).await;
            if self.change_token().await? != baseline {
                return Ok(());
            }
        }
    }

    async fn change_token(&self) -> PipelineResult<(QueueState, BTreeMap<TaskState, i64>)> {
        Ok((self.queue_state().await?, self.counts_by_state().await?))
    }

    // =========================================================================
    // Manager lock
    // =========================================================================

    /// Claim the queue's singleton manager slot
    ///
    /// Fails with `StoreUnavailable` when another live manager holds the
    /// lock; a stale holder (same host, dead pid) is replaced.
    pub async fn acquire_manager_lock(&self) -> PipelineResult<ManagerLock> {
        let lock = ManagerLock {
            token: Uuid::new_v4(),
            pid: std::process::id(),
            hostname: local_hostname(),
        };

        let mut tx = self.pool.begin().await?;
        let holder: Option<(String, i64, String, String)> = sqlx::query_as(
            "SELECT token, pid, hostname, acquired_at FROM manager_lock WHERE id = 0",
        )
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((_, held_pid, held_host, acquired_at)) = holder {
            if holder_alive(held_pid as u32, &held_host) {
                return Err(PipelineError::store_unavailable(format!(
                    "manager lock on queue {} held by pid {held_pid} on {held_host} since {acquired_at}",
                    self.name
                )));
            }
            warn!(
                queue = %self.name,
                stale_pid = held_pid,
                stale_host = %held_host,
                "replacing stale manager lock"
            );
            sqlx::query(
                "UPDATE manager_lock SET token = ?, pid = ?, hostname = ?, acquired_at = ? \
                 WHERE id = 0",
            )
            .bind(lock.token.to_string())
            .bind(lock.pid as i64)
            .bind(&lock.hostname)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "INSERT INTO manager_lock (id, token, pid, hostname, acquired_at) \
                 VALUES (0, ?, ?, ?, ?)",
            )
            .bind(lock.token.to_string())
            .bind(lock.pid as i64)
            .bind(&lock.hostname)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(queue = %self.name, pid = lock.pid, "manager lock acquired");
        Ok(lock)
    }

    /// Release the manager slot; a no-op if the token no longer matches
    pub async fn release_manager_lock(&self, lock: &ManagerLock) -> PipelineResult<()> {
        sqlx::query("DELETE FROM manager_lock WHERE id = 0 AND token = ?")
            .bind(lock.token.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The live manager holding this queue's lock, if any
    pub async fn manager_lock_holder(&self) -> PipelineResult<Option<(u32, String)>> {
        let holder: Option<(i64, String)> =
            sqlx::query_as("SELECT pid, hostname FROM manager_lock WHERE id = 0")
                .fetch_optional(&self.pool)
                .await?;
        Ok(holder
            .filter(|(pid, host)| holder_alive(*pid as u32, host))
            .map(|(pid, host)| (pid as u32, host)))
    }
}

/// Delete a queue's store file (with WAL sidecars) and its per-queue
/// namespace directory. The shared result cache is left intact.
pub fn delete_queue(path: &Path) -> PipelineResult<()> {
    if !path.is_file() {
        return Err(PipelineError::store_unavailable(format!(
            "no queue store at {}",
            path.display()
        )));
    }
    let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    std::fs::remove_file(path)?;
    for suffix in ["-wal", "-shm"] {
        let sidecar = PathBuf::from(format!("{}{suffix}", path.display()));
        if sidecar.is_file() {
            std::fs::remove_file(&sidecar)?;
        }
    }
    let namespace = base_dir.join(".skypipe").join(name);
    if namespace.is_dir() {
        std::fs::remove_dir_all(&namespace)?;
    }
    info!(queue = name, path = %path.display(), "queue deleted");
    Ok(())
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Best-effort liveness probe for a lock holder
///
/// A holder on another host cannot be probed and is assumed alive; on the
/// local host the pid is checked against /proc where available.
fn holder_alive(pid: u32, hostname: &str) -> bool {
    if hostname != local_hostname() {
        return true;
    }
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        true
    }
}
