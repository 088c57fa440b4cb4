//! # Future Handles
//!
//! A client-side reference to a queued task: queue + id + the fingerprint it
//! was enqueued under. Futures never mutate records; they poll the backing
//! record with bounded backoff until it reaches a terminal state. Passing a
//! future as an argument to another task registers a dependency edge.

use std::time::Duration;

use serde_json::Value;
use tracing::trace;

use crate::args::{ArgNode, FutureRef};
use crate::cache::ResultCache;
use crate::error::{PipelineError, PipelineResult};
use crate::fingerprint::Fingerprint;
use crate::record::{TaskRecord, TaskState};
use crate::store::QueueStore;

/// Poll backoff bounds for `result()`/`out()`
const POLL_INITIAL: Duration = Duration::from_millis(50);
const POLL_CAP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct FutureInner {
    store: QueueStore,
    cache: ResultCache,
    task_id: i64,
    fingerprint: Fingerprint,
}

/// Handle on a queued task's eventual outcome
///
/// The null future (from a `skip`ped declaration) backs no record,
/// participates in no dependency graph, and resolves immediately to JSON
/// null.
#[derive(Debug, Clone)]
pub struct TaskFuture {
    inner: Option<FutureInner>,
}

impl TaskFuture {
    pub(crate) fn new(
        store: QueueStore,
        cache: ResultCache,
        task_id: i64,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            inner: Some(FutureInner {
                store,
                cache,
                task_id,
                fingerprint,
            }),
        }
    }

    /// The null future returned by `skip`ped declarations
    pub fn null() -> Self {
        Self { inner: None }
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    pub fn task_id(&self) -> Option<i64> {
        self.inner.as_ref().map(|i| i.task_id)
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.inner.as_ref().map(|i| &i.fingerprint)
    }

    /// Argument-tree node referencing this future (dependency placeholder)
    pub fn as_arg(&self) -> ArgNode {
        match &self.inner {
            Some(inner) => ArgNode::Future(FutureRef {
                task_id: inner.task_id,
                fingerprint: inner.fingerprint.clone(),
            }),
            None => ArgNode::Null,
        }
    }

    /// Block until terminal, then return the deserialized payload
    ///
    /// `failed`/`killed` records surface as [`PipelineError::TaskFailed`]
    /// carrying the captured stderr.
    pub async fn result(&self) -> PipelineResult<Value> {
        let Some(inner) = &self.inner else {
            return Ok(Value::Null);
        };
        let record = self.wait_terminal().await?;
        match record.state {
            TaskState::Succeeded => {
                let rref = record.result_ref.ok_or_else(|| {
                    PipelineError::store_unavailable(format!(
                        "succeeded task {} has no result_ref",
                        record.id
                    ))
                })?;
                inner.cache.get(&rref.fingerprint)
            }
            _ => Err(PipelineError::TaskFailed {
                task_id: record.id,
                err: if record.err.is_empty() {
                    format!("task ended {}", record.state)
                } else {
                    record.err
                },
            }),
        }
    }

    /// Block until terminal, then return captured stdout
    pub async fn out(&self) -> PipelineResult<String> {
        if self.inner.is_none() {
            return Ok(String::new());
        }
        let record = self.wait_terminal().await?;
        match record.state {
            TaskState::Succeeded => Ok(record.out),
            _ => Err(PipelineError::TaskFailed {
                task_id: record.id,
                err: record.err,
            }),
        }
    }

    async fn wait_terminal(&self) -> PipelineResult<TaskRecord> {
        let inner = self
            .inner
            .as_ref()
            .expect("wait_terminal called on null future");
        let mut delay = POLL_INITIAL;
        loop {
            let record = inner.store.get(inner.task_id).await?;
            if record.state.is_terminal() {
                return Ok(record);
            }
            trace!(
                task_id = inner.task_id,
                state = %record.state,
                delay_ms = delay.as_millis() as u64,
                "future polling"
            );
            // Exponential backoff with jitter, bounded at ~1 s
            tokio::time::sleep(delay.mul_f64(0.8 + 0.4 * fastrand::f64())).await;
            delay = (delay * 2).min(POLL_CAP);
        }
    }
}
