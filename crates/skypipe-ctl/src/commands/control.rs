//! `pause`, `resume`, `retry` — queue-level control

use std::path::Path;

use skypipe_core::store::RetryMode;
use skypipe_core::{PipelineError, PipelineResult, QueueState, QueueStore, TaskState};

use crate::output;

pub(crate) async fn pause(queue: &Path) -> PipelineResult<()> {
    let store = QueueStore::attach(queue).await?;
    store.set_queue_state(QueueState::Paused).await?;
    output::ok(format!(
        "queue {} paused; running workers will finish",
        store.name()
    ));
    Ok(())
}

pub(crate) async fn resume(
    queue: &Path,
    spawn: bool,
    config_path: Option<&Path>,
) -> PipelineResult<()> {
    let store = QueueStore::attach(queue).await?;
    store.set_queue_state(QueueState::Active).await?;
    output::ok(format!("queue {} active", store.name()));

    if spawn {
        if store.manager_lock_holder().await?.is_some() {
            output::note("a manager is already running for this queue");
            return Ok(());
        }
        let pid = super::spawn::spawn_detached(queue, config_path)?;
        output::ok(format!("detached manager started (pid {pid})"));
    }
    Ok(())
}

pub(crate) async fn retry(queue: &Path, state: &str, force: bool) -> PipelineResult<()> {
    let state: TaskState = state
        .parse()
        .map_err(|_| PipelineError::config(format!("invalid state {state:?}")))?;
    if matches!(state, TaskState::Waiting | TaskState::Pending) {
        output::warn(format!("records in {state} are already queued; nothing to do"));
        return Ok(());
    }

    let store = QueueStore::attach(queue).await?;
    let mode = if force {
        RetryMode::Force
    } else {
        RetryMode::Orphaned
    };
    if state == TaskState::Running && !force {
        output::note("without --force, retry of running records touches only orphaned (unknown) ones");
    }
    let count = store.retry(state, mode).await?;
    output::ok(format!("{count} task(s) moved back to pending"));
    Ok(())
}
