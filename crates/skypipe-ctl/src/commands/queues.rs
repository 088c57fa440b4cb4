//! `queues` — list matching queues with counts by state

use skypipe_core::{PipelineConfig, PipelineResult, QueueStore, TaskState};

use crate::output;

pub(crate) async fn handle(pattern: &str, config: &PipelineConfig) -> PipelineResult<()> {
    let paths = super::resolve_queues(pattern, config)?;
    if paths.is_empty() {
        output::warn(format!("no queues match {pattern:?}"));
        return Ok(());
    }

    for path in paths {
        let store = QueueStore::attach(&path).await?;
        let state = store.queue_state().await?;
        let counts = store.counts_by_state().await?;

        output::section(format!(
            "{} [{}]",
            store.name(),
            output::queue_state(state)
        ));
        output::note(format!("  {}", path.display()));
        let summary = TaskState::ALL
            .iter()
            .filter_map(|s| {
                let n = counts.get(s).copied().unwrap_or(0);
                (n > 0).then(|| format!("{} {n}", output::task_state(*s)))
            })
            .collect::<Vec<_>>()
            .join("  ");
        if summary.is_empty() {
            output::note("  (empty)");
        } else {
            output::line(format!("  {summary}"));
        }
    }
    Ok(())
}
