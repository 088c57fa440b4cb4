//! `tasks` — list task records in a queue

use std::path::Path;

use skypipe_core::store::TaskFilter;
use skypipe_core::{PipelineError, PipelineResult, QueueStore, TaskState};

use crate::output;

pub(crate) async fn handle(
    queue: &Path,
    state: Option<&str>,
    app: Option<String>,
) -> PipelineResult<()> {
    let state = state
        .map(|s| {
            s.parse::<TaskState>()
                .map_err(|_| PipelineError::config(format!("invalid state filter {s:?}")))
        })
        .transpose()?;

    let store = QueueStore::attach(queue).await?;
    let records = store.list(&TaskFilter { state, app }).await?;
    if records.is_empty() {
        output::note("no matching tasks");
        return Ok(());
    }

    output::section(format!("{} tasks in {}", records.len(), store.name()));
    for record in records {
        // Keep the state column aligned despite its color escapes
        let pad = " ".repeat(10usize.saturating_sub(record.state.as_str().len()));
        let mut line = format!(
            "#{:<5} {:<24} {}{pad}{}",
            record.id,
            record.app_name,
            output::task_state(record.state),
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
        if record.errno != 0 {
            line.push_str(&format!("  errno={}", record.errno));
        }
        if let Some(jobid) = &record.jobid {
            line.push_str(&format!("  job={jobid}"));
        }
        output::row(line);
        if record.state == TaskState::Failed && !record.err.is_empty() {
            let first_line = record.err.lines().next().unwrap_or("");
            output::note(format!("      {first_line}"));
        }
    }
    Ok(())
}
