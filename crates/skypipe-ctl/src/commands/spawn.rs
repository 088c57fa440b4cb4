//! `spawn` — run a manager loop for a queue, foreground or detached

use std::path::Path;

use skypipe_core::{Manager, PipelineConfig, PipelineResult, QueueStore};

use crate::output;

pub(crate) async fn handle(
    queue: &Path,
    detached: bool,
    config_path: Option<&Path>,
    config: &PipelineConfig,
) -> PipelineResult<()> {
    if detached {
        let pid = spawn_detached(queue, config_path)?;
        output::ok(format!("detached manager started (pid {pid})"));
        return Ok(());
    }

    let store = QueueStore::attach(queue).await?;
    output::line(format!(
        "managing queue {} ({} worker slot(s), {:?} provider)",
        store.name(),
        config.max_workers,
        config.provider.kind
    ));
    let manager = Manager::from_config(store, config).await?;
    manager.run().await
}

/// Re-exec this binary as `spawn -q <queue>` with stdio detached
pub(crate) fn spawn_detached(queue: &Path, config_path: Option<&Path>) -> PipelineResult<u32> {
    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command.arg("spawn").arg("-q").arg(queue);
    if let Some(config_path) = config_path {
        command.arg("--config").arg(config_path);
    }
    let child = command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;
    Ok(child.id())
}
