//! `delete` — preview or delete queues
//!
//! Without `--force` this only previews what would be removed. The result
//! cache is shared per base dir and survives queue deletion unless
//! `--cache` is passed.

use std::path::PathBuf;

use skypipe_core::store::delete_queue;
use skypipe_core::{PipelineConfig, PipelineResult, QueueStore};

use crate::output;

pub(crate) async fn handle(
    pattern: &str,
    force: bool,
    clear_cache: bool,
    config: &PipelineConfig,
) -> PipelineResult<()> {
    let paths = super::resolve_queues(pattern, config)?;
    if paths.is_empty() {
        output::warn(format!("no queues match {pattern:?}"));
        return Ok(());
    }

    if !force {
        output::section(format!("would delete {} queue(s):", paths.len()));
        for path in &paths {
            let counts = match QueueStore::attach(path).await {
                Ok(store) => {
                    let counts = store.counts_by_state().await?;
                    let total: i64 = counts.values().sum();
                    format!("{total} task(s)")
                }
                Err(_) => "unreadable".to_string(),
            };
            output::row(format!("{} ({counts})", path.display()));
        }
        output::note("pass --force to delete");
        return Ok(());
    }

    let mut cache_dirs: Vec<PathBuf> = Vec::new();
    for path in &paths {
        delete_queue(path)?;
        output::ok(format!("deleted {}", path.display()));

        if clear_cache {
            let base = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let cache_dir = base.join(".skypipe").join("cache");
            if cache_dir.is_dir() && !cache_dirs.contains(&cache_dir) {
                cache_dirs.push(cache_dir);
            }
        }
    }

    for cache_dir in cache_dirs {
        std::fs::remove_dir_all(&cache_dir)?;
        output::ok(format!("cleared result cache {}", cache_dir.display()));
    }
    Ok(())
}
