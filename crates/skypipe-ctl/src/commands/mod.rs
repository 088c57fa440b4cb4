//! Command handlers for the skypipe CLI

pub(crate) mod control;
pub(crate) mod delete;
pub(crate) mod queues;
pub(crate) mod spawn;
pub(crate) mod tasks;

use std::path::{Path, PathBuf};

use skypipe_core::{PipelineConfig, PipelineError, PipelineResult};

/// Resolve a queue glob against literal paths and the configured base dir
///
/// `survey*` matches `${base_dir}/survey*.sqlite`; anything containing a
/// path separator or the `.sqlite` suffix is globbed as-is.
pub(crate) fn resolve_queues(
    pattern: &str,
    config: &PipelineConfig,
) -> PipelineResult<Vec<PathBuf>> {
    let mut globs = Vec::new();
    if pattern.ends_with(".sqlite") {
        globs.push(pattern.to_string());
    } else {
        globs.push(format!("{pattern}.sqlite"));
        if !pattern.contains(std::path::MAIN_SEPARATOR) {
            globs.push(
                config
                    .base_dir
                    .join(format!("{pattern}.sqlite"))
                    .display()
                    .to_string(),
            );
        }
    }

    let mut paths = Vec::new();
    for glob_pattern in globs {
        let matches = glob::glob(&glob_pattern)
            .map_err(|e| PipelineError::config(format!("bad queue pattern {pattern:?}: {e}")))?;
        for entry in matches.flatten() {
            if entry.is_file() && !paths.contains(&entry) {
                paths.push(entry);
            }
        }
    }
    paths.sort();
    Ok(paths)
}

pub(crate) fn queue_display_name(path: &Path) -> &str {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("?")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_queues_by_name_and_glob() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["alpha.sqlite", "beta.sqlite", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let config = PipelineConfig {
            base_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };

        let all = resolve_queues("*", &config).unwrap();
        assert_eq!(all.len(), 2);

        let alpha = resolve_queues("alpha", &config).unwrap();
        assert_eq!(alpha.len(), 1);
        assert_eq!(queue_display_name(&alpha[0]), "alpha");

        let by_path = resolve_queues(
            &dir.path().join("beta.sqlite").display().to_string(),
            &config,
        )
        .unwrap();
        assert_eq!(by_path.len(), 1);
    }
}
