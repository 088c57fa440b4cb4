//! Standalone worker binary
//!
//! Executes exactly one task spec and exits. Shell tasks carry their whole
//! argv in the spec; native tasks require the user's own binary (with its
//! app registry) as the worker command and fail here with a clear report.
//!
//! The spec path arrives in `SKYPIPE_WORKER_SPEC` (set by the provider) or
//! as the first positional argument.

use std::path::PathBuf;

use skypipe_core::worker::{run_spec_file, WORKER_SPEC_ENV};
use skypipe_core::AppRegistry;
use tracing_subscriber::EnvFilter;

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let spec_path = std::env::var(WORKER_SPEC_ENV)
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::args().nth(1).map(PathBuf::from));

    let Some(spec_path) = spec_path else {
        eprintln!("usage: skypipe-worker <task-spec.json> (or set {WORKER_SPEC_ENV})");
        return std::process::ExitCode::from(2);
    };

    match run_spec_file(&spec_path, &AppRegistry::new()) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("skypipe-worker: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}
