//! # skypipe-ctl
//!
//! Management surface for skypipe task queues: inspect, pause, resume,
//! retry, spawn managers, delete. Exit code 0 on success, non-zero on
//! operational errors.

mod commands;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use skypipe_core::{PipelineConfig, PipelineResult};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "skypipe-ctl",
    version,
    about = "Manage skypipe task queues",
    styles = output::clap_styles()
)]
struct Cli {
    /// Pipeline config file (default: skypipe.toml + SKYPIPE_* env)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List matching queues with counts by state
    Queues {
        /// Queue name or path glob (e.g. 'survey*')
        #[arg(short = 'q', long = "queue")]
        pattern: String,
    },
    /// List tasks in a queue
    Tasks {
        /// Path to the queue store file
        #[arg(short = 'q', long)]
        queue: PathBuf,
        /// Only tasks in this state (default: all)
        #[arg(long)]
        state: Option<String>,
        /// Only tasks of this app
        #[arg(long)]
        app: Option<String>,
    },
    /// Pause scheduling; running workers finish
    Pause {
        #[arg(short = 'q', long)]
        queue: PathBuf,
    },
    /// Resume scheduling
    Resume {
        #[arg(short = 'q', long)]
        queue: PathBuf,
        /// Also launch a detached manager
        #[arg(long)]
        spawn: bool,
    },
    /// Move records in a state back to pending
    Retry {
        #[arg(short = 'q', long)]
        queue: PathBuf,
        /// State to retry (failed, killed, unknown, succeeded, running)
        #[arg(long)]
        state: String,
        /// For --state running: requeue records with live workers too
        #[arg(long)]
        force: bool,
    },
    /// Run a manager loop for a queue
    Spawn {
        #[arg(short = 'q', long)]
        queue: PathBuf,
        /// Detach the manager instead of running in the foreground
        #[arg(long)]
        spawn: bool,
    },
    /// Delete queues (preview without --force)
    Delete {
        /// Queue name or path glob
        #[arg(short = 'q', long = "queue")]
        pattern: String,
        /// Actually delete instead of previewing
        #[arg(long)]
        force: bool,
        /// Also clear the shared result cache under each base dir
        #[arg(long)]
        cache: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            output::fail(e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output::fail(e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> PipelineResult<PipelineConfig> {
    match &cli.config {
        Some(path) => PipelineConfig::load_from(path),
        None => PipelineConfig::load(),
    }
}

async fn run(cli: Cli, config: PipelineConfig) -> PipelineResult<()> {
    match cli.command {
        Commands::Queues { pattern } => commands::queues::handle(&pattern, &config).await,
        Commands::Tasks { queue, state, app } => {
            commands::tasks::handle(&queue, state.as_deref(), app).await
        }
        Commands::Pause { queue } => commands::control::pause(&queue).await,
        Commands::Resume { queue, spawn } => {
            commands::control::resume(&queue, spawn, cli.config.as_deref()).await
        }
        Commands::Retry {
            queue,
            state,
            force,
        } => commands::control::retry(&queue, &state, force).await,
        Commands::Spawn { queue, spawn } => {
            commands::spawn::handle(&queue, spawn, cli.config.as_deref(), &config).await
        }
        Commands::Delete {
            pattern,
            force,
            cache,
        } => commands::delete::handle(&pattern, force, cache, &config).await,
    }
}
