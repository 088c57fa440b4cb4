//! # skypipe-core
//!
//! Task pipeline engine for survey data processing: declare computational
//! tasks (native callables or shell commands) that depend on each other,
//! record them into a durable per-queue store, resolve dependencies,
//! dispatch to workers (local processes or batch allocations), and memoize
//! results in a content-addressed cache keyed by code + inputs.
//!
//! ## Quick tour
//!
//! ```ignore
//! let mut registry = AppRegistry::new();
//! registry.register("fraction", |args: &TaskArgs| {
//!     Ok(Value::from(args.kwarg_f64("seed")? / 10.0))
//! });
//! // Re-enter as a worker or detached manager when spawned as one
//! if let Some(code) = skypipe_core::bootstrap(&registry)? {
//!     std::process::exit(code);
//! }
//!
//! let tm = TaskManager::new("survey", config, Environment::default()).await?;
//! let futures: Vec<_> = ... // tm.app("fraction").source(SRC).kwarg("seed", i).submit().await?
//! let avg = tm.app("average").source(AVG_SRC)
//!     .arg(futures.iter().map(TaskFuture::as_arg).collect::<Vec<_>>())
//!     .submit().await?;
//! avg.result().await?;
//! ```
//!
//! The management surface (`queues`, `tasks`, `pause`, `resume`, `retry`,
//! `spawn`, `delete`) lives in the `skypipe-ctl` binary crate.

pub mod app;
pub mod args;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod environment;
pub mod error;
pub mod fingerprint;
pub mod future;
pub mod manager;
pub mod provider;
pub mod record;
pub mod scheduler;
pub mod store;
pub mod task_manager;
pub mod worker;

pub use app::{AppError, AppRegistry, TaskArgs};
pub use args::ArgNode;
pub use cache::ResultCache;
pub use config::PipelineConfig;
pub use environment::Environment;
pub use error::{PipelineError, PipelineResult};
pub use fingerprint::Fingerprint;
pub use future::TaskFuture;
pub use manager::Manager;
pub use record::{QueueState, TaskKind, TaskRecord, TaskState};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{QueueStore, RetryMode};
pub use task_manager::TaskManager;
pub use worker::bootstrap;
