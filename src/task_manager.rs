//! # Task Manager (user-facing binding)
//!
//! Wraps declared apps, captures call arguments, lifts embedded futures
//! into dependency edges, computes the fingerprint, and enqueues a record —
//! or short-circuits against the result cache. Enqueue never blocks on task
//! execution; it returns a [`TaskFuture`] immediately.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::args::{collect_deps, ArgNode};
use crate::cache::ResultCache;
use crate::config::PipelineConfig;
use crate::environment::{version_inventory, Environment};
use crate::error::{PipelineError, PipelineResult};
use crate::fingerprint::{AppIdentity, Fingerprint};
use crate::future::TaskFuture;
use crate::manager::Manager;
use crate::record::{NewTask, ResultRef, TaskKind};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::store::QueueStore;
use crate::worker::SPAWN_QUEUE_ENV;

/// Front-end binding to one queue
///
/// `clone_with` produces a sibling manager sharing the same queue but with
/// a different scheduler configuration, so some tasks can be drained with
/// one worker while a sibling drains others with four.
#[derive(Debug, Clone)]
pub struct TaskManager {
    store: QueueStore,
    cache: ResultCache,
    environment: Environment,
    scheduler_config: SchedulerConfig,
    config: PipelineConfig,
    apps_dir: PathBuf,
}

impl TaskManager {
    /// Create or attach the queue `name` under the configured base dir
    pub async fn new(
        name: &str,
        config: PipelineConfig,
        environment: Environment,
    ) -> PipelineResult<Self> {
        let store = QueueStore::open(name, &config.base_dir).await?;
        let cache = ResultCache::open(&config.base_dir)?;
        store.set_environment(&environment).await?;

        let apps_dir = config.base_dir.join(".skypipe").join("apps");
        std::fs::create_dir_all(&apps_dir)?;

        let scheduler_config = SchedulerConfig {
            max_workers: config.max_workers,
            wait_on_shutdown: config.wait_on_shutdown,
        };
        Ok(Self {
            store,
            cache,
            environment,
            scheduler_config,
            config,
            apps_dir,
        })
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Sibling manager on the same queue with different scheduling knobs
    pub fn clone_with(&self, scheduler_config: SchedulerConfig) -> Self {
        Self {
            scheduler_config,
            ..self.clone()
        }
    }

    /// Declare a native app call
    pub fn app(&self, name: impl Into<String>) -> AppCall<'_> {
        AppCall::new(self, name.into(), TaskKind::Native)
    }

    /// Declare a shell app call; its argv goes in as positional arguments
    pub fn shell(&self, name: impl Into<String>) -> AppCall<'_> {
        AppCall::new(self, name.into(), TaskKind::Shell)
    }

    /// Run a manager loop for this queue in the current process, using this
    /// binding's scheduler configuration
    pub async fn drain(&self) -> PipelineResult<()> {
        let provider = self.config.build_provider()?;
        let scheduler = Scheduler::new(
            self.store.clone(),
            self.cache.clone(),
            provider,
            self.environment.clone(),
            self.scheduler_config.clone(),
        )?;
        Manager::new(
            self.store.clone(),
            scheduler,
            self.config.poll_interval(),
        )
        .run()
        .await
    }

    /// Launch a detached manager for this queue unless one is already live
    async fn ensure_manager(&self) -> PipelineResult<()> {
        if self.store.manager_lock_holder().await?.is_some() {
            return Ok(());
        }
        let exe = std::env::current_exe()?;
        let child = std::process::Command::new(&exe)
            .env(SPAWN_QUEUE_ENV, self.store.path())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        info!(
            queue = %self.store.name(),
            manager_pid = child.id(),
            "auto-spawned detached manager"
        );
        Ok(())
    }

    async fn submit(&self, call: AppCall<'_>) -> PipelineResult<TaskFuture> {
        if call.skip {
            debug!(app = %call.name, "skipped declaration, returning null future");
            return Ok(TaskFuture::null());
        }

        let deps = collect_deps(&call.args, &call.kwargs);
        let dep_ids: Vec<i64> = deps.iter().map(|d| d.task_id).collect();
        let dep_fingerprints: Vec<Fingerprint> =
            deps.iter().map(|d| d.fingerprint.clone()).collect();

        // A future minted against another queue (or a stale store) would
        // silently alias an unrelated record; reject it here
        for dep in &deps {
            let record = self.store.get(dep.task_id).await.map_err(|_| {
                PipelineError::enqueue(format!(
                    "dependency task {} does not exist in queue {}",
                    dep.task_id,
                    self.store.name()
                ))
            })?;
            if record.fingerprint != dep.fingerprint {
                return Err(PipelineError::enqueue(format!(
                    "dependency task {} carries fingerprint {} but the queue records {}",
                    dep.task_id, dep.fingerprint, record.fingerprint
                )));
            }
        }

        let identity = match &call.alias {
            Some(alias) => AppIdentity::Named(alias),
            None => AppIdentity::Code(&call.source),
        };
        let fingerprint =
            Fingerprint::compute(identity, &call.args, &call.kwargs, &dep_fingerprints)?;

        self.snapshot_app(&call)?;

        // Enqueue-time cache hit: insert the record already succeeded so no
        // worker ever runs. A corrupt entry counts as a miss.
        let cached = if self.cache.has(&fingerprint) {
            match self.cache.get(&fingerprint) {
                Ok(_) => Some(ResultRef {
                    path: self.cache.entry_path(&fingerprint),
                    fingerprint: fingerprint.clone(),
                }),
                Err(PipelineError::CacheCorrupt { reason, .. }) => {
                    warn!(
                        fingerprint = %fingerprint,
                        reason = %reason,
                        "corrupt cache entry treated as miss"
                    );
                    // Clear it so the re-run's write-once put can land
                    self.cache.evict(&fingerprint)?;
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };
        let hit = cached.is_some();

        let task = NewTask {
            app_name: call.name.clone(),
            kind: call.kind,
            code_blob: call.source.clone(),
            args: call.args,
            kwargs: call.kwargs,
            dep_ids,
            fingerprint: fingerprint.clone(),
        };
        let id = self.store.append(&task, cached).await?;
        debug!(
            queue = %self.store.name(),
            task_id = id,
            app = %call.name,
            cache_hit = hit,
            "task enqueued"
        );

        if self.config.spawn && !hit {
            self.ensure_manager().await?;
        }

        Ok(TaskFuture::new(
            self.store.clone(),
            self.cache.clone(),
            id,
            fingerprint,
        ))
    }

    /// Persist the app's source text and version inventory under
    /// `.skypipe/apps/` (bookkeeping; not part of the fingerprint)
    fn snapshot_app(&self, call: &AppCall<'_>) -> PipelineResult<()> {
        if call.source.is_empty() {
            return Ok(());
        }
        std::fs::write(self.apps_dir.join(format!("{}.rs", call.name)), &call.source)?;
        std::fs::write(
            self.apps_dir.join(format!("{}.versions", call.name)),
            serde_json::to_vec_pretty(&version_inventory())?,
        )?;
        Ok(())
    }
}

/// One app call being declared; consumed by `submit`
#[derive(Debug)]
pub struct AppCall<'a> {
    manager: &'a TaskManager,
    name: String,
    kind: TaskKind,
    source: String,
    alias: Option<String>,
    skip: bool,
    args: Vec<ArgNode>,
    kwargs: BTreeMap<String, ArgNode>,
}

impl<'a> AppCall<'a> {
    fn new(manager: &'a TaskManager, name: String, kind: TaskKind) -> Self {
        Self {
            manager,
            name,
            kind,
            source: String::new(),
            alias: None,
            skip: false,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Verbatim source text of the callable; participates in the
    /// fingerprint unless the call is named
    pub fn source(mut self, text: impl Into<String>) -> Self {
        self.source = text.into();
        self
    }

    /// Fingerprint by app name instead of source, rebinding to any prior
    /// result computed under the same name and arguments
    pub fn named(mut self) -> Self {
        self.alias = Some(self.name.clone());
        self
    }

    /// Like [`named`](Self::named), under an explicit alias
    pub fn named_as(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Do not enqueue; the call returns a null future and participates in
    /// no graph
    pub fn skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    pub fn arg(mut self, value: impl Into<ArgNode>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, T>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ArgNode>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<ArgNode>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Enqueue the call, returning its future
    pub async fn submit(self) -> PipelineResult<TaskFuture> {
        let manager = self.manager;
        manager.submit(self).await
    }
}
