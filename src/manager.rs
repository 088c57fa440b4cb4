//! # Manager Loop
//!
//! The long-lived coordinator that owns one scheduler for one queue. It
//! refuses to start while another live manager holds the store's lock,
//! demotes running records orphaned by a dead predecessor, then drives the
//! scheduler every poll interval until the queue drains, pauses out, or a
//! signal arrives.

use std::time::Duration;

use tracing::{info, warn};

use crate::cache::ResultCache;
use crate::config::PipelineConfig;
use crate::error::PipelineResult;
use crate::record::QueueState;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::store::QueueStore;

/// Coordinator for one queue
#[derive(Debug)]
pub struct Manager {
    store: QueueStore,
    scheduler: Scheduler,
    poll_interval: Duration,
}

impl Manager {
    pub fn new(store: QueueStore, scheduler: Scheduler, poll_interval: Duration) -> Self {
        Self {
            store,
            scheduler,
            poll_interval,
        }
    }

    /// Assemble a manager from layered configuration, reading the queue's
    /// recorded environment. Used by `skypipe-ctl spawn` and the detached
    /// auto-spawn path.
    pub async fn from_config(store: QueueStore, config: &PipelineConfig) -> PipelineResult<Self> {
        let cache = ResultCache::open(store.base_dir())?;
        let environment = store.environment().await?;
        let provider = config.build_provider()?;
        let scheduler = Scheduler::new(
            store.clone(),
            cache,
            provider,
            environment,
            SchedulerConfig {
                max_workers: config.max_workers,
                wait_on_shutdown: config.wait_on_shutdown,
            },
        )?;
        Ok(Self::new(store, scheduler, config.poll_interval()))
    }

    /// Run to completion
    ///
    /// Exits cleanly when (queue empty and nothing in flight), when paused
    /// with nothing in flight, when the store file disappears (queue
    /// deleted), or on ctrl-c. Holds the singleton manager lock for the
    /// whole run.
    pub async fn run(mut self) -> PipelineResult<()> {
        let lock = self.store.acquire_manager_lock().await?;
        info!(
            queue = %self.store.name(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "manager started"
        );

        // Recovery: running records from a dead predecessor can never
        // finalize; demote them so retry can requeue
        self.store.sweep_orphans(&[]).await?;

        let outcome = self.drive().await;

        if let Err(e) = self.scheduler.shutdown().await {
            warn!(error = %e, "scheduler shutdown incomplete");
        }
        if let Err(e) = self.store.release_manager_lock(&lock).await {
            warn!(error = %e, "failed to release manager lock");
        }
        info!(queue = %self.store.name(), "manager exited");
        outcome
    }

    async fn drive(&mut self) -> PipelineResult<()> {
        loop {
            let interrupted = tokio::select! {
                _ = tokio::signal::ctrl_c() => true,
                _ = tokio::time::sleep(self.poll_interval) => false,
            };
            if interrupted {
                info!(queue = %self.store.name(), "signal received, stopping claims");
                return Ok(());
            }

            // Deleted queues force managers to exit on their next poll
            if !self.store.path().exists() {
                warn!(queue = %self.store.name(), "queue store deleted, exiting");
                return Ok(());
            }

            let queue_state = self.store.queue_state().await?;
            if queue_state == QueueState::Active {
                self.store.promote_waiting().await?;
                self.store.cancel_dep_failed().await?;
            }

            if let Err(e) = self.scheduler.step(queue_state).await {
                if e.is_recoverable() {
                    warn!(error = %e, "scheduler step failed, continuing");
                } else {
                    return Err(e);
                }
            }

            let counts = self.store.counts_by_state().await?;
            let outstanding: i64 = counts
                .iter()
                .filter(|(state, _)| state.is_outstanding())
                .map(|(_, n)| *n)
                .sum();

            if outstanding == 0 && self.scheduler.in_flight() == 0 {
                info!(queue = %self.store.name(), "queue drained");
                return Ok(());
            }
            if queue_state == QueueState::Paused && self.scheduler.in_flight() == 0 {
                info!(queue = %self.store.name(), "queue paused with nothing in flight");
                return Ok(());
            }
        }
    }
}
