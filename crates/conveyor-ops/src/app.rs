//! Process wiring
//!
//! One [`App`] per process: the storage connection (with embedded
//! fallback), the process-wide registries, and the engine services,
//! initialized once at startup and torn down on shutdown. Every
//! operation function takes `&App` — no implicit globals.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use conveyor_core::error::CoreError;
use conveyor_core::registry::{HandlerRegistry, WorkflowRegistry};
use conveyor_engine::{
    AnomalyRecorder, BackfillPlanner, CancellationHub, ConcurrencyGuard, DeadLetterQueue,
    Dispatcher, DispatcherConfig, Executor, ExecutorConfig, RunnerConfig, WorkflowRunner,
};
use conveyor_scheduler::{Scheduler, SchedulerConfig};
use conveyor_storage::{CoreStore, InMemoryStore, PostgresStore};

use crate::config::Config;

/// Application context shared by all operations.
pub struct App {
    pub config: Config,
    pub store: Arc<dyn CoreStore>,
    pub handlers: Arc<HandlerRegistry>,
    pub workflows: Arc<WorkflowRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub executor: Arc<Executor>,
    pub scheduler: Arc<Scheduler>,
    pub guard: ConcurrencyGuard,
    pub dlq: DeadLetterQueue,
    pub anomalies: AnomalyRecorder,
    pub backfills: BackfillPlanner,
}

impl App {
    /// Connect storage, wire the engine, and start the executor.
    ///
    /// The scheduler loop is not started here — call
    /// [`App::start_scheduler`] once handlers and workflows are
    /// registered.
    pub async fn start(config: Config) -> Result<Self, CoreError> {
        let store = Self::connect(&config).await;
        if config.init_schema {
            store.init_schema().await?;
        }

        let handlers = Arc::new(HandlerRegistry::new());
        let workflows = Arc::new(WorkflowRegistry::new());
        let cancels = Arc::new(CancellationHub::new());
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            queue_tx,
            Arc::clone(&cancels),
            DispatcherConfig {
                default_lane: config.default_lane.clone(),
                ..Default::default()
            },
        ));

        let guard = ConcurrencyGuard::new(Arc::clone(&store), config.lease_ttl_seconds);
        let runner = Arc::new(WorkflowRunner::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            guard.clone(),
            RunnerConfig::default(),
        ));

        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            Arc::clone(&handlers),
            Arc::clone(&workflows),
            Arc::clone(&dispatcher),
            runner,
            Arc::clone(&cancels),
            queue_rx,
            ExecutorConfig {
                max_concurrency: config.max_concurrency,
            },
        ));
        executor.start().await;

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            SchedulerConfig {
                tick_interval: Duration::from_secs(config.scheduler_tick_seconds.max(1)),
                ..Default::default()
            },
        ));

        let dlq = DeadLetterQueue::new(Arc::clone(&store), Arc::clone(&dispatcher));
        let anomalies = AnomalyRecorder::new(Arc::clone(&store));
        let backfills = BackfillPlanner::new(Arc::clone(&store));

        info!(database_url = %config.database_url, "conveyor started");
        Ok(Self {
            config,
            store,
            handlers,
            workflows,
            dispatcher,
            executor,
            scheduler,
            guard,
            dlq,
            anomalies,
            backfills,
        })
    }

    /// Start the periodic scheduler tick loop.
    pub fn start_scheduler(&self) {
        self.scheduler.start();
    }

    /// Stop background loops. In-flight runs finish.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.executor.shutdown();
    }

    /// Select the storage backend from the database URL, falling back
    /// to the embedded in-memory store when the server is unreachable.
    async fn connect(config: &Config) -> Arc<dyn CoreStore> {
        let url = config.database_url.trim();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            match PostgresStore::connect(url).await {
                Ok(store) => return Arc::new(store),
                Err(err) => {
                    warn!("postgres unreachable, falling back to embedded store: {err}");
                }
            }
        } else if url != "memory" {
            warn!(%url, "unrecognized database URL, using embedded store");
        }
        Arc::new(InMemoryStore::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_with_memory_store() {
        let app = App::start(Config::default()).await.unwrap();
        let health = app.store.health().await.unwrap();
        assert_eq!(health.backend, "memory");
        assert!(health.reachable);
        app.shutdown();
    }
}
