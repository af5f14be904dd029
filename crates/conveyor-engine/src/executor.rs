//! In-process executor pool
//!
//! Consumes run IDs from the dispatcher queue and executes them with
//! bounded concurrency: workflow runs go through the [`WorkflowRunner`],
//! everything else resolves a handler from the registry. Terminal
//! outcomes flow back through the dispatcher so retry/DLQ policy is
//! applied in exactly one place.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use conveyor_core::error::{CoreError, ErrorCategory, RunError};
use conveyor_core::event::RunEvent;
use conveyor_core::registry::{HandlerRegistry, OperationInvocation, WorkflowRegistry};
use conveyor_core::run::{JsonMap, RunKind, RunStatus};
use conveyor_storage::CoreStore;

use crate::cancel::CancellationHub;
use crate::dispatcher::Dispatcher;
use crate::runner::{RunnerOptions, WorkflowRunStatus, WorkflowRunner};

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum runs executing concurrently
    pub max_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { max_concurrency: 8 }
    }
}

/// Executes queued runs on the local process.
pub struct Executor {
    store: Arc<dyn CoreStore>,
    handlers: Arc<HandlerRegistry>,
    workflows: Arc<WorkflowRegistry>,
    dispatcher: Arc<Dispatcher>,
    runner: Arc<WorkflowRunner>,
    cancels: Arc<CancellationHub>,
    semaphore: Arc<Semaphore>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CoreStore>,
        handlers: Arc<HandlerRegistry>,
        workflows: Arc<WorkflowRegistry>,
        dispatcher: Arc<Dispatcher>,
        runner: Arc<WorkflowRunner>,
        cancels: Arc<CancellationHub>,
        queue_rx: mpsc::UnboundedReceiver<Uuid>,
        config: ExecutorConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            handlers,
            workflows,
            dispatcher,
            runner,
            cancels,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown_tx,
        }
    }

    /// Start the consume loop. Call once; later calls are no-ops.
    pub async fn start(self: &Arc<Self>) {
        let Some(mut queue_rx) = self.queue_rx.lock().await.take() else {
            warn!("executor already started");
            return;
        };
        let executor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!("executor started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    received = queue_rx.recv() => {
                        match received {
                            Some(run_id) => {
                                let permit = match Arc::clone(&executor.semaphore)
                                    .acquire_owned()
                                    .await
                                {
                                    Ok(permit) => permit,
                                    Err(_) => break,
                                };
                                let executor = Arc::clone(&executor);
                                tokio::spawn(async move {
                                    executor.execute_run(run_id).await;
                                    drop(permit);
                                });
                            }
                            None => break,
                        }
                    }
                }
            }
            info!("executor stopped");
        });
    }

    /// Signal the consume loop to stop. In-flight runs finish.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    #[instrument(skip(self))]
    async fn execute_run(&self, run_id: Uuid) {
        if let Err(err) = self.try_execute(run_id).await {
            error!(%run_id, "run execution error: {err}");
        }
        self.cancels.remove(run_id);
    }

    async fn try_execute(&self, run_id: Uuid) -> Result<(), CoreError> {
        let Some(mut run) = self.store.get_run(run_id).await? else {
            warn!(%run_id, "queued run no longer exists");
            return Ok(());
        };
        // Cancelled (or otherwise finished) before we got to it
        if !matches!(run.status, RunStatus::Pending | RunStatus::Queued) {
            return Ok(());
        }

        let cancel_rx = self.cancels.register(run_id);

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        self.store.update_run(&run).await?;
        self.store
            .append_event(run_id, &RunEvent::Started { attempt: run.attempt })
            .await?;

        let outcome = match run.kind {
            RunKind::Workflow => self.execute_workflow(&run, cancel_rx).await,
            _ => self.execute_handler(&run, cancel_rx).await,
        };

        match outcome {
            Ok(result) => {
                self.dispatcher.complete_run(run_id, result).await?;
            }
            Err(err) if err.category == ErrorCategory::Cancelled => {
                // No-op if the dispatcher already recorded cancellation
                self.dispatcher.cancel(run_id, &err.message).await?;
            }
            Err(err) => {
                // A concurrent cancellation may have already finished the
                // run; losing that race is not an executor error.
                match self.dispatcher.fail_run(run_id, err).await {
                    Ok(_) | Err(CoreError::Conflict(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    async fn execute_workflow(
        &self,
        run: &conveyor_core::run::Run,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<JsonMap, RunError> {
        let Some(workflow) = self.workflows.get(&run.name) else {
            return Err(RunError::categorized(
                format!("no workflow registered: {}", run.name),
                ErrorCategory::Validation,
            ));
        };

        let dry_run = run
            .metadata
            .get("dry_run")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let opts = RunnerOptions {
            start_from: run
                .metadata
                .get("start_from")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            dry_run,
            cancel: Some(cancel_rx),
            parent_run_id: run.parent_run_id,
            correlation_id: run.correlation_id.clone(),
            batch_id: run.batch_id.clone(),
        };

        let result = match self
            .runner
            .execute(&workflow, run.params.clone(), run.run_id, opts)
            .await
        {
            Ok(result) => result,
            Err(CoreError::LockUnavailable(key)) => {
                return Err(RunError::cancelled(format!("lock_unavailable: {key}")));
            }
            Err(err) => {
                return Err(RunError::new(format!("workflow runner error: {err}")));
            }
        };

        match result.status {
            WorkflowRunStatus::Completed | WorkflowRunStatus::Partial => {
                Ok(result.to_run_result())
            }
            WorkflowRunStatus::Cancelled => {
                Err(RunError::cancelled("workflow cancelled"))
            }
            WorkflowRunStatus::Failed | WorkflowRunStatus::Running => {
                let step = result.error_step.as_deref().unwrap_or("<unknown>");
                let (category, retryable) = result
                    .step_executions
                    .iter()
                    .find(|e| Some(e.step_name.as_str()) == result.error_step.as_deref())
                    .and_then(|e| e.error.as_ref())
                    .map(|e| (e.category, e.retryable))
                    .unwrap_or((ErrorCategory::Unknown, true));
                Err(RunError {
                    message: format!(
                        "step {step} failed: {}",
                        result.error.as_deref().unwrap_or("unknown error")
                    ),
                    category,
                    retryable,
                })
            }
        }
    }

    async fn execute_handler(
        &self,
        run: &conveyor_core::run::Run,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<JsonMap, RunError> {
        let Some(handler) = self.handlers.get(run.kind, &run.name) else {
            return Err(RunError::categorized(
                format!("no handler registered for {} {}", run.kind, run.name),
                ErrorCategory::Validation,
            ));
        };

        let invocation = OperationInvocation {
            run_id: run.run_id,
            params: run.params.clone(),
            metadata: run.metadata.clone(),
            cancelled: cancel_rx,
        };
        handler(invocation).await
    }
}
