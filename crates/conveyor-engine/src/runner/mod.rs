//! Workflow runner
//!
//! Executes a registered workflow for a run: sequentially in list order,
//! or as a parallel DAG driven by the ready-set algorithm with bounded
//! concurrency. Choice steps route; wait steps suspend
//! cancellation-aware; operation steps become child runs awaited to
//! terminal status; map steps fan a handler out over a params list.
//!
//! The runner is the single writer of the workflow context: handlers
//! return outputs and the runner commits them, so parallel steps never
//! contend on shared state.

pub mod dag;
pub mod result;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use conveyor_core::context::WorkflowContext;
use conveyor_core::error::{CoreError, ErrorCategory, RunError};
use conveyor_core::event::RunEvent;
use conveyor_core::run::{JsonMap, RunKind, RunStatus, WorkSpec};
use conveyor_core::step::{ErrorPolicy, Step, StepHandler, StepResult, StepType};
use conveyor_core::workflow::{ExecutionMode, Workflow};
use conveyor_storage::CoreStore;

use crate::cancel::CancelProbe;
use crate::dispatcher::Dispatcher;
use crate::guard::ConcurrencyGuard;

use dag::StepDag;
pub use result::{StepExecution, StepRunStatus, WorkflowResult, WorkflowRunStatus};

/// Runner tuning knobs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How often to poll a child operation run for terminal status
    pub operation_poll_interval: Duration,

    /// Bound on waiting for a child operation run; `None` waits forever
    pub operation_timeout: Option<Duration>,

    /// Cancellation poll interval inside wait steps (kept well under 1s)
    pub wait_poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            operation_poll_interval: Duration::from_millis(50),
            operation_timeout: None,
            wait_poll_interval: Duration::from_millis(250),
        }
    }
}

/// Per-execution options.
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// Sequential mode only: skip steps before this one
    pub start_from: Option<String>,

    /// Evaluate routing only; do not invoke handlers or child runs
    pub dry_run: bool,

    /// External cancellation token for the run
    pub cancel: Option<watch::Receiver<bool>>,

    pub parent_run_id: Option<Uuid>,
    pub correlation_id: Option<String>,
    pub batch_id: Option<String>,
}

/// What a single step produced.
enum StepDisposition {
    Success {
        output: JsonMap,
        context_updates: JsonMap,
    },
    Failure {
        error: RunError,
    },
    Branch {
        chosen: Option<String>,
        unchosen: Option<String>,
    },
}

struct StepOutcome {
    disposition: StepDisposition,
    execution: StepExecution,
}

/// Accumulated execution state.
#[derive(Default)]
struct RunState {
    completed: Vec<String>,
    failed: Vec<String>,
    skipped: Vec<String>,
    executions: Vec<StepExecution>,
    error_step: Option<String>,
    error: Option<String>,
    cancelled: bool,
}

impl RunState {
    fn status(&self) -> WorkflowRunStatus {
        if self.cancelled {
            WorkflowRunStatus::Cancelled
        } else if self.error_step.is_some() {
            WorkflowRunStatus::Failed
        } else if !self.failed.is_empty() {
            WorkflowRunStatus::Partial
        } else {
            WorkflowRunStatus::Completed
        }
    }
}

/// Executes workflow definitions.
pub struct WorkflowRunner {
    store: Arc<dyn CoreStore>,
    dispatcher: Arc<Dispatcher>,
    guard: ConcurrencyGuard,
    config: RunnerConfig,
}

impl WorkflowRunner {
    pub fn new(
        store: Arc<dyn CoreStore>,
        dispatcher: Arc<Dispatcher>,
        guard: ConcurrencyGuard,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            guard,
            config,
        }
    }

    /// Execute `workflow` under `run_id`.
    ///
    /// Returns `LockUnavailable` without running any step when the
    /// workflow's lock policy refuses the lease.
    #[instrument(skip(self, workflow, params, opts), fields(workflow = %workflow.name, %run_id))]
    pub async fn execute(
        &self,
        workflow: &Workflow,
        params: JsonMap,
        run_id: Uuid,
        opts: RunnerOptions,
    ) -> Result<WorkflowResult, CoreError> {
        workflow.validate()?;
        if opts.start_from.is_some() && workflow.policy.mode == ExecutionMode::Parallel {
            return Err(CoreError::ValidationFailed(
                "start_from requires sequential execution".to_string(),
            ));
        }

        let started_at = Utc::now();

        let mut merged = workflow.defaults.clone();
        for (key, value) in params {
            merged.insert(key, value);
        }
        let mut ctx = WorkflowContext::new(run_id, &workflow.name, merged)
            .with_parent(opts.parent_run_id)
            .with_correlation_id(opts.correlation_id.clone())
            .with_batch_id(opts.batch_id.clone())
            .with_dry_run(opts.dry_run);

        let probe = match &opts.cancel {
            Some(rx) => CancelProbe::external(rx.clone()),
            None => CancelProbe::none(),
        };

        let lock = match (&workflow.lock, opts.dry_run) {
            (Some(policy), false) => {
                let key = ConcurrencyGuard::workflow_lock_key(
                    &workflow.name,
                    ctx.params(),
                    &policy.partition_params,
                );
                let owner = run_id.to_string();
                if !self
                    .guard
                    .acquire(&key, &owner, Some(policy.ttl_seconds))
                    .await?
                {
                    info!(%key, "workflow lock refused");
                    return Err(CoreError::LockUnavailable(key));
                }
                Some((key, owner))
            }
            _ => None,
        };

        let state = match workflow.policy.mode {
            ExecutionMode::Sequential => {
                self.run_sequential(workflow, &mut ctx, run_id, &opts, &probe).await
            }
            ExecutionMode::Parallel => {
                self.run_parallel(workflow, &mut ctx, run_id, &opts, &probe).await
            }
        };

        if let Some((key, owner)) = lock {
            if let Err(err) = self.guard.release(&key, &owner).await {
                warn!(%key, "failed to release workflow lock: {err}");
            }
        }

        let state = state?;
        let finished_at = Utc::now();
        Ok(WorkflowResult {
            workflow_name: workflow.name.clone(),
            run_id,
            status: state.status(),
            completed_steps: state.completed,
            failed_steps: state.failed,
            skipped_steps: state.skipped,
            error_step: state.error_step,
            error: state.error,
            step_executions: state.executions,
            context_snapshot: ctx.snapshot(),
            started_at,
            finished_at,
        })
    }

    // =========================================================================
    // Sequential mode
    // =========================================================================

    async fn run_sequential(
        &self,
        workflow: &Workflow,
        ctx: &mut WorkflowContext,
        run_id: Uuid,
        opts: &RunnerOptions,
        probe: &CancelProbe,
    ) -> Result<RunState, CoreError> {
        let mut state = RunState::default();
        let mut skip_until: Option<(String, &'static str)> = opts
            .start_from
            .clone()
            .map(|target| (target, "before start_from"));

        for step in &workflow.steps {
            if probe.is_externally_cancelled() {
                state.cancelled = true;
                break;
            }

            if let Some((target, reason)) = skip_until.clone() {
                if step.name != target {
                    self.record_skip(run_id, step, reason, &mut state).await;
                    continue;
                }
                skip_until = None;
            }

            let outcome = self
                .run_step(ctx.clone(), step, run_id, opts.dry_run, probe.clone())
                .await;
            state.executions.push(outcome.execution);

            match outcome.disposition {
                StepDisposition::Success {
                    output,
                    context_updates,
                } => {
                    ctx.record_output(&step.name, output);
                    ctx.merge_params(context_updates);
                    state.completed.push(step.name.clone());
                }
                StepDisposition::Branch { chosen, .. } => {
                    state.completed.push(step.name.clone());
                    if let Some(target) = chosen {
                        skip_until = Some((target, "not selected by choice"));
                    }
                }
                StepDisposition::Failure { error } => {
                    state.failed.push(step.name.clone());
                    if error.category == ErrorCategory::Cancelled
                        && probe.is_externally_cancelled()
                    {
                        state.cancelled = true;
                        break;
                    }
                    if step.on_error == ErrorPolicy::Stop {
                        state.error_step = Some(step.name.clone());
                        state.error = Some(error.message.clone());
                        break;
                    }
                }
            }
        }
        Ok(state)
    }

    // =========================================================================
    // Parallel DAG mode
    // =========================================================================

    async fn run_parallel(
        &self,
        workflow: &Workflow,
        ctx: &mut WorkflowContext,
        run_id: Uuid,
        opts: &RunnerOptions,
        probe: &CancelProbe,
    ) -> Result<RunState, CoreError> {
        let dag = StepDag::new(workflow)?;
        let mut state = RunState::default();
        let max_concurrency = workflow.policy.max_concurrency.max(1);

        let (stop_tx, stop_rx) = watch::channel(false);
        let step_probe = probe.with_internal(stop_rx);

        let mut indegree = dag.indegree.clone();
        let mut skip_marked: HashSet<String> = HashSet::new();
        let mut skipped_set: HashSet<String> = HashSet::new();
        let mut ready: Vec<String> = dag.entry_steps();
        let mut to_skip: Vec<String> = Vec::new();
        let mut running = FuturesUnordered::new();
        let mut stopping = false;

        loop {
            // Cascade skips before scheduling: a step whose dependencies
            // were all skipped is itself skipped.
            while let Some(name) = to_skip.pop() {
                if !skipped_set.insert(name.clone()) {
                    continue;
                }
                if let Some(step) = workflow.step(&name) {
                    self.record_skip(run_id, step, "not selected by choice", &mut state)
                        .await;
                }
                Self::resolve_dependents(
                    &dag,
                    &name,
                    &mut indegree,
                    &skip_marked,
                    &skipped_set,
                    &mut ready,
                    &mut to_skip,
                );
            }

            if probe.is_externally_cancelled() && !stopping {
                state.cancelled = true;
                stopping = true;
                let _ = stop_tx.send(true);
            }

            while !stopping && running.len() < max_concurrency && !ready.is_empty() {
                let name = ready.remove(0);
                let Some(step) = workflow.step(&name) else {
                    continue;
                };
                running.push(self.run_step(
                    ctx.clone(),
                    step,
                    run_id,
                    opts.dry_run,
                    step_probe.clone(),
                ));
            }

            if running.is_empty() {
                break;
            }

            let Some(outcome) = running.next().await else {
                break;
            };
            let step_name = outcome.execution.step_name.clone();
            state.executions.push(outcome.execution);

            match outcome.disposition {
                StepDisposition::Success {
                    output,
                    context_updates,
                } => {
                    ctx.record_output(&step_name, output);
                    ctx.merge_params(context_updates);
                    state.completed.push(step_name.clone());
                    if !stopping {
                        Self::resolve_dependents(
                            &dag,
                            &step_name,
                            &mut indegree,
                            &skip_marked,
                            &skipped_set,
                            &mut ready,
                            &mut to_skip,
                        );
                    }
                }
                StepDisposition::Branch { chosen: _, unchosen } => {
                    state.completed.push(step_name.clone());
                    if !stopping {
                        if let Some(unchosen) = unchosen {
                            skip_marked.insert(unchosen);
                        }
                        Self::resolve_dependents(
                            &dag,
                            &step_name,
                            &mut indegree,
                            &skip_marked,
                            &skipped_set,
                            &mut ready,
                            &mut to_skip,
                        );
                    }
                }
                StepDisposition::Failure { error } => {
                    state.failed.push(step_name.clone());
                    let externally = error.category == ErrorCategory::Cancelled
                        && probe.is_externally_cancelled();
                    if externally {
                        state.cancelled = true;
                        stopping = true;
                        let _ = stop_tx.send(true);
                    } else {
                        let stop_step = workflow
                            .step(&step_name)
                            .map(|s| s.on_error == ErrorPolicy::Stop)
                            .unwrap_or(true);
                        if stop_step && workflow.policy.on_failure == ErrorPolicy::Stop {
                            state.error_step = Some(step_name.clone());
                            state.error = Some(error.message.clone());
                            stopping = true;
                            let _ = stop_tx.send(true);
                        } else if !stopping {
                            // CONTINUE: a recorded failure still satisfies
                            // its dependents
                            Self::resolve_dependents(
                                &dag,
                                &step_name,
                                &mut indegree,
                                &skip_marked,
                                &skipped_set,
                                &mut ready,
                                &mut to_skip,
                            );
                        }
                    }
                }
            }
        }

        if probe.is_externally_cancelled() {
            state.cancelled = true;
        }
        Ok(state)
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_dependents(
        dag: &StepDag,
        from: &str,
        indegree: &mut std::collections::HashMap<String, usize>,
        skip_marked: &HashSet<String>,
        skipped_set: &HashSet<String>,
        ready: &mut Vec<String>,
        to_skip: &mut Vec<String>,
    ) {
        for dependent in dag.dependents.get(from).into_iter().flatten() {
            let Some(count) = indegree.get_mut(dependent) else {
                continue;
            };
            if *count == 0 {
                continue;
            }
            *count -= 1;
            if *count == 0 {
                let deps = &dag.dependencies[dependent];
                let all_deps_skipped =
                    !deps.is_empty() && deps.iter().all(|d| skipped_set.contains(d));
                if skip_marked.contains(dependent) || all_deps_skipped {
                    to_skip.push(dependent.clone());
                } else {
                    ready.push(dependent.clone());
                    ready.sort_by_key(|name| {
                        dag.order.get(name).copied().unwrap_or(usize::MAX)
                    });
                }
            }
        }
    }

    // =========================================================================
    // Step execution
    // =========================================================================

    async fn run_step(
        &self,
        ctx: WorkflowContext,
        step: &Step,
        run_id: Uuid,
        dry_run: bool,
        probe: CancelProbe,
    ) -> StepOutcome {
        let started_at = Utc::now();
        self.emit(
            run_id,
            RunEvent::StepStarted {
                step: step.name.clone(),
                step_type: step.step_type.kind().to_string(),
                attempt: 1,
            },
        )
        .await;

        let disposition = match &step.step_type {
            // Choice conditions are evaluated even in dry runs; routing
            // is policy, not work.
            StepType::Choice {
                condition,
                then_step,
                else_step,
            } => {
                if condition(&ctx) {
                    StepDisposition::Branch {
                        chosen: Some(then_step.clone()),
                        unchosen: else_step.clone(),
                    }
                } else {
                    StepDisposition::Branch {
                        chosen: else_step.clone(),
                        unchosen: Some(then_step.clone()),
                    }
                }
            }
            _ if dry_run => StepDisposition::Success {
                output: JsonMap::new(),
                context_updates: JsonMap::new(),
            },
            StepType::Lambda { handler } => {
                Self::from_step_result(handler(&ctx, &JsonMap::new()))
            }
            StepType::Wait { duration_seconds } => {
                self.run_wait(*duration_seconds, &probe).await
            }
            StepType::Operation {
                operation_name,
                params,
            } => {
                self.run_operation(&ctx, operation_name, params, run_id, &probe)
                    .await
            }
            StepType::Map { items_key, handler } => {
                self.run_map(&ctx, items_key, handler, &probe)
            }
        };

        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

        let execution = match &disposition {
            StepDisposition::Success { output, .. } => {
                self.emit(
                    run_id,
                    RunEvent::StepCompleted {
                        step: step.name.clone(),
                        duration_ms,
                    },
                )
                .await;
                StepExecution {
                    step_name: step.name.clone(),
                    step_type: step.step_type.kind().to_string(),
                    status: StepRunStatus::Completed,
                    started_at: Some(started_at),
                    finished_at: Some(finished_at),
                    output: Some(output.clone()),
                    error: None,
                    attempt: 1,
                }
            }
            StepDisposition::Branch { .. } => {
                self.emit(
                    run_id,
                    RunEvent::StepCompleted {
                        step: step.name.clone(),
                        duration_ms,
                    },
                )
                .await;
                StepExecution {
                    step_name: step.name.clone(),
                    step_type: step.step_type.kind().to_string(),
                    status: StepRunStatus::Completed,
                    started_at: Some(started_at),
                    finished_at: Some(finished_at),
                    output: None,
                    error: None,
                    attempt: 1,
                }
            }
            StepDisposition::Failure { error } => {
                self.emit(run_id, RunEvent::step_failed(&step.name, error)).await;
                StepExecution {
                    step_name: step.name.clone(),
                    step_type: step.step_type.kind().to_string(),
                    status: StepRunStatus::Failed,
                    started_at: Some(started_at),
                    finished_at: Some(finished_at),
                    output: None,
                    error: Some(error.clone()),
                    attempt: 1,
                }
            }
        };

        StepOutcome {
            disposition,
            execution,
        }
    }

    fn from_step_result(result: StepResult) -> StepDisposition {
        match result {
            StepResult::Ok {
                output,
                context_updates,
            } => StepDisposition::Success {
                output,
                context_updates,
            },
            StepResult::Fail { error } => StepDisposition::Failure { error },
        }
    }

    async fn run_wait(&self, duration_seconds: u64, probe: &CancelProbe) -> StepDisposition {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(duration_seconds);
        loop {
            if probe.is_cancelled() {
                return StepDisposition::Failure {
                    error: RunError::cancelled("wait step cancelled"),
                };
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return StepDisposition::Success {
                    output: JsonMap::new(),
                    context_updates: JsonMap::new(),
                };
            }
            tokio::time::sleep((deadline - now).min(self.config.wait_poll_interval)).await;
        }
    }

    async fn run_operation(
        &self,
        ctx: &WorkflowContext,
        operation_name: &str,
        params: &JsonMap,
        run_id: Uuid,
        probe: &CancelProbe,
    ) -> StepDisposition {
        let mut child_params = ctx.params().clone();
        for (key, value) in params {
            child_params.insert(key.clone(), value.clone());
        }

        let mut spec = WorkSpec::new(RunKind::Operation, operation_name)
            .with_params(child_params)
            .with_parent(run_id);
        spec.correlation_id = ctx.correlation_id.clone();
        spec.batch_id = ctx.batch_id.clone();

        let child_id = match self.dispatcher.submit(spec).await {
            Ok(id) => id,
            Err(err) => {
                return StepDisposition::Failure {
                    error: RunError::new(format!(
                        "failed to submit operation {operation_name}: {err}"
                    )),
                };
            }
        };

        let deadline = self
            .config
            .operation_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        loop {
            if probe.is_cancelled() {
                let _ = self
                    .dispatcher
                    .cancel(child_id, "parent run cancelled")
                    .await;
                return StepDisposition::Failure {
                    error: RunError::cancelled(format!(
                        "operation {operation_name} cancelled"
                    )),
                };
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return StepDisposition::Failure {
                        error: RunError::categorized(
                            format!("operation {operation_name} timed out"),
                            ErrorCategory::Timeout,
                        ),
                    };
                }
            }

            match self.store.get_run(child_id).await {
                Ok(Some(child)) if child.status.is_terminal() => {
                    return match child.status {
                        RunStatus::Completed => StepDisposition::Success {
                            output: child.result.unwrap_or_default(),
                            context_updates: JsonMap::new(),
                        },
                        RunStatus::Cancelled => StepDisposition::Failure {
                            error: RunError::cancelled(format!(
                                "operation {operation_name} was cancelled"
                            )),
                        },
                        _ => StepDisposition::Failure {
                            error: child.error.unwrap_or_else(|| {
                                RunError::new(format!("operation {operation_name} failed"))
                            }),
                        },
                    };
                }
                Ok(_) => {}
                Err(err) => {
                    // Transient read failures are tolerated; the child's
                    // terminal state is durable and will be seen.
                    warn!(%child_id, "failed to poll child run: {err}");
                }
            }
            tokio::time::sleep(self.config.operation_poll_interval).await;
        }
    }

    fn run_map(
        &self,
        ctx: &WorkflowContext,
        items_key: &str,
        handler: &Arc<StepHandler>,
        probe: &CancelProbe,
    ) -> StepDisposition {
        let Some(items) = ctx.get_param(items_key).and_then(|v| v.as_array()).cloned()
        else {
            return StepDisposition::Failure {
                error: RunError::categorized(
                    format!("map step expects an array param: {items_key}"),
                    ErrorCategory::Validation,
                ),
            };
        };

        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            if probe.is_cancelled() {
                return StepDisposition::Failure {
                    error: RunError::cancelled("map step cancelled"),
                };
            }
            let mut config = JsonMap::new();
            config.insert("item".to_string(), item.clone());
            config.insert("index".to_string(), serde_json::Value::from(index));

            match handler(ctx, &config) {
                StepResult::Ok { output, .. } => {
                    results.push(serde_json::Value::Object(output));
                }
                StepResult::Fail { error } => {
                    return StepDisposition::Failure {
                        error: RunError {
                            message: format!("item {index}: {}", error.message),
                            ..error
                        },
                    };
                }
            }
        }

        let mut output = JsonMap::new();
        output.insert("items".to_string(), serde_json::Value::from(results.len()));
        output.insert("results".to_string(), serde_json::Value::Array(results));
        StepDisposition::Success {
            output,
            context_updates: JsonMap::new(),
        }
    }

    async fn record_skip(
        &self,
        run_id: Uuid,
        step: &Step,
        reason: &str,
        state: &mut RunState,
    ) {
        self.emit(
            run_id,
            RunEvent::StepSkipped {
                step: step.name.clone(),
                reason: reason.to_string(),
            },
        )
        .await;
        state.skipped.push(step.name.clone());
        state.executions.push(StepExecution {
            step_name: step.name.clone(),
            step_type: step.step_type.kind().to_string(),
            status: StepRunStatus::Skipped,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
            attempt: 0,
        });
    }

    /// Ledger appends retry inside the store; a failure here is logged
    /// rather than aborting the workflow mid-step.
    async fn emit(&self, run_id: Uuid, event: RunEvent) {
        if let Err(err) = self.store.append_event(run_id, &event).await {
            warn!(%run_id, event_type = event.event_type(), "failed to append event: {err}");
        }
    }
}
