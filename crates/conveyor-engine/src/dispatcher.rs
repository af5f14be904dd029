//! Dispatcher: durable submissions
//!
//! Translates a [`WorkSpec`] into a durable run plus ledger events,
//! enforces idempotency-key semantics, hands the run to the executor
//! queue, and owns the terminal-failure policy (automatic retry with
//! backoff, dead-lettering, replay).
//!
//! Ordering guarantee: a caller that observes a returned run ID is
//! guaranteed the `created` event is durable before any step executes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use conveyor_core::dead_letter::DeadLetter;
use conveyor_core::error::{CoreError, RunError};
use conveyor_core::event::{EventRecord, RunEvent};
use conveyor_core::ids::new_run_id;
use conveyor_core::run::{
    DuplicatePolicy, JsonMap, Run, RunKind, RunStatus, WorkSpec,
};
use conveyor_storage::{CoreStore, Page, Pagination, RunFilter};

use crate::cancel::CancellationHub;
use crate::retry::RetryPolicy;

/// What happened to a run that failed terminally.
#[derive(Debug, Clone)]
pub enum FailureOutcome {
    /// A retry-linked run was created and will be queued after `delay`
    WillRetry { run_id: Uuid, delay: Duration },

    /// The failure was captured in the dead-letter queue
    DeadLettered(Uuid),
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Lane assigned to specs that leave theirs empty
    pub default_lane: String,

    pub retry_policy: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_lane: "default".to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Turns work submissions into durable runs.
pub struct Dispatcher {
    store: Arc<dyn CoreStore>,
    queue: mpsc::UnboundedSender<Uuid>,
    cancels: Arc<CancellationHub>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn CoreStore>,
        queue: mpsc::UnboundedSender<Uuid>,
        cancels: Arc<CancellationHub>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            queue,
            cancels,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn CoreStore> {
        &self.store
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit work. Idempotent when the spec carries an idempotency key:
    /// a live or completed run with the same key is returned as-is; a
    /// failed or cancelled one is retried or returned per the spec's
    /// duplicate policy.
    #[instrument(skip(self, spec), fields(kind = %spec.kind, name = %spec.name))]
    pub async fn submit(&self, spec: WorkSpec) -> Result<Uuid, CoreError> {
        if spec.name.is_empty() {
            return Err(CoreError::ValidationFailed(
                "work spec name must not be empty".to_string(),
            ));
        }
        if spec.kind == RunKind::Step {
            return Err(CoreError::ValidationFailed(
                "step runs are created by the workflow runner, not submitted".to_string(),
            ));
        }

        let mut retry_of = None;
        let mut attempt = 1;
        if let Some(key) = &spec.idempotency_key {
            if let Some(existing) = self.store.find_run_by_idempotency_key(key).await? {
                match existing.status {
                    RunStatus::Pending
                    | RunStatus::Queued
                    | RunStatus::Running
                    | RunStatus::Completed => {
                        info!(run_id = %existing.run_id, "idempotency key hit, returning existing run");
                        return Ok(existing.run_id);
                    }
                    RunStatus::Failed | RunStatus::Cancelled | RunStatus::DeadLettered => {
                        match spec.on_terminal_duplicate {
                            DuplicatePolicy::ReturnExisting => {
                                return Ok(existing.run_id);
                            }
                            DuplicatePolicy::NewAttempt => {
                                retry_of = Some(existing.run_id);
                                attempt = existing.attempt + 1;
                            }
                        }
                    }
                }
            }
        }

        let run = self.build_run(&spec, retry_of, attempt, None);
        self.persist_and_queue(run).await
    }

    /// Manual retry of a terminal run. Creates a new run linked via
    /// `retry_of_run_id` with an incremented attempt counter.
    #[instrument(skip(self))]
    pub async fn retry(&self, run_id: Uuid) -> Result<Uuid, CoreError> {
        let original = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::not_found("run", run_id.to_string()))?;
        if !original.status.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "run {run_id} is {} and cannot be retried",
                original.status
            )));
        }

        let spec = self.spec_from_run(&original);
        let run = self.build_run(&spec, Some(original.run_id), original.attempt + 1, Some("retry"));
        self.persist_and_queue(run).await
    }

    /// Replay a dead-letter entry: resubmit its params as a new run
    /// linked to the origin, and record the replay on the entry. The
    /// entry itself is never deleted.
    #[instrument(skip(self))]
    pub async fn replay_dead_letter(&self, dlq_id: Uuid) -> Result<Uuid, CoreError> {
        let entry = self
            .store
            .get_dead_letter(dlq_id)
            .await?
            .ok_or_else(|| CoreError::not_found("dead_letter", dlq_id.to_string()))?;

        let mut spec = WorkSpec::new(entry.kind, entry.name.clone())
            .with_params(entry.params.clone())
            .with_max_retries(entry.max_retries);
        spec.metadata.insert(
            "dead_letter_id".to_string(),
            serde_json::Value::String(entry.id.to_string()),
        );

        let run = self.build_run(
            &spec,
            Some(entry.origin_run_id),
            entry.retry_count + 1,
            Some("dlq_replay"),
        );
        let new_run_id = self.persist_and_queue(run).await?;

        self.store
            .mark_dead_letter_replayed(dlq_id, new_run_id, Utc::now())
            .await?;
        info!(%dlq_id, %new_run_id, "dead letter replayed");
        Ok(new_run_id)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, run_id: Uuid) -> Result<Option<Run>, CoreError> {
        Ok(self.store.get_run(run_id).await?)
    }

    pub async fn list(
        &self,
        filter: &RunFilter,
        page: Pagination,
    ) -> Result<Page<Run>, CoreError> {
        Ok(self.store.list_runs(filter, page).await?)
    }

    pub async fn get_children(&self, parent_run_id: Uuid) -> Result<Vec<Run>, CoreError> {
        Ok(self.store.list_child_runs(parent_run_id).await?)
    }

    pub async fn get_events(
        &self,
        run_id: Uuid,
        after_event_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<EventRecord>, CoreError> {
        Ok(self.store.list_events(run_id, after_event_id, limit).await?)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Cancel a run. Terminal runs are a successful no-op. Live runs
    /// transition to `cancelled`, get a `cancelled` event, and have
    /// their cancellation token signalled.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: Uuid, reason: &str) -> Result<Run, CoreError> {
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::not_found("run", run_id.to_string()))?;

        if run.status.is_terminal() {
            return Ok(run);
        }

        run.status = RunStatus::Cancelled;
        run.finished_at = Some(Utc::now());
        self.store.update_run(&run).await?;
        self.store
            .append_event(
                run_id,
                &RunEvent::Cancelled {
                    reason: reason.to_string(),
                },
            )
            .await?;
        self.cancels.signal(run_id);
        info!(%run_id, %reason, "run cancelled");
        Ok(run)
    }

    /// Record successful completion. A concurrent cancellation wins: if
    /// the run is already terminal the completion is dropped.
    #[instrument(skip(self, result))]
    pub async fn complete_run(
        &self,
        run_id: Uuid,
        result: JsonMap,
    ) -> Result<(), CoreError> {
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::not_found("run", run_id.to_string()))?;
        if run.status.is_terminal() {
            return Ok(());
        }

        run.status = RunStatus::Completed;
        run.finished_at = Some(Utc::now());
        run.result = Some(result.clone());
        self.store.update_run(&run).await?;
        self.store
            .append_event(run_id, &RunEvent::Completed { result })
            .await?;
        Ok(())
    }

    /// Record a terminal failure and apply the retry/DLQ policy:
    /// retryable failures within the retry budget spawn a delayed
    /// retry-linked run; everything else is dead-lettered.
    #[instrument(skip(self, error))]
    pub async fn fail_run(
        &self,
        run_id: Uuid,
        error: RunError,
    ) -> Result<FailureOutcome, CoreError> {
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::not_found("run", run_id.to_string()))?;
        if run.status.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "run {run_id} is already {}",
                run.status
            )));
        }

        run.status = RunStatus::Failed;
        run.finished_at = Some(Utc::now());
        run.error = Some(error.clone());
        self.store.update_run(&run).await?;
        self.store
            .append_event(run_id, &RunEvent::failed(&error))
            .await?;

        if error.retryable && run.attempt <= run.max_retries {
            let next_attempt = run.attempt + 1;
            let delay = self
                .config
                .retry_policy
                .delay_for_attempt(run.retry_delay_seconds, next_attempt);

            let spec = self.spec_from_run(&run);
            let retry_run =
                self.build_run(&spec, Some(run.run_id), next_attempt, Some("auto_retry"));
            let retry_run_id = retry_run.run_id;
            self.persist_pending(&retry_run).await?;
            self.queue_after(retry_run_id, delay);

            info!(%run_id, %retry_run_id, ?delay, "scheduled retry");
            Ok(FailureOutcome::WillRetry {
                run_id: retry_run_id,
                delay,
            })
        } else {
            let entry = DeadLetter::from_run(&run, Utc::now());
            self.store.insert_dead_letter(&entry).await?;
            self.store
                .append_event(
                    run_id,
                    &RunEvent::DeadLettered {
                        dead_letter_id: entry.id,
                    },
                )
                .await?;
            run.status = RunStatus::DeadLettered;
            self.store.update_run(&run).await?;

            warn!(%run_id, dlq_id = %entry.id, "run dead-lettered");
            Ok(FailureOutcome::DeadLettered(entry.id))
        }
    }

    /// Append a progress event (heartbeat) for a live run.
    pub async fn progress(
        &self,
        run_id: Uuid,
        message: &str,
        data: JsonMap,
    ) -> Result<(), CoreError> {
        self.store
            .append_event(
                run_id,
                &RunEvent::Progress {
                    message: message.to_string(),
                    data,
                },
            )
            .await?;
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn build_run(
        &self,
        spec: &WorkSpec,
        retry_of: Option<Uuid>,
        attempt: u32,
        trigger_source: Option<&str>,
    ) -> Run {
        let lane = if spec.lane.is_empty() {
            self.config.default_lane.clone()
        } else {
            spec.lane.clone()
        };
        let mut metadata = spec.metadata.clone();
        if let Some(source) = trigger_source {
            metadata.insert(
                "trigger_source".to_string(),
                serde_json::Value::String(source.to_string()),
            );
        }
        Run {
            run_id: new_run_id(),
            kind: spec.kind,
            name: spec.name.clone(),
            params: spec.params.clone(),
            status: RunStatus::Pending,
            lane,
            priority: spec.priority,
            parent_run_id: spec.parent_run_id,
            correlation_id: spec.correlation_id.clone(),
            batch_id: spec.batch_id.clone(),
            idempotency_key: spec.idempotency_key.clone(),
            retry_of_run_id: retry_of,
            attempt,
            max_retries: spec.max_retries,
            retry_delay_seconds: spec.retry_delay_seconds,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            metadata,
        }
    }

    fn spec_from_run(&self, run: &Run) -> WorkSpec {
        let mut spec = WorkSpec::new(run.kind, run.name.clone())
            .with_params(run.params.clone())
            .with_lane(run.lane.clone())
            .with_priority(run.priority)
            .with_max_retries(run.max_retries)
            .with_retry_delay(run.retry_delay_seconds)
            .with_metadata(run.metadata.clone());
        spec.idempotency_key = run.idempotency_key.clone();
        spec.parent_run_id = run.parent_run_id;
        spec.correlation_id = run.correlation_id.clone();
        spec.batch_id = run.batch_id.clone();
        spec
    }

    /// Insert the run row and its `created` event.
    async fn persist_pending(&self, run: &Run) -> Result<(), CoreError> {
        self.store.insert_run(run).await?;
        self.store
            .append_event(
                run.run_id,
                &RunEvent::Created {
                    kind: run.kind.to_string(),
                    name: run.name.clone(),
                },
            )
            .await?;
        Ok(())
    }

    /// Full submission path: persist, mark queued, hand to the executor.
    async fn persist_and_queue(&self, run: Run) -> Result<Uuid, CoreError> {
        let run_id = run.run_id;
        match self.persist_pending(&run).await {
            Ok(()) => {}
            Err(CoreError::Conflict(_)) if run.idempotency_key.is_some() => {
                // Lost an idempotency race; the winner's run is the answer.
                let key = run.idempotency_key.as_deref().unwrap_or_default();
                if let Some(existing) = self.store.find_run_by_idempotency_key(key).await? {
                    return Ok(existing.run_id);
                }
                return Err(CoreError::Conflict(format!(
                    "idempotency conflict on key {key}"
                )));
            }
            Err(err) => return Err(err),
        }

        let mut queued = run;
        queued.status = RunStatus::Queued;
        self.store.update_run(&queued).await?;
        self.store
            .append_event(
                run_id,
                &RunEvent::Queued {
                    lane: queued.lane.clone(),
                },
            )
            .await?;

        self.queue.send(run_id).map_err(|_| {
            CoreError::RuntimeUnavailable("executor queue is closed".to_string())
        })?;
        Ok(run_id)
    }

    /// Queue a pending run after a delay (retry backoff).
    fn queue_after(&self, run_id: Uuid, delay: Duration) {
        let store = Arc::clone(&self.store);
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match store.get_run(run_id).await {
                Ok(Some(mut run)) if run.status == RunStatus::Pending => {
                    run.status = RunStatus::Queued;
                    if store.update_run(&run).await.is_err() {
                        return;
                    }
                    let _ = store
                        .append_event(
                            run_id,
                            &RunEvent::Queued {
                                lane: run.lane.clone(),
                            },
                        )
                        .await;
                    if queue.send(run_id).is_err() {
                        warn!(%run_id, "executor queue closed before retry could start");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(%run_id, "failed to queue retry: {err}"),
            }
        });
    }
}
