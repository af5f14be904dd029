//! # Conveyor execution engine
//!
//! The run-tracking, step-scheduling kernel:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │  (WorkSpec → durable run + events, idempotency, retry/DLQ)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Executor                             │
//! │  (bounded in-process pool, cancellation tokens)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowRunner                          │
//! │  (sequential / parallel DAG, choice, wait, map, dry-run)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Alongside the kernel: the [`ConcurrencyGuard`] (lease-based locks),
//! the [`DeadLetterQueue`] (capture + replay), the [`BackfillPlanner`],
//! the [`QualityGate`], and the [`AnomalyRecorder`].

pub mod anomaly;
pub mod backfill;
pub mod cancel;
pub mod dispatcher;
pub mod dlq;
pub mod executor;
pub mod guard;
pub mod quality;
pub mod retry;
pub mod runner;

pub use anomaly::AnomalyRecorder;
pub use backfill::BackfillPlanner;
pub use cancel::{CancelProbe, CancellationHub};
pub use dispatcher::{Dispatcher, DispatcherConfig, FailureOutcome};
pub use dlq::DeadLetterQueue;
pub use executor::{Executor, ExecutorConfig};
pub use guard::ConcurrencyGuard;
pub use quality::{QualityCheck, QualityGate};
pub use retry::RetryPolicy;
pub use runner::{
    RunnerConfig, RunnerOptions, StepExecution, StepRunStatus, WorkflowResult,
    WorkflowRunStatus, WorkflowRunner,
};
