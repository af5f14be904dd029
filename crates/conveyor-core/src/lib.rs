//! # Conveyor core types
//!
//! Domain model for the Conveyor workflow orchestration engine:
//!
//! - **Runs**: the single unit of observable execution ([`Run`], [`WorkSpec`],
//!   [`RunStatus`]) with idempotency and retry linking
//! - **Events**: the append-only per-run ledger entries ([`RunEvent`])
//! - **Workflows**: registered step definitions ([`Workflow`], [`Step`]) with
//!   sequential and parallel-DAG execution policies
//! - **Context**: per-run mutable outputs and lineage ([`WorkflowContext`])
//! - **Registries**: process-wide handler and workflow lookup
//! - **Readiness**: watermarks, backfill plans, manifests, quality and
//!   anomaly records
//!
//! This crate is pure domain logic. Persistence lives in `conveyor-storage`,
//! execution in `conveyor-engine`, time-based triggering in
//! `conveyor-scheduler`.

pub mod anomaly;
pub mod backfill;
pub mod context;
pub mod dead_letter;
pub mod error;
pub mod event;
pub mod ids;
pub mod lease;
pub mod quality;
pub mod readiness;
pub mod registry;
pub mod run;
pub mod schedule;
pub mod step;
pub mod watermark;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::anomaly::{Anomaly, Severity};
    pub use crate::backfill::{BackfillPlan, BackfillReason, BackfillStatus};
    pub use crate::context::WorkflowContext;
    pub use crate::dead_letter::DeadLetter;
    pub use crate::error::{CoreError, ErrorCategory, RunError};
    pub use crate::event::{EventRecord, RunEvent};
    pub use crate::ids::{new_batch_id, new_run_id};
    pub use crate::lease::{Lease, ScheduleLock};
    pub use crate::quality::{QualityOutcome, QualityRecord, QualityStatus};
    pub use crate::registry::{HandlerRegistry, OperationInvocation, WorkflowRegistry};
    pub use crate::run::{
        DuplicatePolicy, JsonMap, Priority, Run, RunKind, RunStatus, WorkSpec,
    };
    pub use crate::schedule::{Schedule, ScheduleKind, ScheduleRun, ScheduleRunStatus};
    pub use crate::step::{ErrorPolicy, Step, StepResult, StepType};
    pub use crate::watermark::{Watermark, WatermarkGap};
    pub use crate::workflow::{ExecutionMode, ExecutionPolicy, LockPolicy, Workflow};
}

pub use anomaly::{Anomaly, Severity};
pub use backfill::{BackfillPlan, BackfillReason, BackfillStatus};
pub use readiness::{
    CalcDependency, DataReadiness, ExpectedSchedule, ManifestEntry, RejectRecord,
};
pub use context::WorkflowContext;
pub use dead_letter::DeadLetter;
pub use error::{CoreError, ErrorCategory, RunError};
pub use event::{EventRecord, RunEvent};
pub use lease::{Lease, ScheduleLock};
pub use quality::{QualityOutcome, QualityRecord, QualityStatus};
pub use registry::{HandlerRegistry, OperationInvocation, WorkflowRegistry};
pub use run::{DuplicatePolicy, JsonMap, Priority, Run, RunKind, RunStatus, WorkSpec};
pub use schedule::{Schedule, ScheduleKind, ScheduleRun, ScheduleRunStatus};
pub use step::{ErrorPolicy, Step, StepResult, StepType};
pub use watermark::{Watermark, WatermarkGap};
pub use workflow::{ExecutionMode, ExecutionPolicy, LockPolicy, Workflow};
