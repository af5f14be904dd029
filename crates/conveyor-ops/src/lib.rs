//! # Conveyor operations facade
//!
//! The API-agnostic function surface every caller (HTTP, CLI, MCP)
//! invokes: typed requests in, a uniform [`OpResult`] envelope out.
//! Process wiring lives in [`App`]; nothing here is a global.
//!
//! ## Example
//!
//! ```ignore
//! use conveyor_ops::{ops, App, Config};
//!
//! let app = App::start(Config::from_env()).await?;
//! app.workflows.register(my_workflow)?;
//!
//! let accepted = ops::run_workflow(&app, RunWorkflowRequest {
//!     name: "otc.weekly".into(),
//!     ..Default::default()
//! }).await;
//! ```

pub mod admin;
pub mod app;
pub mod config;
pub mod dlq;
pub mod envelope;
pub mod locks;
pub mod quality;
pub mod readiness;
pub mod requests;
pub mod responses;
pub mod runs;
pub mod schedules;
pub mod workflows;

pub use app::App;
pub use config::Config;
pub use envelope::{OpError, OpResult, Paging};

/// Flat re-export of every operation function.
pub mod ops {
    pub use crate::admin::{check_database_health, initialize_database, purge_old_data};
    pub use crate::dlq::{get_dead_letter, list_dead_letters, replay_dead_letter};
    pub use crate::locks::{
        list_locks, list_schedule_locks, release_lock, release_schedule_lock,
    };
    pub use crate::quality::{list_anomalies, list_quality_results, resolve_anomaly};
    pub use crate::readiness::{
        advance_watermark, cancel_backfill_plan, check_data_readiness,
        create_backfill_plan, delete_watermark, get_backfill_plan, get_watermark,
        list_backfill_plans, list_calc_dependencies, list_data_readiness,
        list_expected_schedules, list_watermark_gaps, list_watermarks,
        start_backfill_plan,
    };
    pub use crate::runs::{
        cancel_run, get_run, get_run_children, get_run_events, list_runs, retry_run,
        submit_run,
    };
    pub use crate::schedules::{
        create_schedule, delete_schedule, get_schedule, list_schedule_runs,
        list_schedules, update_schedule,
    };
    pub use crate::workflows::{get_workflow, list_workflows, run_workflow};
}
