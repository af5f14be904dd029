//! # Conveyor scheduler
//!
//! Time-based triggering for registered schedules. Due-time computation
//! ([`compute`]) is pure; the periodic [`Scheduler`] tick turns due
//! schedules into dispatcher submissions under per-schedule leases, with
//! misfire handling for downtime catch-up.

pub mod compute;
pub mod tick;

pub use compute::{next_run_at, parse_cron, validate};
pub use tick::{Scheduler, SchedulerConfig, TickSummary};
