//! Time-based schedules
//!
//! A schedule names a target (task/pipeline/workflow), a trigger (cron,
//! fixed interval, or a one-shot date), and misfire policy. The scheduler
//! crate owns due-time computation; this module holds the data model and
//! structural validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::run::{JsonMap, RunKind};

/// Trigger type. Exactly one of the corresponding fields
/// (`cron_expression`, `interval_seconds`, `run_at`) is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    Interval,
    Date,
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cron => "cron",
            Self::Interval => "interval",
            Self::Date => "date",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(Self::Cron),
            "interval" => Ok(Self::Interval),
            "date" => Ok(Self::Date),
            other => Err(format!("unknown schedule type: {other}")),
        }
    }
}

/// A registered schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: Uuid,
    pub name: String,

    /// Task, pipeline, or workflow
    pub target_kind: RunKind,
    pub target_name: String,

    pub schedule_type: ScheduleKind,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<u64>,
    pub run_at: Option<DateTime<Utc>>,

    /// IANA timezone name for cron evaluation; "UTC" by default
    pub timezone: String,

    /// Params forwarded on every triggered submission
    pub params: JsonMap,

    pub enabled: bool,

    /// Max concurrent triggered instances
    pub max_instances: u32,

    /// How late a due time may fire before it is treated as a misfire
    pub misfire_grace_seconds: u64,

    /// `None` means the schedule is exhausted (date schedules) or not
    /// yet computed
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// New cron schedule with defaults; call `validate` after adjusting.
    pub fn cron(
        name: impl Into<String>,
        target_kind: RunKind,
        target_name: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            schedule_id: crate::ids::new_run_id(),
            name: name.into(),
            target_kind,
            target_name: target_name.into(),
            schedule_type: ScheduleKind::Cron,
            cron_expression: Some(expression.into()),
            interval_seconds: None,
            run_at: None,
            timezone: "UTC".to_string(),
            params: JsonMap::new(),
            enabled: true,
            max_instances: 1,
            misfire_grace_seconds: 300,
            next_run_at: None,
            last_run_at: None,
            last_run_status: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// New fixed-interval schedule.
    pub fn interval(
        name: impl Into<String>,
        target_kind: RunKind,
        target_name: impl Into<String>,
        interval_seconds: u64,
    ) -> Self {
        let mut s = Self::cron(name, target_kind, target_name, "");
        s.schedule_type = ScheduleKind::Interval;
        s.cron_expression = None;
        s.interval_seconds = Some(interval_seconds);
        s
    }

    /// New one-shot schedule firing at `run_at`.
    pub fn once(
        name: impl Into<String>,
        target_kind: RunKind,
        target_name: impl Into<String>,
        run_at: DateTime<Utc>,
    ) -> Self {
        let mut s = Self::cron(name, target_kind, target_name, "");
        s.schedule_type = ScheduleKind::Date;
        s.cron_expression = None;
        s.run_at = Some(run_at);
        s
    }

    pub fn with_params(mut self, params: JsonMap) -> Self {
        self.params = params;
        self
    }

    pub fn with_misfire_grace(mut self, seconds: u64) -> Self {
        self.misfire_grace_seconds = seconds;
        self
    }

    /// Structural validation: the trigger field matching `schedule_type`
    /// must be present and sane, the others absent, and the target kind
    /// must be submittable.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.is_empty() || self.target_name.is_empty() {
            return Err(CoreError::ValidationFailed(
                "schedule name and target_name are required".to_string(),
            ));
        }
        if !matches!(
            self.target_kind,
            RunKind::Task | RunKind::Pipeline | RunKind::Workflow
        ) {
            return Err(CoreError::ValidationFailed(format!(
                "schedule target kind {} is not submittable",
                self.target_kind
            )));
        }
        match self.schedule_type {
            ScheduleKind::Cron => {
                if self.cron_expression.as_deref().unwrap_or("").is_empty() {
                    return Err(CoreError::ValidationFailed(
                        "cron schedule requires cron_expression".to_string(),
                    ));
                }
                if self.interval_seconds.is_some() || self.run_at.is_some() {
                    return Err(CoreError::ValidationFailed(
                        "cron schedule must not set interval_seconds or run_at".to_string(),
                    ));
                }
            }
            ScheduleKind::Interval => {
                match self.interval_seconds {
                    None | Some(0) => {
                        return Err(CoreError::ValidationFailed(
                            "interval schedule requires interval_seconds > 0".to_string(),
                        ));
                    }
                    Some(_) => {}
                }
                if self.cron_expression.is_some() || self.run_at.is_some() {
                    return Err(CoreError::ValidationFailed(
                        "interval schedule must not set cron_expression or run_at".to_string(),
                    ));
                }
            }
            ScheduleKind::Date => {
                if self.run_at.is_none() {
                    return Err(CoreError::ValidationFailed(
                        "date schedule requires run_at".to_string(),
                    ));
                }
                if self.cron_expression.is_some() || self.interval_seconds.is_some() {
                    return Err(CoreError::ValidationFailed(
                        "date schedule must not set cron_expression or interval_seconds"
                            .to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Outcome of a single schedule trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRunStatus {
    /// Submitted to the dispatcher
    Triggered,

    /// Due time was past the misfire grace; skipped and advanced
    Misfired,
}

impl std::fmt::Display for ScheduleRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Triggered => write!(f, "triggered"),
            Self::Misfired => write!(f, "misfired"),
        }
    }
}

impl std::str::FromStr for ScheduleRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "triggered" => Ok(Self::Triggered),
            "misfired" => Ok(Self::Misfired),
            other => Err(format!("unknown schedule run status: {other}")),
        }
    }
}

/// Per-trigger record in `core_schedule_runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: Uuid,
    pub schedule_id: Uuid,

    /// The due time this trigger covered
    pub scheduled_at: DateTime<Utc>,

    /// When the scheduler actually processed it
    pub started_at: DateTime<Utc>,

    /// Submitted run; absent for misfires
    pub run_id: Option<Uuid>,

    pub status: ScheduleRunStatus,
}
