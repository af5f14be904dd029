//! Next-run computation
//!
//! Cron boundaries come from the `cron` crate; standard 5-field
//! expressions are normalized to the parser's 6-field form by
//! prepending a seconds field. Evaluation is in UTC — the stored
//! timezone is carried for operators but non-UTC values are rejected at
//! validation.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronExpression;
use tracing::warn;

use conveyor_core::error::CoreError;
use conveyor_core::schedule::{Schedule, ScheduleKind};

/// Parse a cron expression, accepting both 5-field (standard) and
/// 6/7-field (with seconds / year) forms.
pub fn parse_cron(expression: &str) -> Result<CronExpression, CoreError> {
    let field_count = expression.split_whitespace().count();
    let normalized = if field_count == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    CronExpression::from_str(&normalized).map_err(|e| {
        CoreError::ValidationFailed(format!("invalid cron expression {expression}: {e}"))
    })
}

/// First due time strictly after `now`, or `None` when the schedule is
/// exhausted (a date schedule whose time has passed).
pub fn next_run_at(
    schedule: &Schedule,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, CoreError> {
    match schedule.schedule_type {
        ScheduleKind::Cron => {
            let expression = schedule.cron_expression.as_deref().ok_or_else(|| {
                CoreError::ValidationFailed("cron schedule requires cron_expression".to_string())
            })?;
            let parsed = parse_cron(expression)?;
            Ok(parsed.after(&now).next())
        }
        ScheduleKind::Interval => {
            let seconds = schedule.interval_seconds.filter(|s| *s > 0).ok_or_else(|| {
                CoreError::ValidationFailed(
                    "interval schedule requires interval_seconds > 0".to_string(),
                )
            })?;
            Ok(Some(now + Duration::seconds(seconds as i64)))
        }
        ScheduleKind::Date => Ok(schedule.run_at.filter(|at| *at > now)),
    }
}

/// Full validation: structural rules plus a parseable cron expression
/// and a supported timezone.
pub fn validate(schedule: &Schedule) -> Result<(), CoreError> {
    schedule.validate()?;
    if schedule.schedule_type == ScheduleKind::Cron {
        if let Some(expression) = schedule.cron_expression.as_deref() {
            parse_cron(expression)?;
        }
    }
    if schedule.timezone != "UTC" {
        warn!(timezone = %schedule.timezone, "non-UTC schedule timezone");
        return Err(CoreError::ValidationFailed(format!(
            "unsupported schedule timezone: {} (only UTC)",
            schedule.timezone
        )));
    }
    Ok(())
}
