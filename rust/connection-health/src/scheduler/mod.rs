//! Recurring connection-health testing.
//!
//! Each application owns at most one [`Schedule`]. The [`TriggerLoop`]
//! picks up schedules whose next run is due, and [`ScheduleExecutor`]
//! tests every active connection of the application, aggregates the
//! outcomes and writes the result back through [`ScheduleService`].
//! The on-demand "run now" path goes through the same executor.

pub mod aggregate;
pub mod clock;
pub mod cron;
pub mod executor;
pub mod probe;
pub mod service;
pub mod source;
pub mod trigger;

pub use aggregate::{ConnectionOutcome, RunOutcome, RunStatus, aggregate};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use cron::{CronError, CronExpression, CronParser, CronValidation};
pub use executor::{ExecutionSettings, RunReport, ScheduleExecutor};
pub use service::ScheduleService;
pub use source::{
    ActiveConnection, ConnectionSource, ConnectionTester, ProbeReport, SharedSource, SourceError,
    StaticConnectionSource,
};
pub use trigger::TriggerLoop;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-application connection test schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique schedule ID.
    pub id: String,
    /// Application that owns this schedule (unique).
    pub application_id: String,
    /// Cron expression (e.g., "0 * * * *" for hourly).
    pub cron_expression: String,
    /// Whether the trigger loop picks this schedule up.
    pub is_enabled: bool,
    /// When the last run finished.
    pub last_run_time: Option<DateTime<Utc>>,
    /// Next scheduled execution; `None` while disabled.
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub last_run_message: Option<String>,
    pub last_run_duration_ms: Option<u64>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last owner edit.
    pub updated_at: DateTime<Utc>,
    /// Executor currently holding the run lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Whether an unexpired run lease is held at `now`.
    pub fn is_running(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && self.lease_expires_at.is_some_and(|exp| exp > now)
    }

    /// Whether the trigger loop should start a run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_enabled
            && self.next_run_time.is_some_and(|next| next <= now)
            && !self.is_running(now)
    }

    pub fn last_run_duration(&self) -> Option<Duration> {
        self.last_run_duration_ms.map(Duration::from_millis)
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fired by the trigger loop.
    Scheduled,
    /// Requested through "run now".
    Manual,
}

impl TriggerKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }

    /// Prefix of the run summary message.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Scheduled => "Scheduled test",
            Self::Manual => "Manual test",
        }
    }

    #[allow(clippy::should_implement_trait, reason = "Different signature than std::str::FromStr")]
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            _ => anyhow::bail!("Invalid trigger kind: {s}"),
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record of one finished run, kept as history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRun {
    /// Unique run ID.
    pub id: String,
    /// Schedule ID this run belongs to.
    pub schedule_id: String,
    pub trigger: TriggerKind,
    pub status: RunStatus,
    pub message: String,
    pub success_count: u32,
    pub failure_count: u32,
    pub total_connections: u32,
    pub duration_ms: u64,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Completion time.
    pub finished_at: DateTime<Utc>,
}

impl ScheduleRun {
    /// History row for a finished run.
    pub fn from_outcome(
        schedule_id: &str,
        trigger: TriggerKind,
        outcome: &RunOutcome,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            schedule_id: schedule_id.to_string(),
            trigger,
            status: outcome.status,
            message: outcome.message.clone(),
            success_count: count(outcome.success_count),
            failure_count: count(outcome.failure_count),
            total_connections: count(outcome.total_connections),
            duration_ms: u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
            started_at,
            finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn schedule(now: DateTime<Utc>) -> Schedule {
        Schedule {
            id: "s-1".into(),
            application_id: "app-1".into(),
            cron_expression: "0 * * * *".into(),
            is_enabled: true,
            last_run_time: None,
            next_run_time: Some(now),
            last_run_status: None,
            last_run_message: None,
            last_run_duration_ms: None,
            created_at: now,
            updated_at: now,
            lease_owner: None,
            lease_expires_at: None,
        }
    }

    #[test]
    fn test_due_requires_enabled_and_free_lease() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let mut s = schedule(now);
        assert!(s.is_due(now));
        assert!(!s.is_due(now - TimeDelta::seconds(1)));

        s.lease_owner = Some("other".into());
        s.lease_expires_at = Some(now + TimeDelta::minutes(5));
        assert!(!s.is_due(now));
        // An expired lease no longer blocks.
        assert!(s.is_due(now + TimeDelta::minutes(5)));

        s.lease_owner = None;
        s.is_enabled = false;
        assert!(!s.is_due(now));
    }

    #[test]
    fn test_trigger_labels() {
        assert_eq!(TriggerKind::Scheduled.label(), "Scheduled test");
        assert_eq!(TriggerKind::Manual.label(), "Manual test");
        assert_eq!(TriggerKind::from_str("manual").unwrap(), TriggerKind::Manual);
    }
}
