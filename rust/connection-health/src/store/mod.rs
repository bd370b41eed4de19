//! Durable schedule storage.
//!
//! Provides a trait-based abstraction so the scheduler runs against
//! `SQLite` in production and an in-memory map in tests.
//!
//! The run lease lives on the schedule row itself. Acquiring it is a single
//! conditional write, so two scheduler processes sharing one database can
//! never both start the same schedule.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryScheduleStore;
pub use sqlite::SqliteScheduleStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::scheduler::{Schedule, ScheduleRun};

/// Values written by an owner upsert.
#[derive(Debug, Clone)]
pub struct ScheduleUpsert {
    pub application_id: String,
    pub cron_expression: String,
    pub is_enabled: bool,
    pub next_run_time: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Values written when a run finishes.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub run: ScheduleRun,
    /// Cron expression the next run time was computed from. If the row no
    /// longer carries this expression, a concurrent edit owns `next_run_time`.
    pub cron_expression: String,
    pub next_run_time: Option<DateTime<Utc>>,
    /// Lease holder; the lease is cleared only if still held by this owner.
    pub lease_owner: String,
}

/// Precondition checked in the same write that takes the run lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseCondition {
    /// Only the lease has to be free (manual runs).
    Free,
    /// The schedule must also still be enabled and due for the occurrence
    /// the caller read (scheduled runs).
    Due { next_run_time: DateTime<Utc> },
}

impl LeaseCondition {
    fn expected_next_run(self) -> Option<DateTime<Utc>> {
        match self {
            Self::Free => None,
            Self::Due { next_run_time } => Some(next_run_time),
        }
    }
}

/// Result of a lease attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired,
    /// Another owner holds an unexpired lease.
    Held,
    /// The occurrence was already run, or the schedule was disabled or edited.
    NotDue,
    /// No schedule with this ID.
    Missing,
}

impl LeaseOutcome {
    #[must_use]
    pub const fn is_acquired(self) -> bool {
        matches!(self, Self::Acquired)
    }
}

/// Repository trait for schedules and their run history.
#[async_trait]
pub trait ScheduleStore: Send + Sync + std::fmt::Debug {
    /// Get a schedule by ID.
    async fn get(&self, id: &str) -> anyhow::Result<Option<Schedule>>;

    /// Get the schedule owned by an application.
    async fn get_by_application(&self, application_id: &str) -> anyhow::Result<Option<Schedule>>;

    /// List schedules, optionally restricted to some applications.
    async fn list(&self, application_ids: Option<&[String]>) -> anyhow::Result<Vec<Schedule>>;

    /// Create the application's schedule or update its expression and flag.
    async fn upsert(&self, upsert: ScheduleUpsert) -> anyhow::Result<Schedule>;

    /// Set the enabled flag. Returns `None` if the schedule does not exist.
    async fn set_enabled(
        &self,
        id: &str,
        enabled: bool,
        next_run_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Schedule>>;

    /// Delete a schedule and its history.
    async fn delete(&self, id: &str) -> anyhow::Result<bool>;

    /// Enabled schedules with `next_run_time <= now` and no live lease.
    async fn list_due(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Schedule>>;

    /// Take the run lease if it is free or expired and `condition` holds.
    async fn try_acquire_lease(
        &self,
        id: &str,
        owner: &str,
        condition: LeaseCondition,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<LeaseOutcome>;

    /// Drop the run lease if `owner` holds it.
    async fn release_lease(&self, id: &str, owner: &str) -> anyhow::Result<()>;

    /// Write a finished run. Returns `false` if the schedule was deleted meanwhile.
    async fn record_run(&self, completion: &RunCompletion) -> anyhow::Result<bool>;

    /// Most recent runs first.
    async fn list_runs(&self, schedule_id: &str, limit: usize) -> anyhow::Result<Vec<ScheduleRun>>;
}

/// Shared store handle.
pub type SharedStore = Arc<dyn ScheduleStore>;
