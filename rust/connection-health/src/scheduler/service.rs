//! Schedule management operations.
//!
//! Owns the rules around `next_run_time` and validates every owner edit
//! before it reaches the store, so an unparsable expression is never
//! persisted.

use chrono::{DateTime, Utc};

use super::{
    Clock, CronExpression, CronParser, CronValidation, RunOutcome, Schedule, ScheduleRun,
    SharedClock, SharedSource, SourceError, TriggerKind,
};
use crate::error::{SchedulerError, SchedulerResult};
use crate::store::{RunCompletion, ScheduleUpsert, SharedStore};

/// Upper bound on run history returned in one call.
pub const MAX_RUN_HISTORY: usize = 500;

/// Schedule CRUD plus run-result recording.
#[derive(Debug, Clone)]
pub struct ScheduleService {
    store: SharedStore,
    source: SharedSource,
    clock: SharedClock,
}

impl ScheduleService {
    pub fn new(store: SharedStore, source: SharedSource, clock: SharedClock) -> Self {
        Self {
            store,
            source,
            clock,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn source(&self) -> &SharedSource {
        &self.source
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Check an expression without saving it.
    pub fn validate_cron(&self, expression: &str) -> CronValidation {
        CronParser::validate(expression, &self.clock.now())
    }

    /// List schedules, optionally scoped to the caller's applications.
    pub async fn list(&self, application_ids: Option<&[String]>) -> SchedulerResult<Vec<Schedule>> {
        Ok(self.store.list(application_ids).await?)
    }

    /// Get a schedule by ID.
    pub async fn get(&self, id: &str) -> SchedulerResult<Schedule> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| SchedulerError::schedule_not_found(id))
    }

    /// Get the application's schedule; `None` if it has none yet.
    pub async fn get_by_application(&self, application_id: &str) -> SchedulerResult<Option<Schedule>> {
        self.ensure_application(application_id).await?;
        Ok(self.store.get_by_application(application_id).await?)
    }

    /// Create or update the application's schedule.
    ///
    /// `next_run_time` is recomputed from now when the expression changes or
    /// the schedule becomes enabled, and cleared when it is disabled.
    pub async fn upsert(
        &self,
        application_id: &str,
        cron_expression: &str,
        is_enabled: bool,
    ) -> SchedulerResult<Schedule> {
        if application_id.trim().is_empty() {
            return Err(SchedulerError::validation(
                "application_id",
                "application reference is required",
            ));
        }
        let cron = CronParser::parse(cron_expression)?;
        self.ensure_application(application_id).await?;

        let now = self.clock.now();
        let existing = self.store.get_by_application(application_id).await?;
        let next_run_time = if !is_enabled {
            None
        } else {
            match existing {
                Some(ref s)
                    if s.is_enabled
                        && s.cron_expression == cron.as_str()
                        && s.next_run_time.is_some() =>
                {
                    s.next_run_time
                }
                _ => cron.next_after(&now),
            }
        };

        let schedule = self
            .store
            .upsert(ScheduleUpsert {
                application_id: application_id.to_string(),
                cron_expression: cron.as_str().to_string(),
                is_enabled,
                next_run_time,
                now,
            })
            .await?;

        tracing::info!(
            schedule_id = %schedule.id,
            application_id = %application_id,
            cron = %schedule.cron_expression,
            enabled = is_enabled,
            created = existing.is_none(),
            "Schedule saved"
        );
        Ok(schedule)
    }

    /// Enable or disable a schedule. Returns `None` if it does not exist.
    pub async fn toggle(&self, id: &str, enabled: bool) -> SchedulerResult<Option<Schedule>> {
        let Some(existing) = self.store.get(id).await? else {
            return Ok(None);
        };

        let now = self.clock.now();
        let next_run_time = match (enabled, existing.is_enabled, existing.next_run_time) {
            (false, _, _) => None,
            (true, true, Some(next)) => Some(next),
            (true, _, _) => parse_stored(&existing)?.next_after(&now),
        };

        let updated = self.store.set_enabled(id, enabled, next_run_time, now).await?;
        if updated.is_some() {
            tracing::info!(schedule_id = %id, enabled, "Schedule toggled");
        }
        Ok(updated)
    }

    /// Delete a schedule and its run history.
    pub async fn delete(&self, id: &str) -> SchedulerResult<bool> {
        let deleted = self.store.delete(id).await?;
        if deleted {
            tracing::info!(schedule_id = %id, "Schedule deleted");
        }
        Ok(deleted)
    }

    /// Run history, most recent first.
    pub async fn runs(&self, id: &str, limit: usize) -> SchedulerResult<Vec<ScheduleRun>> {
        self.get(id).await?;
        Ok(self
            .store
            .list_runs(id, limit.clamp(1, MAX_RUN_HISTORY))
            .await?)
    }

    /// Enabled schedules due at the current clock time.
    pub async fn due(&self) -> SchedulerResult<Vec<Schedule>> {
        Ok(self.store.list_due(self.clock.now()).await?)
    }

    /// Write a finished run back to its schedule.
    ///
    /// Sets the last-run fields, appends history, releases the lease held
    /// by `lease_owner`, and moves `next_run_time` to the first occurrence
    /// after now. Returns `None` when the schedule was deleted mid-run.
    pub async fn record_run_result(
        &self,
        schedule_id: &str,
        trigger: TriggerKind,
        outcome: &RunOutcome,
        started_at: DateTime<Utc>,
        lease_owner: &str,
    ) -> SchedulerResult<Option<ScheduleRun>> {
        let Some(current) = self.store.get(schedule_id).await? else {
            return Ok(None);
        };

        let now = self.clock.now();
        let next_run_time = match parse_stored(&current) {
            Ok(cron) => cron.next_after(&now),
            Err(e) => {
                tracing::warn!(schedule_id, error = %e, "Stored cron expression no longer parses");
                None
            }
        };

        let run = ScheduleRun::from_outcome(schedule_id, trigger, outcome, started_at, now);
        let completion = RunCompletion {
            run: run.clone(),
            cron_expression: current.cron_expression,
            next_run_time,
            lease_owner: lease_owner.to_string(),
        };

        if self.store.record_run(&completion).await? {
            Ok(Some(run))
        } else {
            Ok(None)
        }
    }

    async fn ensure_application(&self, application_id: &str) -> SchedulerResult<()> {
        match self.source.application_exists(application_id).await {
            Ok(true) => Ok(()),
            Ok(false) | Err(SourceError::ApplicationNotFound(_)) => {
                Err(SchedulerError::application_not_found(application_id))
            }
            Err(e) => Err(SchedulerError::Source(e.to_string())),
        }
    }
}

fn parse_stored(schedule: &Schedule) -> SchedulerResult<CronExpression> {
    Ok(CronParser::parse(&schedule.cron_expression)?)
}
