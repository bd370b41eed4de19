//! Single execution path shared by scheduled and manual runs.
//!
//! A run takes the schedule lease, loads the application's active
//! connections, tests them concurrently under per-connection and per-run
//! deadlines, aggregates the outcomes and writes them back. Whatever goes
//! wrong inside the run, the result is persisted and the lease released.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::task::AbortOnDropHandle;

use super::{
    ActiveConnection, ConnectionOutcome, RunOutcome, Schedule, ScheduleRun, ScheduleService,
    TriggerKind, aggregate,
};
use crate::error::{SchedulerError, SchedulerResult};
use crate::store::{LeaseCondition, LeaseOutcome};

/// Outcome recorded for a test still in flight when the run deadline passes.
pub const CANCELLED_MESSAGE: &str = "Test cancelled: run timeout exceeded";

/// Tunables for one run.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// Upper bound on a single connection test.
    pub per_connection_timeout: Duration,
    /// Number of connection tests allowed in flight at once.
    pub max_concurrent_tests: usize,
    /// Parent deadline covering the whole run.
    pub run_timeout: Duration,
    /// How long the run lease is held before another executor may take over.
    pub lease_ttl: Duration,
    pub persist_max_attempts: u32,
    pub persist_retry_delay: Duration,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            per_connection_timeout: Duration::from_secs(10),
            max_concurrent_tests: 8,
            run_timeout: Duration::from_secs(300),
            lease_ttl: Duration::from_secs(360),
            persist_max_attempts: 3,
            persist_retry_delay: Duration::from_millis(500),
        }
    }
}

/// A finished run as returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub schedule_id: String,
    pub application_id: String,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

/// Runs schedules. Cheap to clone; clones share the lease owner token.
#[derive(Debug, Clone)]
pub struct ScheduleExecutor {
    service: ScheduleService,
    settings: Arc<ExecutionSettings>,
    owner: Arc<str>,
}

impl ScheduleExecutor {
    pub fn new(service: ScheduleService, settings: ExecutionSettings) -> Self {
        Self {
            service,
            settings: Arc::new(settings),
            owner: Arc::from(uuid::Uuid::new_v4().to_string()),
        }
    }

    pub fn service(&self) -> &ScheduleService {
        &self.service
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Lease owner token of this executor.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Run a schedule immediately, outside its cadence.
    ///
    /// Fails with [`SchedulerError::AlreadyRunning`] if a run of the same
    /// schedule is in progress anywhere.
    pub async fn run_now(&self, schedule_id: &str) -> SchedulerResult<RunReport> {
        let schedule = self.service.get(schedule_id).await?;
        self.execute(&schedule, TriggerKind::Manual).await
    }

    /// Execute one run of `schedule`.
    ///
    /// A scheduled run only starts if the stored schedule is still enabled
    /// and due for the occurrence in `schedule.next_run_time`; otherwise it
    /// fails with [`SchedulerError::NotDue`].
    pub async fn execute(
        &self,
        schedule: &Schedule,
        trigger: TriggerKind,
    ) -> SchedulerResult<RunReport> {
        let store = self.service.store();
        let started_at = self.service.clock().now();
        let lease_ttl = TimeDelta::from_std(self.settings.lease_ttl).context("lease TTL out of range")?;

        let condition = match trigger {
            TriggerKind::Manual => LeaseCondition::Free,
            TriggerKind::Scheduled => match schedule.next_run_time {
                Some(next_run_time) => LeaseCondition::Due { next_run_time },
                None => {
                    return Err(SchedulerError::NotDue {
                        schedule_id: schedule.id.clone(),
                    });
                }
            },
        };

        match store
            .try_acquire_lease(&schedule.id, &self.owner, condition, started_at, started_at + lease_ttl)
            .await?
        {
            LeaseOutcome::Acquired => {}
            LeaseOutcome::Held => {
                tracing::debug!(schedule_id = %schedule.id, %trigger, "Schedule already running");
                return Err(SchedulerError::AlreadyRunning {
                    schedule_id: schedule.id.clone(),
                });
            }
            LeaseOutcome::NotDue => {
                tracing::debug!(schedule_id = %schedule.id, %trigger, "Occurrence already handled");
                return Err(SchedulerError::NotDue {
                    schedule_id: schedule.id.clone(),
                });
            }
            LeaseOutcome::Missing => return Err(SchedulerError::schedule_not_found(&schedule.id)),
        }

        tracing::debug!(
            schedule_id = %schedule.id,
            application_id = %schedule.application_id,
            %trigger,
            "Run started"
        );

        let outcome = self.run(&schedule.application_id, trigger).await;

        let run = match self.persist(&schedule.id, trigger, &outcome, started_at).await {
            Ok(run) => run,
            Err(e) => {
                tracing::error!(
                    schedule_id = %schedule.id,
                    application_id = %schedule.application_id,
                    %trigger,
                    status = %outcome.status,
                    success_count = outcome.success_count,
                    failure_count = outcome.failure_count,
                    total_connections = outcome.total_connections,
                    duration_ms = millis(outcome.duration),
                    summary = %outcome.message,
                    error = %e,
                    "Run result could not be persisted"
                );
                if let Err(release) = store.release_lease(&schedule.id, &self.owner).await {
                    tracing::warn!(schedule_id = %schedule.id, error = %release, "Failed to release lease");
                }
                return Err(e);
            }
        };

        let finished_at = run
            .as_ref()
            .map_or_else(|| self.service.clock().now(), |r| r.finished_at);
        if run.is_none() {
            tracing::info!(schedule_id = %schedule.id, "Schedule deleted during run; result discarded");
        }

        tracing::info!(
            schedule_id = %schedule.id,
            application_id = %schedule.application_id,
            %trigger,
            status = %outcome.status,
            duration_ms = millis(outcome.duration),
            "{}",
            outcome.message
        );

        Ok(RunReport {
            schedule_id: schedule.id.clone(),
            application_id: schedule.application_id.clone(),
            trigger,
            started_at,
            finished_at,
            outcome,
        })
    }

    /// Fetch, test and aggregate. Never fails: source errors become an
    /// `error` outcome.
    async fn run(&self, application_id: &str, trigger: TriggerKind) -> RunOutcome {
        let started = Instant::now();
        let deadline = started + self.settings.run_timeout;

        let fetched = tokio::time::timeout_at(
            deadline,
            self.service.source().active_connections(application_id),
        )
        .await;
        let connections = match fetched {
            Ok(Ok(connections)) => connections,
            Ok(Err(e)) => {
                tracing::warn!(application_id, error = %e, "Failed to load connections");
                return RunOutcome::error(format!("Failed to load connections: {e}"), started.elapsed());
            }
            Err(_) => {
                tracing::warn!(application_id, "Timed out loading connections");
                return RunOutcome::error(
                    "Failed to load connections: run timeout exceeded",
                    started.elapsed(),
                );
            }
        };

        let outcomes = self.test_connections(connections, started, deadline).await;
        aggregate(outcomes, started.elapsed(), trigger.label())
    }

    /// Test connections with at most `max_concurrent_tests` in flight.
    ///
    /// Outcomes come back in enumeration order. Tests still running at
    /// `deadline` are aborted and recorded as cancelled.
    async fn test_connections(
        &self,
        connections: Vec<ActiveConnection>,
        started: Instant,
        deadline: Instant,
    ) -> Vec<ConnectionOutcome> {
        let limit = self.settings.per_connection_timeout;
        let mut slots: Vec<Option<ConnectionOutcome>> = vec![None; connections.len()];

        let mut pending = futures::stream::iter(connections.clone().into_iter().enumerate())
            .map(|(index, connection)| async move { (index, test_connection(connection, limit).await) })
            .buffer_unordered(self.settings.max_concurrent_tests.max(1));

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((index, outcome))) => slots[index] = Some(outcome),
                Ok(None) => break,
                Err(_) => {
                    let abandoned = slots.iter().filter(|s| s.is_none()).count();
                    tracing::warn!(abandoned, "Run timeout exceeded; abandoning in-flight tests");
                    break;
                }
            }
        }
        drop(pending);

        let elapsed = started.elapsed();
        slots
            .into_iter()
            .zip(connections)
            .map(|(slot, connection)| {
                slot.unwrap_or_else(|| {
                    ConnectionOutcome::failure(connection.id, connection.name, CANCELLED_MESSAGE, elapsed)
                })
            })
            .collect()
    }

    /// Write the outcome back, retrying with linear backoff.
    async fn persist(
        &self,
        schedule_id: &str,
        trigger: TriggerKind,
        outcome: &RunOutcome,
        started_at: DateTime<Utc>,
    ) -> SchedulerResult<Option<ScheduleRun>> {
        let attempts = self.settings.persist_max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self
                .service
                .record_run_result(schedule_id, trigger, outcome, started_at, &self.owner)
                .await
            {
                Ok(run) => return Ok(run),
                Err(e) => {
                    tracing::warn!(schedule_id, attempt, max_attempts = attempts, error = %e, "Failed to persist run result");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.persist_retry_delay * attempt).await;
                    }
                }
            }
        }

        Err(SchedulerError::Persistence {
            schedule_id: schedule_id.to_string(),
            attempts,
            message: last_error,
        })
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Test one connection on its own task, bounded by `limit`.
///
/// Errors, panics and timeouts all become failed outcomes.
async fn test_connection(connection: ActiveConnection, limit: Duration) -> ConnectionOutcome {
    let started = Instant::now();
    let tester = Arc::clone(&connection.tester);
    let handle = AbortOnDropHandle::new(tokio::spawn(async move {
        tokio::time::timeout(limit, tester.test()).await
    }));

    let (is_successful, message, response_time) = match handle.await {
        Ok(Ok(Ok(report))) => (report.is_successful, report.message, report.response_time),
        Ok(Ok(Err(e))) => (false, format!("Test failed: {e:#}"), started.elapsed()),
        Ok(Err(_)) => (
            false,
            format!("Test failed: timed out after {}ms", limit.as_millis()),
            limit,
        ),
        Err(e) if e.is_panic() => (false, "Test failed: test panicked".to_string(), started.elapsed()),
        Err(_) => (false, "Test failed: test was cancelled".to_string(), started.elapsed()),
    };

    if !is_successful {
        tracing::warn!(
            connection_id = %connection.id,
            connection_name = %connection.name,
            %message,
            "Connection test failed"
        );
    }

    ConnectionOutcome {
        connection_id: connection.id,
        connection_name: connection.name,
        is_successful,
        message,
        response_time,
    }
}
