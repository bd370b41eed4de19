//! Periodic driver that starts due schedules.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{RunReport, ScheduleExecutor, TriggerKind};
use crate::error::{SchedulerError, SchedulerResult};

/// Ticks on a fixed interval and executes every due schedule on its own task.
///
/// Runs started by the loop are tracked; on shutdown the loop stops ticking
/// and waits for them to record their results.
#[derive(Debug, Clone)]
pub struct TriggerLoop {
    executor: ScheduleExecutor,
    tick_interval: Duration,
    runs: TaskTracker,
}

impl TriggerLoop {
    pub fn new(executor: ScheduleExecutor, tick_interval: Duration) -> Self {
        Self {
            executor,
            tick_interval,
            runs: TaskTracker::new(),
        }
    }

    /// Number of runs started by this loop that have not finished.
    pub fn in_flight(&self) -> usize {
        self.runs.len()
    }

    /// Start runs for every schedule due at the current clock time.
    ///
    /// Returns the spawned run handles. Dropping a handle does not stop the
    /// run; it stays tracked by the loop.
    pub async fn tick(&self) -> SchedulerResult<Vec<JoinHandle<SchedulerResult<RunReport>>>> {
        let due = self.executor.service().due().await?;
        if !due.is_empty() {
            tracing::debug!(count = due.len(), "Due schedules found");
        }

        Ok(due
            .into_iter()
            .map(|schedule| {
                let executor = self.executor.clone();
                self.runs.spawn(async move {
                    let result = executor.execute(&schedule, TriggerKind::Scheduled).await;
                    match &result {
                        Ok(_)
                        | Err(SchedulerError::AlreadyRunning { .. } | SchedulerError::NotDue { .. }) => {}
                        Err(e) => {
                            tracing::error!(schedule_id = %schedule.id, error = %e, "Scheduled run failed");
                        }
                    }
                    result
                })
            })
            .collect())
    }

    /// Tick until `shutdown` is cancelled, then drain in-flight runs.
    ///
    /// Draining is bounded by the lease TTL.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            tick_interval_secs = self.tick_interval.as_secs(),
            "Schedule trigger loop started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Failed to poll due schedules");
                    }
                }
            }
        }

        self.runs.close();
        let in_flight = self.runs.len();
        if in_flight > 0 {
            tracing::info!(in_flight, "Waiting for in-flight runs to finish");
            let drain = self.executor.settings().lease_ttl;
            if tokio::time::timeout(drain, self.runs.wait()).await.is_err() {
                tracing::warn!(
                    abandoned = self.runs.len(),
                    "In-flight runs did not finish before shutdown"
                );
            }
        }

        tracing::info!("Schedule trigger loop stopped");
    }

    /// Run the loop on a background task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};

    use super::*;
    use crate::scheduler::{
        ActiveConnection, ConnectionTester, ExecutionSettings, ManualClock, ProbeReport, RunStatus,
        ScheduleService, StaticConnectionSource,
    };
    use crate::store::{InMemoryScheduleStore, LeaseCondition, ScheduleStore};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    async fn setup() -> (TriggerLoop, ManualClock, Arc<InMemoryScheduleStore>, ScheduleService) {
        let clock = ManualClock::new(at(0, 30));
        let store = Arc::new(InMemoryScheduleStore::new());
        let source = StaticConnectionSource::new();
        source.add_application("app-1").await;
        source.add_application("app-2").await;
        let service = ScheduleService::new(
            Arc::clone(&store) as _,
            Arc::new(source),
            Arc::new(clock.clone()),
        );
        let executor = ScheduleExecutor::new(service.clone(), ExecutionSettings::default());
        (
            TriggerLoop::new(executor, Duration::from_secs(60)),
            clock,
            store,
            service,
        )
    }

    #[tokio::test]
    async fn test_tick_runs_only_due_schedules() {
        let (trigger, clock, store, service) = setup().await;
        let hourly = service.upsert("app-1", "0 * * * *", true).await.unwrap();
        let daily = service.upsert("app-2", "0 0 * * *", true).await.unwrap();

        assert!(trigger.tick().await.unwrap().is_empty());

        clock.set(at(1, 0));
        let handles = trigger.tick().await.unwrap();
        assert_eq!(handles.len(), 1);
        for handle in handles {
            let report = handle.await.unwrap().unwrap();
            assert_eq!(report.schedule_id, hourly.id);
            assert_eq!(report.outcome.status, RunStatus::Skipped);
        }

        let after = store.get(&hourly.id).await.unwrap().unwrap();
        assert_eq!(after.next_run_time, Some(at(2, 0)));
        assert!(store.list_runs(&daily.id, 10).await.unwrap().is_empty());

        // Same instant again: already advanced, nothing to do.
        assert!(trigger.tick().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tick_skips_disabled_and_leased() {
        let (trigger, clock, store, service) = setup().await;
        let first = service.upsert("app-1", "0 * * * *", true).await.unwrap();
        let second = service.upsert("app-2", "0 * * * *", true).await.unwrap();
        service.toggle(&first.id, false).await.unwrap();
        store
            .try_acquire_lease(&second.id, "elsewhere", LeaseCondition::Free, at(1, 0), at(1, 6))
            .await
            .unwrap();

        clock.set(at(1, 0));
        assert!(trigger.tick().await.unwrap().is_empty());

        // Expired lease is taken over.
        clock.set(at(1, 6));
        let handles = trigger.tick().await.unwrap();
        assert_eq!(handles.len(), 1);
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().schedule_id, second.id);
        }
    }

    #[tokio::test]
    async fn test_missed_occurrences_collapse_into_one_run() {
        let (trigger, clock, store, service) = setup().await;
        let s = service.upsert("app-1", "*/5 * * * *", true).await.unwrap();

        clock.advance(TimeDelta::hours(3));
        for handle in trigger.tick().await.unwrap() {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.list_runs(&s.id, 100).await.unwrap().len(), 1);
        assert_eq!(
            store.get(&s.id).await.unwrap().unwrap().next_run_time,
            Some(at(3, 35))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_cancel() {
        let (trigger, _clock, _store, _service) = setup().await;
        let shutdown = CancellationToken::new();
        let handle = trigger.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(180)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[derive(Debug)]
    struct SlowTester(Duration);

    #[async_trait]
    impl ConnectionTester for SlowTester {
        async fn test(&self) -> anyhow::Result<ProbeReport> {
            tokio::time::sleep(self.0).await;
            Ok(ProbeReport {
                is_successful: true,
                message: "Connected".into(),
                response_time: self.0,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_run() {
        let clock = ManualClock::new(at(0, 30));
        let store = Arc::new(InMemoryScheduleStore::new());
        let source = StaticConnectionSource::new();
        source
            .add_connection(
                "app-1",
                ActiveConnection {
                    id: "db".into(),
                    name: "Primary".into(),
                    tester: Arc::new(SlowTester(Duration::from_secs(30))),
                },
                true,
            )
            .await;
        let service = ScheduleService::new(
            Arc::clone(&store) as _,
            Arc::new(source),
            Arc::new(clock.clone()),
        );
        let s = service.upsert("app-1", "0 * * * *", true).await.unwrap();
        clock.set(at(1, 0));

        let trigger = TriggerLoop::new(
            ScheduleExecutor::new(service, ExecutionSettings::default()),
            Duration::from_secs(60),
        );
        let shutdown = CancellationToken::new();
        let handle = trigger.clone().spawn(shutdown.clone());

        // First tick fires immediately and starts the 30s run.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(trigger.in_flight(), 1);
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(trigger.in_flight(), 0);
        let runs = store.list_runs(&s.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        let after = store.get(&s.id).await.unwrap().unwrap();
        assert!(after.lease_owner.is_none());
        assert_eq!(after.next_run_time, Some(at(2, 0)));
    }
}
