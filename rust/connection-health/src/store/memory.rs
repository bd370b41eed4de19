//! In-memory schedule store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{LeaseCondition, LeaseOutcome, RunCompletion, ScheduleStore, ScheduleUpsert};
use crate::scheduler::{Schedule, ScheduleRun};

#[derive(Debug, Default)]
struct Inner {
    schedules: HashMap<String, Schedule>,
    runs: Vec<ScheduleRun>,
}

/// Process-local store. Leases only exclude runs within this process.
#[derive(Debug, Default)]
pub struct InMemoryScheduleStore {
    inner: RwLock<Inner>,
}

impl InMemoryScheduleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Schedule>> {
        Ok(self.inner.read().await.schedules.get(id).cloned())
    }

    async fn get_by_application(&self, application_id: &str) -> anyhow::Result<Option<Schedule>> {
        let inner = self.inner.read().await;
        Ok(inner
            .schedules
            .values()
            .find(|s| s.application_id == application_id)
            .cloned())
    }

    async fn list(&self, application_ids: Option<&[String]>) -> anyhow::Result<Vec<Schedule>> {
        let inner = self.inner.read().await;
        let mut schedules: Vec<Schedule> = inner
            .schedules
            .values()
            .filter(|s| application_ids.is_none_or(|ids| ids.contains(&s.application_id)))
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.application_id.cmp(&b.application_id));
        Ok(schedules)
    }

    async fn upsert(&self, upsert: ScheduleUpsert) -> anyhow::Result<Schedule> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner
            .schedules
            .values_mut()
            .find(|s| s.application_id == upsert.application_id)
        {
            existing.cron_expression = upsert.cron_expression;
            existing.is_enabled = upsert.is_enabled;
            existing.next_run_time = upsert.next_run_time;
            existing.updated_at = upsert.now;
            return Ok(existing.clone());
        }

        let schedule = Schedule {
            id: uuid::Uuid::new_v4().to_string(),
            application_id: upsert.application_id,
            cron_expression: upsert.cron_expression,
            is_enabled: upsert.is_enabled,
            last_run_time: None,
            next_run_time: upsert.next_run_time,
            last_run_status: None,
            last_run_message: None,
            last_run_duration_ms: None,
            created_at: upsert.now,
            updated_at: upsert.now,
            lease_owner: None,
            lease_expires_at: None,
        };
        inner.schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(schedule)
    }

    async fn set_enabled(
        &self,
        id: &str,
        enabled: bool,
        next_run_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Schedule>> {
        let mut inner = self.inner.write().await;
        Ok(inner.schedules.get_mut(id).map(|s| {
            s.is_enabled = enabled;
            s.next_run_time = next_run_time;
            s.updated_at = now;
            s.clone()
        }))
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let mut inner = self.inner.write().await;
        inner.runs.retain(|r| r.schedule_id != id);
        Ok(inner.schedules.remove(id).is_some())
    }

    async fn list_due(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Schedule>> {
        let inner = self.inner.read().await;
        let mut due: Vec<Schedule> = inner
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_time);
        Ok(due)
    }

    async fn try_acquire_lease(
        &self,
        id: &str,
        owner: &str,
        condition: LeaseCondition,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<LeaseOutcome> {
        let mut inner = self.inner.write().await;
        let Some(schedule) = inner.schedules.get_mut(id) else {
            return Ok(LeaseOutcome::Missing);
        };
        if schedule.is_running(now) {
            return Ok(LeaseOutcome::Held);
        }
        if let Some(expected) = condition.expected_next_run() {
            let still_due = schedule.is_enabled
                && schedule.next_run_time == Some(expected)
                && expected <= now;
            if !still_due {
                return Ok(LeaseOutcome::NotDue);
            }
        }
        schedule.lease_owner = Some(owner.to_string());
        schedule.lease_expires_at = Some(expires_at);
        Ok(LeaseOutcome::Acquired)
    }

    async fn release_lease(&self, id: &str, owner: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(schedule) = inner.schedules.get_mut(id) {
            if schedule.lease_owner.as_deref() == Some(owner) {
                schedule.lease_owner = None;
                schedule.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn record_run(&self, completion: &RunCompletion) -> anyhow::Result<bool> {
        let mut inner = self.inner.write().await;
        let run = &completion.run;
        let Some(schedule) = inner.schedules.get_mut(&run.schedule_id) else {
            return Ok(false);
        };

        schedule.last_run_time = Some(run.finished_at);
        schedule.last_run_status = Some(run.status);
        schedule.last_run_message = Some(run.message.clone());
        schedule.last_run_duration_ms = Some(run.duration_ms);
        if !schedule.is_enabled {
            schedule.next_run_time = None;
        } else if schedule.cron_expression == completion.cron_expression {
            schedule.next_run_time = completion.next_run_time;
        }
        if schedule.lease_owner.as_deref() == Some(completion.lease_owner.as_str()) {
            schedule.lease_owner = None;
            schedule.lease_expires_at = None;
        }

        inner.runs.push(run.clone());
        Ok(true)
    }

    async fn list_runs(&self, schedule_id: &str, limit: usize) -> anyhow::Result<Vec<ScheduleRun>> {
        let inner = self.inner.read().await;
        Ok(inner
            .runs
            .iter()
            .rev()
            .filter(|r| r.schedule_id == schedule_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{RunStatus, TriggerKind};
    use chrono::{TimeDelta, TimeZone};

    fn upsert(app: &str, cron: &str, now: DateTime<Utc>) -> ScheduleUpsert {
        ScheduleUpsert {
            application_id: app.into(),
            cron_expression: cron.into(),
            is_enabled: true,
            next_run_time: Some(now + TimeDelta::hours(1)),
            now,
        }
    }

    #[tokio::test]
    async fn test_one_schedule_per_application() {
        let store = InMemoryScheduleStore::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let first = store.upsert(upsert("app-1", "0 * * * *", now)).await.unwrap();
        let second = store.upsert(upsert("app-1", "*/5 * * * *", now)).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.cron_expression, "*/5 * * * *");
        assert_eq!(store.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_expiry() {
        let store = InMemoryScheduleStore::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let s = store.upsert(upsert("app-1", "0 * * * *", now)).await.unwrap();
        let expiry = now + TimeDelta::minutes(5);

        let free = LeaseCondition::Free;

        assert_eq!(
            store.try_acquire_lease(&s.id, "a", free, now, expiry).await.unwrap(),
            LeaseOutcome::Acquired
        );
        assert_eq!(
            store.try_acquire_lease(&s.id, "b", free, now, expiry).await.unwrap(),
            LeaseOutcome::Held
        );
        assert_eq!(
            store
                .try_acquire_lease(&s.id, "b", free, expiry, expiry + TimeDelta::minutes(5))
                .await
                .unwrap(),
            LeaseOutcome::Acquired
        );

        // Only the holder can release.
        store.release_lease(&s.id, "a").await.unwrap();
        assert_eq!(store.get(&s.id).await.unwrap().unwrap().lease_owner.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_due_lease_requires_the_same_occurrence() {
        let store = InMemoryScheduleStore::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let s = store.upsert(upsert("app-1", "0 * * * *", now)).await.unwrap();
        let occurrence = s.next_run_time.unwrap();
        let due = LeaseCondition::Due { next_run_time: occurrence };
        let expiry = occurrence + TimeDelta::minutes(5);

        // Not yet reached.
        assert_eq!(
            store.try_acquire_lease(&s.id, "a", due, now, expiry).await.unwrap(),
            LeaseOutcome::NotDue
        );

        // Another worker already ran the occurrence and moved the schedule on.
        store
            .record_run(&RunCompletion {
                run: ScheduleRun {
                    id: "run-1".into(),
                    schedule_id: s.id.clone(),
                    trigger: TriggerKind::Scheduled,
                    status: RunStatus::Skipped,
                    message: "No active database connections found".into(),
                    success_count: 0,
                    failure_count: 0,
                    total_connections: 0,
                    duration_ms: 0,
                    started_at: occurrence,
                    finished_at: occurrence,
                },
                cron_expression: "0 * * * *".into(),
                next_run_time: Some(occurrence + TimeDelta::hours(1)),
                lease_owner: "b".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            store.try_acquire_lease(&s.id, "a", due, occurrence, expiry).await.unwrap(),
            LeaseOutcome::NotDue
        );

        assert_eq!(
            store
                .try_acquire_lease("missing", "a", LeaseCondition::Free, now, expiry)
                .await
                .unwrap(),
            LeaseOutcome::Missing
        );
    }

    #[tokio::test]
    async fn test_due_lease_rejects_disabled_schedule() {
        let store = InMemoryScheduleStore::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let s = store.upsert(upsert("app-1", "0 * * * *", now)).await.unwrap();
        let occurrence = s.next_run_time.unwrap();
        store.set_enabled(&s.id, false, None, now).await.unwrap();

        let due = LeaseCondition::Due { next_run_time: occurrence };
        assert_eq!(
            store
                .try_acquire_lease(&s.id, "a", due, occurrence, occurrence + TimeDelta::minutes(5))
                .await
                .unwrap(),
            LeaseOutcome::NotDue
        );
    }
}
