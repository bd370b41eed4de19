//! `SQLite` schedule store.
//!
//! # Thread Safety
//!
//! All operations use `tokio::spawn_blocking` so database work runs on the
//! blocking pool. Each call opens its own connection; WAL mode and a busy
//! timeout let several scheduler processes share one database file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tokio::task;

use super::{LeaseCondition, LeaseOutcome, RunCompletion, ScheduleStore, ScheduleUpsert};
use crate::scheduler::{RunStatus, Schedule, ScheduleRun, TriggerKind};

/// How long a statement waits on a locked database before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEDULE_COLUMNS: &str = "id, application_id, cron_expression, is_enabled, last_run_time, \
     next_run_time, last_run_status, last_run_message, last_run_duration_ms, lease_owner, \
     lease_expires_at, created_at, updated_at";

const RUN_COLUMNS: &str = "id, schedule_id, trigger_kind, status, message, success_count, \
     failure_count, total_connections, duration_ms, started_at, finished_at";

/// Schedule store backed by a `SQLite` file.
#[derive(Debug, Clone)]
pub struct SqliteScheduleStore {
    /// Path to `SQLite` database file.
    db_path: PathBuf,
}

impl SqliteScheduleStore {
    /// Open the store, creating tables as needed.
    pub async fn new<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let store = Self {
            db_path: path.into(),
        };
        store.migrate_schema().await?;
        Ok(store)
    }

    async fn migrate_schema(&self) -> Result<()> {
        self.blocking(|conn| {
            let mode: String = conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .context("Failed to enable WAL mode")?;
            tracing::debug!(journal_mode = %mode, "Opened schedule database");

            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS schedules (
                    id TEXT PRIMARY KEY,
                    application_id TEXT NOT NULL,
                    cron_expression TEXT NOT NULL,
                    is_enabled INTEGER NOT NULL,
                    last_run_time INTEGER,
                    next_run_time INTEGER,
                    last_run_status TEXT,
                    last_run_message TEXT,
                    last_run_duration_ms INTEGER,
                    lease_owner TEXT,
                    lease_expires_at INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_schedules_application
                    ON schedules(application_id);
                CREATE INDEX IF NOT EXISTS idx_schedules_due
                    ON schedules(is_enabled, next_run_time);

                CREATE TABLE IF NOT EXISTS schedule_runs (
                    id TEXT PRIMARY KEY,
                    schedule_id TEXT NOT NULL,
                    trigger_kind TEXT NOT NULL,
                    status TEXT NOT NULL,
                    message TEXT NOT NULL,
                    success_count INTEGER NOT NULL,
                    failure_count INTEGER NOT NULL,
                    total_connections INTEGER NOT NULL,
                    duration_ms INTEGER NOT NULL,
                    started_at INTEGER NOT NULL,
                    finished_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_schedule_runs_schedule
                    ON schedule_runs(schedule_id, finished_at);
                ",
            )
            .context("Failed to create schedule tables")?;
            Ok(())
        })
        .await
    }

    /// Run `f` with a fresh connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || -> Result<T> {
            let mut conn = Connection::open(&db_path)
                .with_context(|| format!("Failed to open database {}", db_path.display()))?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            f(&mut conn)
        })
        .await
        .context("Failed to spawn blocking task")?
    }
}

fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).with_context(|| format!("Timestamp out of range: {ms}"))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

/// Raw column values, converted outside the rusqlite row callback.
struct ScheduleRow {
    id: String,
    application_id: String,
    cron_expression: String,
    is_enabled: bool,
    last_run_time: Option<i64>,
    next_run_time: Option<i64>,
    last_run_status: Option<String>,
    last_run_message: Option<String>,
    last_run_duration_ms: Option<i64>,
    lease_owner: Option<String>,
    lease_expires_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl ScheduleRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            application_id: row.get(1)?,
            cron_expression: row.get(2)?,
            is_enabled: row.get(3)?,
            last_run_time: row.get(4)?,
            next_run_time: row.get(5)?,
            last_run_status: row.get(6)?,
            last_run_message: row.get(7)?,
            last_run_duration_ms: row.get(8)?,
            lease_owner: row.get(9)?,
            lease_expires_at: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_schedule(self) -> Result<Schedule> {
        Ok(Schedule {
            id: self.id,
            application_id: self.application_id,
            cron_expression: self.cron_expression,
            is_enabled: self.is_enabled,
            last_run_time: opt_from_millis(self.last_run_time)?,
            next_run_time: opt_from_millis(self.next_run_time)?,
            last_run_status: self
                .last_run_status
                .as_deref()
                .map(RunStatus::from_str)
                .transpose()?,
            last_run_message: self.last_run_message,
            last_run_duration_ms: self
                .last_run_duration_ms
                .map(|ms| u64::try_from(ms).unwrap_or_default()),
            lease_owner: self.lease_owner,
            lease_expires_at: opt_from_millis(self.lease_expires_at)?,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

struct RunRow {
    id: String,
    schedule_id: String,
    trigger_kind: String,
    status: String,
    message: String,
    success_count: u32,
    failure_count: u32,
    total_connections: u32,
    duration_ms: i64,
    started_at: i64,
    finished_at: i64,
}

impl RunRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            schedule_id: row.get(1)?,
            trigger_kind: row.get(2)?,
            status: row.get(3)?,
            message: row.get(4)?,
            success_count: row.get(5)?,
            failure_count: row.get(6)?,
            total_connections: row.get(7)?,
            duration_ms: row.get(8)?,
            started_at: row.get(9)?,
            finished_at: row.get(10)?,
        })
    }

    fn into_run(self) -> Result<ScheduleRun> {
        Ok(ScheduleRun {
            id: self.id,
            schedule_id: self.schedule_id,
            trigger: TriggerKind::from_str(&self.trigger_kind)?,
            status: RunStatus::from_str(&self.status)?,
            message: self.message,
            success_count: self.success_count,
            failure_count: self.failure_count,
            total_connections: self.total_connections,
            duration_ms: u64::try_from(self.duration_ms).unwrap_or_default(),
            started_at: from_millis(self.started_at)?,
            finished_at: from_millis(self.finished_at)?,
        })
    }
}

fn query_schedule(conn: &Connection, filter: &str, key: &str) -> Result<Option<Schedule>> {
    conn.query_row(
        &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE {filter} = ?1"),
        params![key],
        ScheduleRow::read,
    )
    .optional()
    .context("Failed to query schedule")?
    .map(ScheduleRow::into_schedule)
    .transpose()
}

fn query_schedules(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Schedule>> {
    let mut stmt = conn.prepare(sql).context("Failed to prepare schedule query")?;
    let rows = stmt
        .query_map(params, ScheduleRow::read)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read schedules")?;
    rows.into_iter().map(ScheduleRow::into_schedule).collect()
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn get(&self, id: &str) -> Result<Option<Schedule>> {
        let id = id.to_string();
        self.blocking(move |conn| query_schedule(conn, "id", &id)).await
    }

    async fn get_by_application(&self, application_id: &str) -> Result<Option<Schedule>> {
        let application_id = application_id.to_string();
        self.blocking(move |conn| query_schedule(conn, "application_id", &application_id))
            .await
    }

    async fn list(&self, application_ids: Option<&[String]>) -> Result<Vec<Schedule>> {
        let application_ids = application_ids.map(<[String]>::to_vec);
        self.blocking(move |conn| match application_ids {
            None => query_schedules(
                conn,
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY application_id"),
                params![],
            ),
            Some(ids) if ids.is_empty() => Ok(Vec::new()),
            Some(ids) => {
                let placeholders = vec!["?"; ids.len()].join(", ");
                query_schedules(
                    conn,
                    &format!(
                        "SELECT {SCHEDULE_COLUMNS} FROM schedules \
                         WHERE application_id IN ({placeholders}) ORDER BY application_id"
                    ),
                    params_from_iter(ids.iter()),
                )
            }
        })
        .await
    }

    async fn upsert(&self, upsert: ScheduleUpsert) -> Result<Schedule> {
        self.blocking(move |conn| {
            let now = millis(upsert.now);
            conn.execute(
                r"
                INSERT INTO schedules (id, application_id, cron_expression, is_enabled,
                                       next_run_time, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                ON CONFLICT(application_id) DO UPDATE SET
                    cron_expression = excluded.cron_expression,
                    is_enabled = excluded.is_enabled,
                    next_run_time = excluded.next_run_time,
                    updated_at = excluded.updated_at
                ",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    &upsert.application_id,
                    &upsert.cron_expression,
                    upsert.is_enabled,
                    upsert.next_run_time.map(millis),
                    now,
                ],
            )
            .context("Failed to upsert schedule")?;

            query_schedule(conn, "application_id", &upsert.application_id)?
                .context("Upserted schedule disappeared")
        })
        .await
    }

    async fn set_enabled(
        &self,
        id: &str,
        enabled: bool,
        next_run_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<Schedule>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE schedules SET is_enabled = ?2, next_run_time = ?3, updated_at = ?4 \
                     WHERE id = ?1",
                    params![&id, enabled, next_run_time.map(millis), millis(now)],
                )
                .context("Failed to toggle schedule")?;
            if changed == 0 {
                return Ok(None);
            }
            query_schedule(conn, "id", &id)
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM schedule_runs WHERE schedule_id = ?1", params![&id])
                .context("Failed to delete run history")?;
            let deleted = tx
                .execute("DELETE FROM schedules WHERE id = ?1", params![&id])
                .context("Failed to delete schedule")?;
            tx.commit()?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        self.blocking(move |conn| {
            query_schedules(
                conn,
                &format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules \
                     WHERE is_enabled = 1 AND next_run_time IS NOT NULL AND next_run_time <= ?1 \
                       AND (lease_owner IS NULL OR lease_expires_at <= ?1) \
                     ORDER BY next_run_time"
                ),
                params![millis(now)],
            )
        })
        .await
    }

    async fn try_acquire_lease(
        &self,
        id: &str,
        owner: &str,
        condition: LeaseCondition,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<LeaseOutcome> {
        let id = id.to_string();
        let owner = owner.to_string();
        let expected = condition.expected_next_run().map(millis);
        self.blocking(move |conn| {
            let now = millis(now);
            let tx = conn.transaction()?;

            // ?5 is NULL for manual runs; scheduled runs must still see the
            // occurrence they were selected for.
            let changed = tx
                .execute(
                    r"
                    UPDATE schedules SET lease_owner = ?2, lease_expires_at = ?4
                    WHERE id = ?1
                      AND (lease_owner IS NULL OR lease_expires_at <= ?3)
                      AND (?5 IS NULL
                           OR (is_enabled = 1 AND next_run_time = ?5 AND next_run_time <= ?3))
                    ",
                    params![&id, &owner, now, millis(expires_at), expected],
                )
                .context("Failed to acquire schedule lease")?;

            let outcome = if changed == 1 {
                LeaseOutcome::Acquired
            } else {
                let lease: Option<(Option<String>, Option<i64>)> = tx
                    .query_row(
                        "SELECT lease_owner, lease_expires_at FROM schedules WHERE id = ?1",
                        params![&id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                    .context("Failed to read schedule lease")?;
                match lease {
                    None => LeaseOutcome::Missing,
                    Some((Some(_), Some(expires))) if expires > now => LeaseOutcome::Held,
                    Some(_) => LeaseOutcome::NotDue,
                }
            };

            tx.commit().context("Failed to commit schedule lease")?;
            Ok(outcome)
        })
        .await
    }

    async fn release_lease(&self, id: &str, owner: &str) -> Result<()> {
        let id = id.to_string();
        let owner = owner.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE schedules SET lease_owner = NULL, lease_expires_at = NULL \
                 WHERE id = ?1 AND lease_owner = ?2",
                params![&id, &owner],
            )
            .context("Failed to release schedule lease")?;
            Ok(())
        })
        .await
    }

    async fn record_run(&self, completion: &RunCompletion) -> Result<bool> {
        let completion = completion.clone();
        self.blocking(move |conn| {
            let run = &completion.run;
            let tx = conn.transaction()?;

            // SET expressions all see the pre-update row.
            let changed = tx
                .execute(
                    r"
                    UPDATE schedules SET
                        last_run_time = ?2,
                        last_run_status = ?3,
                        last_run_message = ?4,
                        last_run_duration_ms = ?5,
                        next_run_time = CASE
                            WHEN is_enabled = 0 THEN NULL
                            WHEN cron_expression = ?6 THEN ?7
                            ELSE next_run_time
                        END,
                        lease_owner = CASE WHEN lease_owner = ?8 THEN NULL ELSE lease_owner END,
                        lease_expires_at = CASE WHEN lease_owner = ?8 THEN NULL ELSE lease_expires_at END
                    WHERE id = ?1
                    ",
                    params![
                        &run.schedule_id,
                        millis(run.finished_at),
                        run.status.as_str(),
                        &run.message,
                        i64::try_from(run.duration_ms).unwrap_or(i64::MAX),
                        &completion.cron_expression,
                        completion.next_run_time.map(millis),
                        &completion.lease_owner,
                    ],
                )
                .context("Failed to record run result")?;

            if changed == 0 {
                return Ok(false);
            }

            tx.execute(
                &format!(
                    "INSERT INTO schedule_runs ({RUN_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    &run.id,
                    &run.schedule_id,
                    run.trigger.as_str(),
                    run.status.as_str(),
                    &run.message,
                    run.success_count,
                    run.failure_count,
                    run.total_connections,
                    i64::try_from(run.duration_ms).unwrap_or(i64::MAX),
                    millis(run.started_at),
                    millis(run.finished_at),
                ],
            )
            .context("Failed to insert run history")?;

            tx.commit().context("Failed to commit run result")?;
            Ok(true)
        })
        .await
    }

    async fn list_runs(&self, schedule_id: &str, limit: usize) -> Result<Vec<ScheduleRun>> {
        let schedule_id = schedule_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM schedule_runs WHERE schedule_id = ?1 \
                 ORDER BY finished_at DESC, rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![&schedule_id, limit], RunRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read run history")?;
            rows.into_iter().map(RunRow::into_run).collect()
        })
        .await
    }
}
