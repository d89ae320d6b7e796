use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{QueueError, Result};
use crate::types::{Job, JobFilter, JobState, Stats};

/// Transactional, thread-safe backing for jobs and configuration. Every
/// worker process in the pool opens its own `Store` against the same
/// database file; cross-process mutual exclusion on writes is provided by
/// SQLite's own file locking (WAL journal mode, a generous busy timeout) plus
/// this type's use of exclusive (not deferred) transactions for every write.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              TEXT PRIMARY KEY,
    command         TEXT NOT NULL,
    state           TEXT NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL DEFAULT 3,
    priority        INTEGER NOT NULL DEFAULT 0,
    timeout_seconds INTEGER NOT NULL DEFAULT 300,
    run_at          TEXT,
    next_retry_at   TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT,
    error_message   TEXT,
    output          TEXT,
    execution_time  REAL
);

CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (state, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_retry ON jobs (state, next_retry_at);

CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workers (
    id              TEXT PRIMARY KEY,
    pid             INTEGER NOT NULL,
    status          TEXT NOT NULL,
    started_at      TEXT NOT NULL,
    current_job_id  TEXT
);

CREATE TABLE IF NOT EXISTS metrics (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   TEXT NOT NULL,
    metric_type TEXT NOT NULL,
    value       REAL,
    metadata    TEXT
);
"#;

impl Store {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub async fn insert_job(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            r#"
INSERT INTO jobs (
    id, command, state, attempts, max_retries, priority, timeout_seconds,
    run_at, next_retry_at, created_at, updated_at, started_at, completed_at,
    error_message, output, execution_time
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(job.attempts)
        .bind(job.max_retries)
        .bind(job.priority)
        .bind(job.timeout_seconds)
        .bind(job.run_at)
        .bind(job.next_retry_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .bind(&job.output)
        .bind(job.execution_time)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(QueueError::DuplicateId(job.id.clone()))
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Overwrites every mutable field for `job.id`. Fails with
    /// `QueueError::UnknownJobId` if no row matched.
    pub async fn update_job(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            r#"
UPDATE jobs SET
    command = ?, state = ?, attempts = ?, max_retries = ?, priority = ?,
    timeout_seconds = ?, run_at = ?, next_retry_at = ?, updated_at = ?,
    started_at = ?, completed_at = ?, error_message = ?, output = ?,
    execution_time = ?
WHERE id = ?
            "#,
        )
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(job.attempts)
        .bind(job.max_retries)
        .bind(job.priority)
        .bind(job.timeout_seconds)
        .bind(job.run_at)
        .bind(job.next_retry_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .bind(&job.output)
        .bind(job.execution_time)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownJobId(job.id.clone()));
        }
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut sql = String::from("SELECT * FROM jobs WHERE 1 = 1");
        if filter.state.is_some() {
            sql.push_str(" AND state = ?");
        }
        if filter.priority.is_some() {
            sql.push_str(" AND priority = ?");
        }
        sql.push_str(" ORDER BY priority DESC, created_at DESC");

        let mut query = sqlx::query(&sql);
        if let Some(state) = filter.state {
            query = query.bind(state.as_str().to_string());
        }
        if let Some(priority) = filter.priority {
            query = query.bind(priority);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_job).collect()
    }

    /// The atomic claim step: an exclusive write transaction wrapping the
    /// filtered ordered SELECT and
    /// the UPDATE that transitions the winning row to `processing`. Two
    /// concurrent callers against the same database file can never observe
    /// the same row here, because SQLite serializes `BEGIN IMMEDIATE`
    /// transactions against each other at the file level.
    pub async fn claim_one(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await?;

        let claimed = async {
            let row = sqlx::query(
                r#"
SELECT * FROM jobs
WHERE state IN ('pending', 'failed')
  AND (next_retry_at IS NULL OR next_retry_at <= ?)
  AND (run_at IS NULL OR run_at <= ?)
ORDER BY priority DESC, created_at ASC, id ASC
LIMIT 1
                "#,
            )
            .bind(now)
            .bind(now)
            .fetch_optional(&mut *conn)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            let mut job = row_to_job(row)?;
            job.mark_processing(now);

            sqlx::query(
                "UPDATE jobs SET state = ?, started_at = ?, updated_at = ? WHERE id = ?",
            )
            .bind(job.state.as_str())
            .bind(job.started_at)
            .bind(job.updated_at)
            .bind(&job.id)
            .execute(&mut *conn)
            .await?;

            Ok(Some(job))
        }
        .await;

        match claimed {
            Ok(job) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(job)
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err)
            }
        }
    }

    pub async fn count_by_state(&self) -> Result<Stats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = Stats::default();
        for (state, count) in rows {
            match state.parse::<JobState>() {
                Ok(JobState::Pending) => stats.pending = count,
                Ok(JobState::Processing) => stats.processing = count,
                Ok(JobState::Completed) => stats.completed = count,
                Ok(JobState::Failed) => stats.failed = count,
                Ok(JobState::Dead) => stats.dead = count,
                Err(_) => {}
            }
        }
        Ok(stats)
    }

    /// Returns `(avg_execution_time, completed_count, total_count, priority_dist)`.
    /// `jobs_last_24h` is fetched separately via [`Store::jobs_last_24h`]
    /// since `QueueManager::metrics` needs it on its own cadence too.
    pub async fn aggregate_metrics(&self) -> Result<(f64, i64, i64, Vec<(i64, i64)>)> {
        let avg_execution_time: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(execution_time) FROM jobs WHERE state = 'completed'",
        )
        .fetch_one(&self.pool)
        .await?;

        let completed: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = 'completed'")
                .fetch_one(&self.pool)
                .await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;

        let priority_dist: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT priority, COUNT(*) FROM jobs GROUP BY priority",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok((avg_execution_time.unwrap_or(0.0), completed, total, priority_dist))
    }

    pub async fn jobs_last_24h(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE created_at > datetime('now', '-1 day')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn record_metric(
        &self,
        metric_type: &str,
        value: Option<f64>,
        metadata: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO metrics (timestamp, metric_type, value, metadata) VALUES (?, ?, ?, ?)",
        )
        .bind(now)
        .bind(metric_type)
        .bind(value)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Jobs stuck in `processing` whose `started_at + timeout + grace` has
    /// elapsed - candidates for the reaper's orphan reclamation pass.
    pub async fn find_orphaned(&self, now: DateTime<Utc>, grace_seconds: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
SELECT * FROM jobs
WHERE state = 'processing'
  AND started_at IS NOT NULL
  AND datetime(started_at, '+' || (timeout_seconds + ?) || ' seconds') <= ?
            "#,
        )
        .bind(grace_seconds)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    pub async fn upsert_worker(
        &self,
        id: &str,
        pid: i64,
        status: &str,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO workers (id, pid, status, started_at, current_job_id)
VALUES (?, ?, ?, ?, NULL)
ON CONFLICT(id) DO UPDATE SET pid = excluded.pid, status = excluded.status
            "#,
        )
        .bind(id)
        .bind(pid)
        .bind(status)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_worker_status(
        &self,
        id: &str,
        status: &str,
        current_job_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE workers SET status = ?, current_job_id = ? WHERE id = ?")
            .bind(status)
            .bind(current_job_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_job(row: SqliteRow) -> Result<Job> {
    let state: String = row.try_get("state")?;
    let state = state
        .parse::<JobState>()
        .map_err(QueueError::InvalidJob)?;

    Ok(Job {
        id: row.try_get("id")?,
        command: row.try_get("command")?,
        state,
        attempts: row.try_get("attempts")?,
        max_retries: row.try_get("max_retries")?,
        priority: row.try_get("priority")?,
        timeout_seconds: row.try_get("timeout_seconds")?,
        run_at: row.try_get("run_at")?,
        next_retry_at: row.try_get("next_retry_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error_message: row.try_get("error_message")?,
        output: row.try_get("output")?,
        execution_time: row.try_get("execution_time")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewJob;

    /// A plain `:memory:` database is per-connection: if the pool opened more
    /// than one connection, an insert on one and a get on another would
    /// silently see two different empty databases. Pinning the pool to a
    /// single connection keeps every call in a test on the same database.
    async fn test_store() -> Store {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        Store::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = test_store().await;
        let now = Utc::now();
        let job = Job::new(NewJob::from_command("echo hi"), now);
        store.insert_job(&job).await.unwrap();

        let fetched = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched, job);
    }

    #[tokio::test]
    async fn insert_duplicate_id_is_rejected() {
        let store = test_store().await;
        let now = Utc::now();
        let job = Job::new(NewJob::from_command("echo hi"), now);
        store.insert_job(&job).await.unwrap();

        let err = store.insert_job(&job).await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn claim_one_respects_priority_then_created_at() {
        let store = test_store().await;
        let now = Utc::now();

        let mut low = Job::new(NewJob::from_command("echo A"), now);
        low.priority = 0;
        let mut high = Job::new(NewJob::from_command("echo B"), now + chrono::Duration::seconds(1));
        high.priority = 5;

        store.insert_job(&low).await.unwrap();
        store.insert_job(&high).await.unwrap();

        let claimed = store.claim_one(now + chrono::Duration::seconds(2)).await.unwrap().unwrap();
        assert_eq!(claimed.id, high.id);
        assert_eq!(claimed.state, JobState::Processing);
    }

    #[tokio::test]
    async fn claim_one_skips_unready_scheduled_jobs() {
        let store = test_store().await;
        let now = Utc::now();
        let mut job = Job::new(NewJob::from_command("echo later"), now);
        job.run_at = Some(now + chrono::Duration::seconds(5));
        store.insert_job(&job).await.unwrap();

        assert!(store.claim_one(now + chrono::Duration::seconds(1)).await.unwrap().is_none());
        let claimed = store
            .claim_one(now + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test]
    async fn concurrent_claims_never_double_dispatch() {
        let store = test_store().await;
        let now = Utc::now();
        for i in 0..10 {
            let job = Job::new(NewJob::from_command(format!("echo {i}")), now);
            store.insert_job(&job).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim_one(now).await.unwrap() }));
        }

        let mut claimed_ids = std::collections::HashSet::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap() {
                assert!(claimed_ids.insert(job.id), "job claimed twice");
            }
        }
        assert_eq!(claimed_ids.len(), 10);
    }
}
