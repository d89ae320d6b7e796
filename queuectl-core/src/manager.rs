use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::error::{QueueError, Result};
use crate::store::Store;
use crate::types::{Job, JobFilter, JobState, Metrics, NewJob, Stats};

/// High-level API over the [`Store`]: enqueue, claim, finalize, stats, DLQ
/// operations, output log archival. This is the surface workers and any
/// enqueuing collaborator (CLI, API - both out of scope here) are meant to
/// use; nothing outside this module talks to the store directly.
#[derive(Clone)]
pub struct QueueManager {
    store: Store,
    config: Config,
    data_dir: PathBuf,
}

impl QueueManager {
    pub async fn new(store: Store, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let config = Config::new(store.pool()).await?;
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(data_dir.join("logs")).await?;
        Ok(Self {
            store,
            config,
            data_dir,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Enqueues a new job. Fields absent from `init` (when constructed via
    /// [`NewJob::from_command`]) use the hardcoded field defaults rather than
    /// `Config`, matching the source's `Job.__init__` defaults; `Config` only
    /// governs retry/poll *behavior*, not per-job field defaults.
    pub async fn enqueue(&self, init: NewJob) -> Result<Job> {
        init.validate().map_err(QueueError::InvalidJob)?;
        let job = Job::new(init, Utc::now());
        self.store.insert_job(&job).await?;
        Ok(job)
    }

    /// Claims the next eligible job, per the claim algorithm in [`Store::claim_one`].
    pub async fn claim(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        self.store.claim_one(now).await
    }

    /// Records a successful execution: truncates `stdout` into the job's
    /// `output` summary, computes `execution_time`, archives the full streams
    /// to the per-job log file, and persists.
    pub async fn complete_job(
        &self,
        mut job: Job,
        stdout: &str,
        stderr: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        self.archive_output(&job.id, stdout, stderr, now).await?;
        job.mark_completed(stdout, now);
        self.store.update_job(&job).await?;
        Ok(job)
    }

    /// Records a failed execution (nonzero exit, timeout, or spawn error):
    /// applies the retry/dead-letter transition and archives the captured
    /// streams (even on failure - the full output is valuable for debugging).
    pub async fn fail_job(
        &self,
        mut job: Job,
        error_message: impl Into<String>,
        stdout: &str,
        stderr: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        self.archive_output(&job.id, stdout, stderr, now).await?;
        let backoff_base = self.config.backoff_base().await?;
        job.mark_for_retry(error_message, backoff_base, now);
        self.store.update_job(&job).await?;
        if job.state == JobState::Dead {
            self.store
                .record_metric("dead_lettered", None, Some(&job.id), now)
                .await?;
        }
        Ok(job)
    }

    /// Writes `<data>/logs/<job_id>.log` with a header and
    /// `--- STDOUT ---` / `--- STDERR ---` sections.
    async fn archive_output(
        &self,
        job_id: &str,
        stdout: &str,
        stderr: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let path = self.log_path(job_id);
        let mut contents = String::new();
        contents.push_str("=== Job Output Log ===\n");
        contents.push_str(&format!("Job ID: {job_id}\n"));
        contents.push_str(&format!("Timestamp: {}\n\n", now.to_rfc3339()));
        contents.push_str("--- STDOUT ---\n");
        contents.push_str(stdout);
        contents.push_str("\n\n--- STDERR ---\n");
        contents.push_str(stderr);
        contents.push('\n');

        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(contents.as_bytes()).await?;
        Ok(())
    }

    pub fn log_path(&self, job_id: &str) -> PathBuf {
        self.data_dir.join("logs").join(format!("{job_id}.log"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.store.get_job(id).await
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        self.store.list_jobs(&filter).await
    }

    pub async fn dlq_jobs(&self) -> Result<Vec<Job>> {
        self.store
            .list_jobs(&JobFilter {
                state: Some(JobState::Dead),
                priority: None,
            })
            .await
    }

    /// Operator-initiated retry of a `dead` job. Returns `QueueError::NotDead`
    /// (without mutating anything) if the job isn't currently dead - retrying
    /// a dead job is idempotent, retrying anything else is a no-op error.
    pub async fn retry_dlq_job(&self, id: &str) -> Result<Job> {
        let mut job = self
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| QueueError::UnknownJobId(id.to_string()))?;

        if job.state != JobState::Dead {
            return Err(QueueError::NotDead(id.to_string()));
        }

        job.mark_dlq_retry(Utc::now());
        self.store.update_job(&job).await?;
        Ok(job)
    }

    pub async fn stats(&self) -> Result<Stats> {
        self.store.count_by_state().await
    }

    /// `{avg_execution_time, success_rate, jobs_last_24h, priority_dist}`,
    /// matching `queue_manager.py::get_metrics` exactly: success rate is
    /// `completed / total * 100`, zero with no jobs at all.
    pub async fn metrics(&self) -> Result<Metrics> {
        let (avg_execution_time, completed, total, priority_dist) =
            self.store.aggregate_metrics().await?;
        let jobs_last_24h = self.store.jobs_last_24h().await?;

        let success_rate = if total > 0 {
            completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Ok(Metrics {
            avg_execution_time,
            success_rate,
            jobs_last_24h,
            priority_dist: priority_dist.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_manager() -> (QueueManager, tempfile_like::TempDataDir) {
        // Pinned to one connection: a plain `:memory:` database is per-connection,
        // so a multi-connection pool would scatter writes/reads across
        // independent empty databases.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Store::new(pool).await.unwrap();
        let dir = tempfile_like::TempDataDir::new();
        let manager = QueueManager::new(store, dir.path()).await.unwrap();
        (manager, dir)
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_command() {
        let (manager, _dir) = test_manager().await;
        let err = manager
            .enqueue(NewJob::from_command(""))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidJob(_)));
    }

    #[tokio::test]
    async fn happy_path_completes_with_output_summary() {
        let (manager, _dir) = test_manager().await;
        let job = manager.enqueue(NewJob::from_command("echo hi")).await.unwrap();
        let claimed = manager.claim(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);

        let completed = manager
            .complete_job(claimed, "hi\n", "", Utc::now())
            .await
            .unwrap();
        assert_eq!(completed.state, JobState::Completed);
        assert!(completed.output.unwrap().starts_with("hi"));
        assert!(completed.execution_time.unwrap() >= 0.0);

        let log = tokio::fs::read_to_string(manager.log_path(&job.id)).await.unwrap();
        assert!(log.contains("--- STDOUT ---"));
        assert!(log.contains("hi"));
    }

    #[tokio::test]
    async fn exhaustion_reaches_dead_with_no_next_retry() {
        let (manager, _dir) = test_manager().await;
        let mut init = NewJob::from_command("false");
        init.max_retries = 2;
        let job = manager.enqueue(init).await.unwrap();

        let claimed = manager.claim(Utc::now()).await.unwrap().unwrap();
        let job = manager
            .fail_job(claimed, "Exit code: 1", "", "", Utc::now())
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Failed);

        let claimed = manager
            .claim(Utc::now() + chrono::Duration::seconds(10))
            .await
            .unwrap()
            .unwrap();
        let job = manager
            .fail_job(claimed, "Exit code: 1", "", "", Utc::now())
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 2);
        assert!(job.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn dlq_retry_is_idempotent_and_rejects_non_dead() {
        let (manager, _dir) = test_manager().await;
        let mut init = NewJob::from_command("false");
        init.max_retries = 1;
        let job = manager.enqueue(init).await.unwrap();

        let err = manager.retry_dlq_job(&job.id).await.unwrap_err();
        assert!(matches!(err, QueueError::NotDead(_)));

        let claimed = manager.claim(Utc::now()).await.unwrap().unwrap();
        let dead = manager
            .fail_job(claimed, "boom", "", "", Utc::now())
            .await
            .unwrap();
        assert_eq!(dead.state, JobState::Dead);

        let retried = manager.retry_dlq_job(&dead.id).await.unwrap();
        assert_eq!(retried.state, JobState::Pending);
        assert_eq!(retried.attempts, 0);
    }

    #[tokio::test]
    async fn metrics_success_rate_is_zero_with_no_jobs() {
        let (manager, _dir) = test_manager().await;
        let metrics = manager.metrics().await.unwrap();
        assert_eq!(metrics.success_rate, 0.0);
        assert_eq!(metrics.avg_execution_time, 0.0);
    }

    /// A tiny self-contained temp-dir helper so these tests don't pull in an
    /// extra dev-dependency just for a directory that cleans itself up.
    mod tempfile_like {
        use std::path::{Path, PathBuf};

        pub struct TempDataDir(PathBuf);

        impl TempDataDir {
            pub fn new() -> Self {
                let dir = std::env::temp_dir().join(format!(
                    "queuectl-test-{}",
                    uuid::Uuid::new_v4()
                ));
                std::fs::create_dir_all(&dir).unwrap();
                Self(dir)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDataDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }
}
