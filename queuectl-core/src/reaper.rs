use chrono::Utc;
use tracing::{info, warn};

use crate::error::Result;
use crate::manager::QueueManager;
use crate::types::JobState;

/// Rescues jobs stuck in `processing` because the worker holding them
/// crashed before it could finalize the record. The base claim protocol has
/// no heartbeat, so "orphaned" here means purely that `started_at + timeout +
/// grace` has elapsed - resolved deliberately in favor of a single wall-clock
/// deadline rather than a heartbeat scheme, since a worker never yields
/// control mid-subprocess for anything shorter than its own timeout anyway.
pub struct Reaper {
    manager: QueueManager,
    grace_seconds: i64,
}

impl Reaper {
    pub fn new(manager: QueueManager, grace_seconds: i64) -> Self {
        Self {
            manager,
            grace_seconds,
        }
    }

    /// Runs one reclamation pass, returning the number of jobs reclaimed.
    /// Each orphan goes through ordinary failure bookkeeping (retry or
    /// dead-letter, per `max_retries`), exactly as if its own worker had
    /// reported the failure.
    pub async fn reclaim_orphans(&self) -> Result<u64> {
        let now = Utc::now();
        let orphaned = self.manager.store().find_orphaned(now, self.grace_seconds).await?;

        let mut reclaimed = 0u64;
        for mut job in orphaned {
            debug_assert_eq!(job.state, JobState::Processing);
            let backoff_base = self.manager.config().backoff_base().await?;
            job.mark_orphaned(backoff_base, now);
            match self.manager.store().update_job(&job).await {
                Ok(()) => {
                    reclaimed += 1;
                    info!(job_id = %job.id, new_state = %job.state, "reclaimed orphaned job");
                }
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "failed to reclaim orphaned job");
                }
            }
        }

        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::types::{Job, NewJob};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_manager() -> QueueManager {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Store::new(pool).await.unwrap();
        let dir = std::env::temp_dir().join(format!("queuectl-reaper-test-{}", uuid::Uuid::new_v4()));
        QueueManager::new(store, dir).await.unwrap()
    }

    #[tokio::test]
    async fn reclaims_jobs_stuck_past_timeout_plus_grace() {
        let manager = test_manager().await;
        let now = Utc::now();

        let mut init = NewJob::from_command("sleep 1000");
        init.timeout_seconds = 5;
        init.max_retries = 3;
        let mut job = Job::new(init, now - chrono::Duration::seconds(60));
        job.mark_processing(now - chrono::Duration::seconds(60));
        manager.store().insert_job(&job).await.unwrap();

        let reaper = Reaper::new(manager.clone(), 10);
        let reclaimed = reaper.reclaim_orphans().await.unwrap();
        assert_eq!(reclaimed, 1);

        let refetched = manager.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(refetched.state, JobState::Failed);
        assert_eq!(refetched.attempts, 1);
        assert_eq!(refetched.error_message.as_deref(), Some("orphaned"));
    }

    #[tokio::test]
    async fn leaves_fresh_processing_jobs_alone() {
        let manager = test_manager().await;
        let now = Utc::now();

        let mut init = NewJob::from_command("sleep 5");
        init.timeout_seconds = 300;
        let mut job = Job::new(init, now);
        job.mark_processing(now);
        manager.store().insert_job(&job).await.unwrap();

        let reaper = Reaper::new(manager.clone(), 30);
        assert_eq!(reaper.reclaim_orphans().await.unwrap(), 0);
    }
}
