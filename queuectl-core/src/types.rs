use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(format!("{other} is not a valid job state")),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The first 500 bytes of captured stdout kept as a summary on a completed job.
/// Full output always lives in the per-job log file, never only in the record.
pub const OUTPUT_SUMMARY_BYTES: usize = 500;

/// The chunk of data needed to enqueue a job. `id` is optional - when absent the
/// store generates a UUIDv7; when present it must be unique or insertion fails
/// with `QueueError::DuplicateId`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewJob {
    pub id: Option<String>,
    pub command: String,
    pub max_retries: i64,
    pub priority: i64,
    pub timeout_seconds: i64,
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Builds a `NewJob` from just a command, filling every other field with
    /// the defaults recognized by [`crate::config::Config`].
    pub fn from_command(command: impl Into<String>) -> Self {
        Self {
            id: None,
            command: command.into(),
            max_retries: 3,
            priority: 0,
            timeout_seconds: 300,
            run_at: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("command must not be empty".to_string());
        }
        if self.timeout_seconds <= 0 {
            return Err("timeout must be a positive number of seconds".to_string());
        }
        Ok(())
    }
}

/// A durable job record. `priority` and every timestamp field are always
/// present - there is no reduced legacy shape to defend against on read.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    pub max_retries: i64,
    pub priority: i64,
    pub timeout_seconds: i64,
    pub run_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub output: Option<String>,
    pub execution_time: Option<f64>,
}

impl Job {
    pub fn new(init: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: init.id.unwrap_or_else(|| Uuid::now_v7().to_string()),
            command: init.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: init.max_retries,
            priority: init.priority,
            timeout_seconds: init.timeout_seconds,
            run_at: init.run_at,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            output: None,
            execution_time: None,
        }
    }

    /// `backoff_base ^ attempts`, evaluated after `attempts` has already been
    /// incremented for the failing attempt - matches the source's integer
    /// exponentiation exactly (no jitter, no ceiling).
    pub fn retry_delay(&self, backoff_base: i64) -> Duration {
        let delay_secs = backoff_base.saturating_pow(self.attempts as u32);
        Duration::seconds(delay_secs)
    }

    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_retries
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        let state_ready = matches!(self.state, JobState::Pending | JobState::Failed);
        let retry_ready = self.next_retry_at.map(|t| t <= now).unwrap_or(true);
        let scheduled_ready = self.run_at.map(|t| t <= now).unwrap_or(true);
        state_ready && retry_ready && scheduled_ready
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Processing;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// `output` is truncated to [`OUTPUT_SUMMARY_BYTES`]; the full stream is
    /// expected to already have been archived to the per-job log file.
    pub fn mark_completed(&mut self, output: &str, now: DateTime<Utc>) {
        let started = self.started_at.unwrap_or(now);
        self.state = JobState::Completed;
        self.output = Some(truncate_utf8(output, OUTPUT_SUMMARY_BYTES));
        self.completed_at = Some(now);
        self.updated_at = now;
        self.execution_time = Some((now - started).num_milliseconds() as f64 / 1000.0);
    }

    /// Applies the failure branch of the state machine: increments `attempts`,
    /// then either schedules a retry (`failed`) or dead-letters the job.
    /// `error_message` is truncated the same as `output` - an unbounded
    /// stderr capture must not persist in full in the job record.
    pub fn mark_for_retry(&mut self, error_message: impl Into<String>, backoff_base: i64, now: DateTime<Utc>) {
        self.attempts += 1;
        self.error_message = Some(truncate_utf8(&error_message.into(), OUTPUT_SUMMARY_BYTES));
        self.updated_at = now;
        if self.should_retry() {
            self.state = JobState::Failed;
            self.next_retry_at = Some(now + self.retry_delay(backoff_base));
        } else {
            self.state = JobState::Dead;
            self.next_retry_at = None;
        }
    }

    /// Resets a dead job back to pending, as if freshly enqueued. Identity and
    /// history timestamps (`created_at`, `started_at`, `completed_at`) are kept.
    pub fn mark_dlq_retry(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Pending;
        self.attempts = 0;
        self.next_retry_at = None;
        self.error_message = None;
        self.updated_at = now;
    }

    /// Orphan reclamation: a job stuck in `processing` because its worker died.
    /// Goes through the same failure bookkeeping a normal failed attempt would.
    pub fn mark_orphaned(&mut self, backoff_base: i64, now: DateTime<Utc>) {
        self.mark_for_retry("orphaned", backoff_base, now);
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Filter for [`crate::store::Store::list_jobs`] / [`crate::manager::QueueManager::list_jobs`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub priority: Option<i64>,
}

/// Per-state job counts, as returned by `stats()`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
}

/// The aggregate view consumed by the (out-of-scope) dashboard collaborator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Metrics {
    pub avg_execution_time: f64,
    pub success_rate: f64,
    pub jobs_last_24h: i64,
    pub priority_dist: std::collections::BTreeMap<i64, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_at(now: DateTime<Utc>) -> Job {
        Job::new(NewJob::from_command("echo hi"), now)
    }

    #[test]
    fn retry_delay_is_integer_exponentiation() {
        let mut job = job_at(Utc::now());
        job.attempts = 1;
        assert_eq!(job.retry_delay(2), Duration::seconds(2));
        job.attempts = 2;
        assert_eq!(job.retry_delay(2), Duration::seconds(4));
    }

    #[test]
    fn mark_for_retry_schedules_retry_until_exhausted() {
        let now = Utc::now();
        let mut job = job_at(now);
        job.max_retries = 2;

        job.mark_for_retry("boom", 2, now);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.next_retry_at, Some(now + Duration::seconds(2)));

        job.mark_for_retry("boom again", 2, now);
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 2);
        assert!(job.next_retry_at.is_none());
    }

    #[test]
    fn mark_for_retry_truncates_error_message() {
        let now = Utc::now();
        let mut job = job_at(now);
        let huge = "e".repeat(OUTPUT_SUMMARY_BYTES + 50);
        job.mark_for_retry(huge, 2, now);
        assert_eq!(job.error_message.unwrap().len(), OUTPUT_SUMMARY_BYTES);
    }

    #[test]
    fn dlq_retry_resets_attempts_and_keeps_identity() {
        let now = Utc::now();
        let mut job = job_at(now);
        job.max_retries = 1;
        job.mark_for_retry("boom", 2, now);
        assert_eq!(job.state, JobState::Dead);

        let id_before = job.id.clone();
        job.mark_dlq_retry(now);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.next_retry_at.is_none());
        assert!(job.error_message.is_none());
        assert_eq!(job.id, id_before);
    }

    #[test]
    fn is_ready_respects_run_at_and_next_retry_at() {
        let now = Utc::now();
        let mut job = job_at(now);
        job.run_at = Some(now + Duration::seconds(5));
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + Duration::seconds(5)));

        job.run_at = None;
        job.state = JobState::Failed;
        job.next_retry_at = Some(now + Duration::seconds(2));
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + Duration::seconds(2)));
    }

    #[test]
    fn mark_completed_truncates_output_summary() {
        let now = Utc::now();
        let mut job = job_at(now);
        job.mark_processing(now);
        let huge = "x".repeat(OUTPUT_SUMMARY_BYTES + 50);
        job.mark_completed(&huge, now + Duration::seconds(1));
        assert_eq!(job.output.unwrap().len(), OUTPUT_SUMMARY_BYTES);
        assert_eq!(job.execution_time, Some(1.0));
    }
}
