use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use queuectl_core::{Job, QueueManager};
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::error::Result;

/// A single-threaded, cooperative poll/claim/execute loop running as its own
/// OS process. Shutdown is graceful: a SIGINT/SIGTERM sets a flag checked at
/// the top of each iteration, and the current job (if any) always runs to
/// completion - there is no mid-job subprocess cancellation, because killing
/// a child mid-execution would leave its job record stuck in `processing`.
pub struct Worker {
    id: String,
    manager: QueueManager,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(id: String, manager: QueueManager) -> Self {
        Self {
            id,
            manager,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs until a shutdown signal arrives and the in-flight job (if any)
    /// completes. `poll_interval_override` takes precedence over the durable
    /// `worker_poll_interval` config value when set.
    pub async fn run(&self, poll_interval_override: Option<StdDuration>) -> Result<()> {
        self.install_signal_handlers();
        info!(worker_id = %self.id, "worker started");

        self.manager
            .store()
            .upsert_worker(&self.id, std::process::id() as i64, "idle", Utc::now())
            .await?;

        while !self.shutdown.load(Ordering::SeqCst) {
            let now = Utc::now();
            match self.manager.claim(now).await? {
                Some(job) => {
                    self.manager
                        .store()
                        .set_worker_status(&self.id, "busy", Some(&job.id))
                        .await?;
                    self.process_job(job).await?;
                    self.manager.store().set_worker_status(&self.id, "idle", None).await?;
                }
                None => {
                    let interval = match poll_interval_override {
                        Some(d) => d,
                        None => StdDuration::from_secs(self.manager.config().worker_poll_interval().await?),
                    };
                    tokio::time::sleep(interval).await;
                }
            }
        }

        self.manager.store().set_worker_status(&self.id, "stopped", None).await?;
        info!(worker_id = %self.id, "worker stopped");
        Ok(())
    }

    fn install_signal_handlers(&self) {
        let shutdown = self.shutdown.clone();
        let worker_id = self.id.clone();
        tokio::spawn(async move {
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(err) => {
                    error!(worker_id = %worker_id, error = %err, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = term.recv() => info!(worker_id = %worker_id, "received SIGTERM, draining"),
                _ = tokio::signal::ctrl_c() => info!(worker_id = %worker_id, "received SIGINT, draining"),
            }
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    async fn process_job(&self, job: Job) -> Result<()> {
        info!(job_id = %job.id, command = %job.command, "executing job");
        let timeout = StdDuration::from_secs(job.timeout_seconds.max(0) as u64);

        match tokio::time::timeout(timeout, run_command(&job.command)).await {
            Ok(Ok(output)) if output.success => {
                self.manager
                    .complete_job(job, &output.stdout, &output.stderr, Utc::now())
                    .await?;
            }
            Ok(Ok(output)) => {
                let message = if !output.stderr.is_empty() {
                    output.stderr.clone()
                } else {
                    format!("Exit code: {}", output.exit_code)
                };
                let job_id = job.id.clone();
                let updated = self
                    .manager
                    .fail_job(job, message, &output.stdout, &output.stderr, Utc::now())
                    .await?;
                warn!(job_id = %job_id, state = %updated.state, "job failed");
            }
            Ok(Err(spawn_err)) => {
                let message = spawn_err.to_string();
                self.manager
                    .fail_job(job, message, "", "", Utc::now())
                    .await?;
            }
            Err(_elapsed) => {
                let message = format!("Command timed out after {} seconds", job.timeout_seconds);
                self.manager
                    .fail_job(job, message, "", "", Utc::now())
                    .await?;
            }
        }

        Ok(())
    }
}

struct CommandOutput {
    success: bool,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// Spawns `command` as a shell subprocess, capturing stdout/stderr as text.
/// `kill_on_drop` ensures that if this future is dropped (e.g. the enclosing
/// timeout fires) the child process does not outlive it.
async fn run_command(command: &str) -> std::io::Result<CommandOutput> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = child.wait_with_output().await?;
    Ok(CommandOutput {
        success: output.status.success(),
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let output = run_command("echo hello").await.unwrap();
        assert!(output.success);
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn captures_stderr_and_exit_code_on_failure() {
        let output = run_command("echo oops 1>&2; exit 7").await.unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, 7);
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn timeout_kills_long_running_command() {
        let result = tokio::time::timeout(
            StdDuration::from_millis(50),
            run_command("sleep 5"),
        )
        .await;
        assert!(result.is_err(), "expected the timeout to fire before the command finished");
    }
}
