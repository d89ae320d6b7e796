use std::process::{Child, Command as StdCommand};
use std::time::Duration as StdDuration;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::error::{Result, RuntimeError};

const POLL_INTERVAL: StdDuration = StdDuration::from_millis(200);

/// Spawns N worker processes (OS-level processes, not cooperative tasks) and
/// tracks their identities in the well-known PID file, so that a separate
/// stop invocation can signal them without sharing any in-memory state with
/// this process. Children are kept as `std::process::Child` purely so
/// `try_wait` can reap them as they exit; signaling is still done by raw pid
/// (via `kill`), since `Child` has no portable "send this signal" method.
pub struct Supervisor {
    children: Vec<Child>,
    pid_file: String,
}

impl Supervisor {
    pub fn spawn(count: usize, pid_file: String, worker_env: &[(String, String)]) -> Result<Self> {
        let worker_bin = worker_binary_path()?;
        let mut children = Vec::with_capacity(count);

        for _ in 0..count {
            let mut command = StdCommand::new(&worker_bin);
            for (key, value) in worker_env {
                command.env(key, value);
            }
            children.push(command.spawn().map_err(RuntimeError::Spawn)?);
        }

        let contents: String = children
            .iter()
            .map(|c| c.id().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        std::fs::write(&pid_file, contents + "\n")?;

        info!(count, pid_file = %pid_file, "supervisor spawned workers");
        Ok(Self { children, pid_file })
    }

    /// Waits for every worker to exit on its own (they only do so after their
    /// own shutdown signal), or until this process receives one itself - in
    /// which case it fans SIGTERM out to every worker and joins with no
    /// further timeout before returning.
    pub async fn run_until_shutdown(mut self) -> Result<()> {
        let mut term = signal(SignalKind::terminate())?;
        let pids: Vec<u32> = self.children.iter().map(|c| c.id()).collect();

        tokio::select! {
            _ = term.recv() => {
                info!(?pids, "supervisor received SIGTERM, shutting down workers");
                terminate_all(&pids);
            }
            _ = tokio::signal::ctrl_c() => {
                info!(?pids, "supervisor received SIGINT, shutting down workers");
                terminate_all(&pids);
            }
            _ = wait_until_all_exited(&mut self.children) => {
                info!(?pids, "all workers exited on their own");
            }
        }

        // Reap whichever children the losing race branch didn't already wait
        // on - e.g. after a signal-triggered terminate, or stragglers once
        // the winning branch above returns.
        wait_until_all_exited(&mut self.children).await;

        let _ = std::fs::remove_file(&self.pid_file);
        Ok(())
    }
}

fn terminate_all(pids: &[u32]) {
    for &pid in pids {
        if let Err(err) = send_sigterm(pid) {
            warn!(pid, error = %err, "failed to signal worker, may have already exited");
        }
    }
}

/// Reads a PID file written by `Supervisor::spawn` and sends SIGTERM to each
/// listed process, tolerating PIDs that have already exited. Deletes the
/// file afterward - used by the standalone "stop" invocation.
pub fn stop_from_pid_file(pid_file: &str) -> Result<usize> {
    let contents = match std::fs::read_to_string(pid_file) {
        Ok(c) => c,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };

    let mut signaled = 0;
    for line in contents.lines() {
        let Ok(pid) = line.trim().parse::<u32>() else {
            continue;
        };
        match send_sigterm(pid) {
            Ok(()) => signaled += 1,
            Err(err) => warn!(pid, error = %err, "worker already exited or unreachable"),
        }
    }

    std::fs::remove_file(pid_file)?;
    Ok(signaled)
}

/// Polls every child with `try_wait`, which both checks liveness and reaps
/// the process the moment it exits - unlike signaling by pid, this must go
/// through `Child` itself or exited workers would sit as zombies until this
/// process exits.
async fn wait_until_all_exited(children: &mut [Child]) {
    loop {
        let all_exited = children
            .iter_mut()
            .all(|child| matches!(child.try_wait(), Ok(Some(_))));
        if all_exited {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn send_sigterm(pid: u32) -> std::io::Result<()> {
    let status = StdCommand::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("kill -TERM {pid} exited with {status}"),
        ))
    }
}

fn worker_binary_path() -> Result<std::path::PathBuf> {
    let mut path = std::env::current_exe()?;
    path.set_file_name("worker");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_pid_file(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("queuectl-supervisor-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn stop_on_missing_pid_file_is_a_no_op() {
        let path = temp_pid_file("missing");
        let _ = std::fs::remove_file(&path);
        let signaled = stop_from_pid_file(path.to_str().unwrap()).unwrap();
        assert_eq!(signaled, 0);
    }

    #[test]
    fn stop_signals_a_real_child_and_removes_the_file() {
        let path = temp_pid_file("real-child");
        let mut child = StdCommand::new("sleep").arg("5").spawn().unwrap();
        std::fs::write(&path, format!("{}\n", child.id())).unwrap();

        let signaled = stop_from_pid_file(path.to_str().unwrap()).unwrap();
        assert_eq!(signaled, 1);
        assert!(!path.exists());

        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn stop_tolerates_already_exited_pids() {
        let path = temp_pid_file("already-exited");
        let mut child = StdCommand::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        std::fs::write(&path, format!("{pid}\n")).unwrap();

        // A reaped pid may already have been recycled by the OS; either a
        // clean signal or a "no such process" failure is an acceptable
        // outcome, the file must still be cleaned up.
        let _ = stop_from_pid_file(path.to_str().unwrap());
        assert!(!path.exists());
    }
}
