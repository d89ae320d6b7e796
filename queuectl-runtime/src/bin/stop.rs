use envconfig::Envconfig;
use queuectl_runtime::supervisor::stop_from_pid_file;
use queuectl_runtime::Config;
use tracing::{error, info};

/// Standalone stop invocation: reads the pid file the supervisor wrote on
/// start, sends SIGTERM to each listed worker (tolerating ones that already
/// exited), and removes the file. Does not touch the store.
fn main() {
    let config = Config::init_from_env().expect("failed to load configuration from env");
    tracing_subscriber::fmt::init();

    match stop_from_pid_file(&config.pid_file_path()) {
        Ok(signaled) => info!(signaled, pid_file = %config.pid_file_path(), "sent shutdown signal to workers"),
        Err(err) => {
            error!(error = %err, "failed to stop workers");
            std::process::exit(1);
        }
    }
}
