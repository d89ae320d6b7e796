use envconfig::Envconfig;
use queuectl_core::{QueueManager, Reaper, Store};
use queuectl_runtime::{Config, Supervisor};
use tracing::{error, info, warn};

/// Runs the periodic reaper pass on the supervisor's own tick (the supervisor
/// is the one long-lived process guaranteed to outlive any individual worker
/// crash), independent of the workers it spawns.
async fn reaper_loop(reaper: Reaper, interval_secs: u64) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    loop {
        interval.tick().await;
        match reaper.reclaim_orphans().await {
            Ok(0) => {}
            Ok(reclaimed) => info!(reclaimed, "reaper reclaimed orphaned jobs"),
            Err(err) => warn!(error = %err, "reaper pass failed"),
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("failed to load configuration from env");
    tracing_subscriber::fmt::init();

    std::fs::create_dir_all(&config.data_dir).expect("failed to create data directory");

    let pool = config
        .pool_config()
        .connect()
        .await
        .expect("failed to connect to store");
    let store = Store::new(pool).await.expect("failed to initialize store");
    let manager = QueueManager::new(store, &config.data_dir)
        .await
        .expect("failed to initialize queue manager");
    let reaper = Reaper::new(manager, config.reaper_grace_seconds);

    info!(
        count = config.worker_count,
        pid_file = %config.pid_file_path(),
        "supervisor starting workers"
    );

    let worker_env = vec![
        ("QUEUECTL_DATA_DIR".to_string(), config.data_dir.clone()),
        (
            "QUEUECTL_DB_MAX_CONNECTIONS".to_string(),
            config.db_max_connections.to_string(),
        ),
        (
            "QUEUECTL_DB_BUSY_TIMEOUT_SECONDS".to_string(),
            config.db_busy_timeout_seconds.to_string(),
        ),
    ];

    let supervisor = match Supervisor::spawn(config.worker_count, config.pid_file_path(), &worker_env) {
        Ok(s) => s,
        Err(err) => {
            error!(error = %err, "failed to spawn workers");
            std::process::exit(1);
        }
    };

    let reaper_task = tokio::spawn(reaper_loop(reaper, config.reaper_interval_seconds));

    tokio::select! {
        res = supervisor.run_until_shutdown() => {
            if let Err(err) = res {
                error!(error = %err, "supervisor exited with error");
                std::process::exit(1);
            }
        }
        _ = reaper_task => {
            error!("reaper loop exited unexpectedly");
        }
    }

    info!("supervisor exiting");
}
