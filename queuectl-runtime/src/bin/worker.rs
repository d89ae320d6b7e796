use envconfig::Envconfig;
use queuectl_core::{QueueManager, Store};
use queuectl_runtime::{Config, Worker};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("failed to load configuration from env");
    tracing_subscriber::fmt::init();

    let worker_id = config.worker_id();
    info!(worker_id = %worker_id, "starting worker");

    let pool = config
        .pool_config()
        .connect()
        .await
        .expect("failed to connect to store");
    let store = Store::new(pool).await.expect("failed to initialize store");
    let manager = QueueManager::new(store, &config.data_dir)
        .await
        .expect("failed to initialize queue manager");

    let worker = Worker::new(worker_id, manager);
    let poll_override = config.worker_poll_interval_seconds.map(std::time::Duration::from_secs);

    if let Err(err) = worker.run(poll_override).await {
        error!(error = %err, "worker exited with error");
        std::process::exit(1);
    }
}
