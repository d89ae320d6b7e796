use envconfig::Envconfig;
use queuectl_core::PoolConfig;
use uuid::Uuid;

/// Process-level settings shared by the `worker`, `supervisor`, and `stop`
/// binaries, loaded from the environment at startup, split from the durable
/// operator-tunable config (see `queuectl_core::Config`) that only makes
/// sense at boot.
#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "QUEUECTL_DATA_DIR", default = "data")]
    pub data_dir: String,

    #[envconfig(from = "QUEUECTL_DB_MAX_CONNECTIONS", default = "5")]
    pub db_max_connections: u32,

    #[envconfig(from = "QUEUECTL_DB_ACQUIRE_TIMEOUT_SECONDS", default = "30")]
    pub db_acquire_timeout_seconds: u64,

    #[envconfig(from = "QUEUECTL_DB_BUSY_TIMEOUT_SECONDS", default = "30")]
    pub db_busy_timeout_seconds: u64,

    /// Overrides the durable `worker_poll_interval` config value when set;
    /// otherwise the worker reads it from the store on every idle loop.
    pub worker_poll_interval_seconds: Option<u64>,

    #[envconfig(from = "QUEUECTL_WORKER_COUNT", default = "4")]
    pub worker_count: usize,

    #[envconfig(from = "QUEUECTL_REAPER_GRACE_SECONDS", default = "30")]
    pub reaper_grace_seconds: i64,

    #[envconfig(from = "QUEUECTL_REAPER_INTERVAL_SECONDS", default = "15")]
    pub reaper_interval_seconds: u64,

    pub worker_id: Option<String>,
}

impl Config {
    pub fn db_path(&self) -> String {
        format!("{}/queuectl.db", self.data_dir)
    }

    pub fn pool_config(&self) -> PoolConfig {
        let mut pool = PoolConfig::new(self.db_path());
        pool.max_connections = Some(self.db_max_connections);
        pool.acquire_timeout_seconds = Some(self.db_acquire_timeout_seconds);
        pool.busy_timeout_seconds = Some(self.db_busy_timeout_seconds);
        pool
    }

    pub fn pid_file_path(&self) -> String {
        format!("{}/workers.pid", self.data_dir)
    }

    pub fn worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string())
    }
}
