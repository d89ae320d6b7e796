// We do this pattern (privately use a module, then re-export parts of it) so we can
// refactor/rename or generally futz around with the internals without breaking the public API

mod config;
pub use config::{Config, PoolConfig};

mod error;
pub use error::QueueError;

mod types;
pub use types::{Job, JobFilter, JobState, Metrics, NewJob, Stats, OUTPUT_SUMMARY_BYTES};

mod store;
pub use store::Store;

mod manager;
pub use manager::QueueManager;

mod reaper;
pub use reaper::Reaper;
